//! Watch stream maintenance and frame demultiplexing.
//!
//! One task per activation keeps a single server-push stream open for
//! the realtime attachment set:
//!
//! ```text
//!        ┌─────────── restart signal (attach/detach) ───────────┐
//!        ▼                                                      │
//!  read key set ──► open WatchDocuments ──► frames ──► demux ───┤
//!        ▲                                    │                 │
//!        │                                end/error             │
//!        └──────── reconnect_stream_delay ◄───┴── Disconnected event
//! ```
//!
//! The restart channel holds one slot; attach and detach post into it
//! and the task drains pending signals before reopening, so bursts of
//! registry changes collapse into a single resubscription. Closing the
//! channel (deactivation) shuts the task down, dropping any open
//! stream with it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::client::Core;
use crate::events::{ClientEvent, PeersByDocument, StreamConnectionStatus};
use crate::rpc::{Peer, WatchDocumentsRequest, WatchEvent, WatchEventType, WatchFrame};

/// Why the frame loop stopped.
enum StreamExit {
    /// Stream ended or errored; reconnect after the backoff.
    Lost,
    /// Registry changed; resubscribe immediately.
    Restart,
    /// Client deactivated; exit the task.
    Shutdown,
}

pub(crate) async fn run(
    core: Arc<Core>,
    epoch: u64,
    generation: u64,
    mut restart_rx: mpsc::Receiver<()>,
) {
    log::debug!("watch loop started");
    loop {
        // Coalesce restart requests that queued up while we were busy;
        // the key set is read fresh below.
        while restart_rx.try_recv().is_ok() {}

        let (keys, member) = {
            let st = core.state.read().await;
            if !st.is_watch_current(epoch, generation) {
                break;
            }
            let id = match &st.server_id {
                Some(id) => id.to_hex(),
                None => break,
            };
            (
                st.realtime_keys(),
                Peer {
                    id,
                    metadata: core.metadata.clone(),
                },
            )
        };

        if keys.is_empty() {
            // Nothing to watch; park until an attach wakes us.
            match restart_rx.recv().await {
                Some(()) => continue,
                None => break,
            }
        }

        let req = WatchDocumentsRequest {
            client: member,
            document_keys: keys.clone(),
        };
        let mut stream = match core.rpc.watch_documents(core.ctx(), req).await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("WD: failed to open watch stream: {e}");
                if !wait_reconnect(&core, &mut restart_rx).await {
                    break;
                }
                continue;
            }
        };

        {
            // A replacement task may have been spawned while the open
            // call was in flight; only the current generation may
            // claim the stream.
            let mut st = core.state.write().await;
            if !st.is_watch_current(epoch, generation) {
                break;
            }
            st.stream_connected = true;
        }
        log::debug!("watch stream open for {} documents", keys.len());

        let mut first_frame = true;
        let exit = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(frame)) => {
                        core.stats.record_watch_frame();
                        if first_frame {
                            first_frame = false;
                            core.events.publish(ClientEvent::StreamConnectionStatusChanged(
                                StreamConnectionStatus::Connected,
                            ));
                        }
                        handle_frame(&core, epoch, generation, &keys, frame).await;
                    }
                    Some(Err(e)) => {
                        log::warn!("WD: watch stream error: {e}");
                        break StreamExit::Lost;
                    }
                    None => {
                        log::debug!("WD: watch stream ended");
                        break StreamExit::Lost;
                    }
                },
                signal = restart_rx.recv() => match signal {
                    Some(()) => break StreamExit::Restart,
                    None => break StreamExit::Shutdown,
                },
            }
        };
        drop(stream);

        {
            let mut st = core.state.write().await;
            if st.watch_generation == generation {
                st.stream_connected = false;
            }
        }

        match exit {
            StreamExit::Restart => continue,
            StreamExit::Shutdown => break,
            StreamExit::Lost => {
                core.stats.record_stream_reconnect();
                let live = core
                    .state
                    .read()
                    .await
                    .is_watch_current(epoch, generation);
                if live {
                    core.events.publish(ClientEvent::StreamConnectionStatusChanged(
                        StreamConnectionStatus::Disconnected,
                    ));
                }
                if !wait_reconnect(&core, &mut restart_rx).await {
                    break;
                }
            }
        }
    }

    {
        let mut st = core.state.write().await;
        if st.watch_generation == generation {
            st.stream_connected = false;
        }
    }
    log::debug!("watch loop stopped");
}

/// Sit out the reconnect backoff, waking early on a restart request.
/// Returns `false` when the client shut down meanwhile.
async fn wait_reconnect(core: &Arc<Core>, restart_rx: &mut mpsc::Receiver<()>) -> bool {
    tokio::select! {
        _ = sleep(core.reconnect_stream_delay) => true,
        signal = restart_rx.recv() => signal.is_some(),
    }
}

/// Route one stream frame.
///
/// Peer-set mutations are applied before the corresponding session
/// event is published, so an observer's view of the peer map is
/// consistent with the event payload. Frames naming documents that
/// were detached in the meantime are dropped silently, as is all work
/// under a stale epoch or a superseded watch generation.
async fn handle_frame(
    core: &Arc<Core>,
    epoch: u64,
    generation: u64,
    stream_keys: &[String],
    frame: WatchFrame,
) {
    match frame {
        WatchFrame::Initialization { peers_by_doc } => {
            let payload: PeersByDocument = {
                let mut st = core.state.write().await;
                if !st.is_watch_current(epoch, generation) {
                    return;
                }
                for (key, peers) in peers_by_doc {
                    if let Some(att) = st.attachments.get_mut(&key) {
                        att.peer_clients = peers
                            .into_iter()
                            .map(|peer| (peer.id, peer.metadata))
                            .collect();
                    }
                }
                stream_keys
                    .iter()
                    .filter_map(|key| {
                        st.attachments
                            .get(key)
                            .map(|att| (key.clone(), att.peer_clients.clone()))
                    })
                    .collect()
            };
            core.events.publish(ClientEvent::PeersChanged(payload));
        }
        WatchFrame::Event(event) => handle_event(core, epoch, generation, event).await,
    }
}

async fn handle_event(core: &Arc<Core>, epoch: u64, generation: u64, event: WatchEvent) {
    let WatchEvent {
        event_type,
        publisher,
        document_keys,
    } = event;

    match event_type {
        WatchEventType::DocumentsWatched | WatchEventType::DocumentsUnwatched => {
            let payload: PeersByDocument = {
                let mut st = core.state.write().await;
                if !st.is_watch_current(epoch, generation) {
                    return;
                }
                let mut payload = PeersByDocument::new();
                for key in &document_keys {
                    if let Some(att) = st.attachments.get_mut(key) {
                        if event_type == WatchEventType::DocumentsWatched {
                            att.peer_clients
                                .insert(publisher.id.clone(), publisher.metadata.clone());
                        } else {
                            att.peer_clients.remove(&publisher.id);
                        }
                        payload.insert(key.clone(), att.peer_clients.clone());
                    }
                }
                payload
            };
            if !payload.is_empty() {
                core.events.publish(ClientEvent::PeersChanged(payload));
            }
        }
        WatchEventType::DocumentsChanged => {
            let affected: Vec<String> = {
                let mut st = core.state.write().await;
                if !st.is_watch_current(epoch, generation) {
                    return;
                }
                let mut affected = Vec::new();
                for key in &document_keys {
                    if let Some(att) = st.attachments.get_mut(key) {
                        att.remote_dirty = true;
                        affected.push(key.clone());
                    }
                }
                affected
            };
            if !affected.is_empty() {
                core.events.publish(ClientEvent::DocumentsChanged(affected));
            }
        }
    }
}
