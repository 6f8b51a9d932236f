//! The client session: lifecycle state machine, attachment registry,
//! and the user-facing API.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────── Client ────────────────────────┐
//! │ activate / deactivate / attach / detach / sync         │
//! │                    │ mutates                           │
//! │                    ▼                                   │
//! │           ClientState (status, registry)               │
//! │             │                      │                   │
//! │     reads   │                      │ restart signal    │
//! │             ▼                      ▼                   │
//! │        sync loop ──────┐      watch loop ◄── agent     │
//! │        (periodic)      │      (stream + demux)         │
//! │             └──────────┼───────────┘                   │
//! │                        ▼                               │
//! │                    EventBus ──► subscribers            │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! All state mutations go through one `RwLock`; RPC acknowledgements
//! re-check the session epoch before touching state, so responses and
//! stream frames that arrive after a deactivation are dropped without
//! side effects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::attachment::Attachment;
use crate::document::{DocumentError, DocumentHandle};
use crate::events::{ClientEvent, DocumentSyncStatus, EventBus, EventStream};
use crate::rpc::{
    ActivateClientRequest, AgentService, AttachDocumentRequest, ClientId, DeactivateClientRequest,
    DetachDocumentRequest, PresenceMetadata, RpcContext, RpcError,
};
use crate::{sync_loop, watch};

/// Session lifecycle status.
///
/// Transitions are driven solely by successful RPC acknowledgements;
/// a failed activate or deactivate leaves the status untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Deactivated,
    Activated,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Local client key; `None` generates a fresh UUID.
    pub key: Option<String>,
    /// Presence metadata advertised to peers (display name, color, ...).
    pub metadata: PresenceMetadata,
    /// Bearer token injected on every outbound RPC.
    pub auth_token: Option<String>,
    /// Period between sync loop ticks while the watch stream is up.
    pub sync_loop_interval: Duration,
    /// Backoff before reopening a lost watch stream. Doubles as the
    /// degraded sync cadence while the stream is down: without the
    /// stream there is no remote-dirty signal, so the client must not
    /// flood the agent.
    pub reconnect_stream_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            key: None,
            metadata: PresenceMetadata::new(),
            auth_token: None,
            sync_loop_interval: Duration::from_millis(50),
            reconnect_stream_delay: Duration::from_millis(1000),
        }
    }
}

/// Errors returned by client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not active")]
    NotActive,
    #[error("document `{0}` is already attached")]
    AlreadyAttached(String),
    #[error("document `{0}` is not attached")]
    NotAttached(String),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Session counters, read via [`Client::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub syncs_completed: u64,
    pub syncs_failed: u64,
    pub watch_frames: u64,
    pub stream_reconnects: u64,
}

/// Atomic counters so the loops never take a lock just to count.
pub(crate) struct AtomicClientStats {
    syncs_completed: AtomicU64,
    syncs_failed: AtomicU64,
    watch_frames: AtomicU64,
    stream_reconnects: AtomicU64,
}

impl AtomicClientStats {
    fn new() -> Self {
        Self {
            syncs_completed: AtomicU64::new(0),
            syncs_failed: AtomicU64::new(0),
            watch_frames: AtomicU64::new(0),
            stream_reconnects: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_sync_completed(&self) {
        self.syncs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sync_failed(&self) {
        self.syncs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_watch_frame(&self) {
        self.watch_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stream_reconnect(&self) {
        self.stream_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ClientStats {
        ClientStats {
            syncs_completed: self.syncs_completed.load(Ordering::Relaxed),
            syncs_failed: self.syncs_failed.load(Ordering::Relaxed),
            watch_frames: self.watch_frames.load(Ordering::Relaxed),
            stream_reconnects: self.stream_reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Mutable session state, guarded by the core's `RwLock`.
pub(crate) struct ClientState {
    pub(crate) status: ClientStatus,
    pub(crate) server_id: Option<ClientId>,
    /// Document key → attachment. Never exposed to callers.
    pub(crate) attachments: HashMap<String, Attachment>,
    /// Whether a watch stream is currently open; steers the sync
    /// loop's cadence.
    pub(crate) stream_connected: bool,
    /// Bumped on every successful activate/deactivate. Work captured
    /// under an older epoch is discarded before it can publish.
    pub(crate) epoch: u64,
    /// Bumped on every watch-task spawn. A watch task that finishes an
    /// in-flight stream open after being superseded (same epoch, e.g.
    /// a respawn after a failed deactivate) sees a newer generation
    /// and drops its stream instead of racing the replacement.
    pub(crate) watch_generation: u64,
    /// Restart signal for the watch task. `None` while deactivated;
    /// dropping the sender shuts the task down.
    pub(crate) watch_tx: Option<mpsc::Sender<()>>,
}

impl ClientState {
    fn new() -> Self {
        Self {
            status: ClientStatus::Deactivated,
            server_id: None,
            attachments: HashMap::new(),
            stream_connected: false,
            epoch: 0,
            watch_generation: 0,
            watch_tx: None,
        }
    }

    /// True while `epoch` still names the live activation.
    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.status == ClientStatus::Activated && self.epoch == epoch
    }

    /// True while the given watch-task spawn is still the one that
    /// owns the stream.
    pub(crate) fn is_watch_current(&self, epoch: u64, generation: u64) -> bool {
        self.is_current(epoch) && self.watch_generation == generation
    }

    /// Keys of every attachment the background loops drive, sorted so
    /// the subscribed key set is deterministic.
    pub(crate) fn realtime_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .attachments
            .iter()
            .filter(|(_, att)| att.realtime_sync)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

/// Shared core handed to the background tasks.
pub(crate) struct Core {
    pub(crate) rpc: Arc<dyn AgentService>,
    pub(crate) key: String,
    pub(crate) metadata: PresenceMetadata,
    pub(crate) auth_token: Option<String>,
    pub(crate) sync_loop_interval: Duration,
    pub(crate) reconnect_stream_delay: Duration,
    pub(crate) state: RwLock<ClientState>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) stats: AtomicClientStats,
}

impl Core {
    pub(crate) fn ctx(&self) -> RpcContext {
        RpcContext {
            auth_token: self.auth_token.clone(),
        }
    }

    pub(crate) async fn is_current(&self, epoch: u64) -> bool {
        self.state.read().await.is_current(epoch)
    }

    /// Ask the watch task to resubscribe with the current key set.
    ///
    /// The channel holds a single slot; a full channel means a restart
    /// is already pending, which covers this request too.
    pub(crate) fn request_watch_restart(&self, state: &ClientState) {
        if let Some(tx) = &state.watch_tx {
            let _ = tx.try_send(());
        }
    }
}

/// A session against the coordinating agent.
///
/// Cheap to clone; clones share the session. All operations are safe
/// to call from any task.
#[derive(Clone)]
pub struct Client {
    core: Arc<Core>,
}

impl Client {
    pub fn new(rpc: Arc<dyn AgentService>, options: ClientOptions) -> Self {
        let key = options
            .key
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            core: Arc::new(Core {
                rpc,
                key,
                metadata: options.metadata,
                auth_token: options.auth_token,
                sync_loop_interval: options.sync_loop_interval,
                reconnect_stream_delay: options.reconnect_stream_delay,
                state: RwLock::new(ClientState::new()),
                events: Arc::new(EventBus::new()),
                stats: AtomicClientStats::new(),
            }),
        }
    }

    /// Create with default options (fresh UUID key, 50ms sync period).
    pub fn with_defaults(rpc: Arc<dyn AgentService>) -> Self {
        Self::new(rpc, ClientOptions::default())
    }

    #[cfg(test)]
    pub(crate) fn core_for_tests(&self) -> Arc<Core> {
        self.core.clone()
    }

    /// The caller-supplied or generated local key.
    pub fn key(&self) -> &str {
        &self.core.key
    }

    /// Presence metadata advertised to peers.
    pub fn metadata(&self) -> &PresenceMetadata {
        &self.core.metadata
    }

    pub async fn status(&self) -> ClientStatus {
        self.core.state.read().await.status
    }

    pub async fn is_active(&self) -> bool {
        self.core.state.read().await.status == ClientStatus::Activated
    }

    /// Agent-assigned identity in hex form; `None` while deactivated.
    pub async fn id(&self) -> Option<String> {
        self.core
            .state
            .read()
            .await
            .server_id
            .as_ref()
            .map(ClientId::to_hex)
    }

    /// Subscribe to session events. Hot stream: no replay of events
    /// published before the subscription; dropping the handle detaches
    /// the observer.
    pub fn subscribe(&self) -> EventStream {
        EventBus::subscribe(&self.core.events)
    }

    pub fn stats(&self) -> ClientStats {
        self.core.stats.snapshot()
    }

    /// Peer set currently co-editing the given document, or `None`
    /// when the document is not attached.
    pub async fn peers(&self, doc_key: &str) -> Option<HashMap<String, PresenceMetadata>> {
        self.core
            .state
            .read()
            .await
            .attachments
            .get(doc_key)
            .map(|att| att.peer_clients.clone())
    }

    /// Keys of every attached document.
    pub async fn attachment_keys(&self) -> Vec<String> {
        self.core
            .state
            .read()
            .await
            .attachments
            .keys()
            .cloned()
            .collect()
    }

    /// Register with the agent and start the background loops.
    ///
    /// Idempotent while activated. On RPC failure the error is
    /// returned and nothing changes.
    pub async fn activate(&self) -> Result<(), ClientError> {
        if self.is_active().await {
            return Ok(());
        }

        let req = ActivateClientRequest {
            client_key: self.core.key.clone(),
        };
        let resp = self
            .core
            .rpc
            .activate_client(self.core.ctx(), req)
            .await
            .map_err(|e| {
                log::error!("AC: activate failed for key {}: {e}", self.core.key);
                e
            })?;
        let client_id = ClientId::from_bytes(resp.client_id);

        let (epoch, generation, watch_rx) = {
            let mut st = self.core.state.write().await;
            if st.status == ClientStatus::Activated {
                // Lost a concurrent-activation race; keep the session
                // that won and discard this acknowledgement.
                return Ok(());
            }
            st.status = ClientStatus::Activated;
            st.server_id = Some(client_id.clone());
            st.epoch += 1;
            st.watch_generation += 1;
            let (tx, rx) = mpsc::channel(1);
            st.watch_tx = Some(tx);
            (st.epoch, st.watch_generation, rx)
        };

        log::info!("client {} activated as {client_id}", self.core.key);
        tokio::spawn(sync_loop::run(self.core.clone(), epoch));
        tokio::spawn(watch::run(self.core.clone(), epoch, generation, watch_rx));
        self.core
            .events
            .publish(ClientEvent::StatusChanged(ClientStatus::Activated));
        Ok(())
    }

    /// Release the server identity and stop the background loops.
    ///
    /// Idempotent while deactivated. The watch stream is torn down
    /// before the RPC; in-flight push-pulls complete but their results
    /// are discarded by the epoch check.
    pub async fn deactivate(&self) -> Result<(), ClientError> {
        let client_id = {
            let mut st = self.core.state.write().await;
            if st.status == ClientStatus::Deactivated {
                return Ok(());
            }
            // Closing the restart channel shuts the watch task down,
            // and with it any open stream.
            st.watch_tx = None;
            st.server_id
                .clone()
                .expect("activated client has a server id")
        };

        let req = DeactivateClientRequest {
            client_id: client_id.clone(),
        };
        match self.core.rpc.deactivate_client(self.core.ctx(), req).await {
            Ok(()) => {
                {
                    let mut st = self.core.state.write().await;
                    st.status = ClientStatus::Deactivated;
                    st.server_id = None;
                    st.stream_connected = false;
                    st.epoch += 1;
                }
                log::info!("client {} deactivated", self.core.key);
                self.core
                    .events
                    .publish(ClientEvent::StatusChanged(ClientStatus::Deactivated));
                Ok(())
            }
            Err(e) => {
                log::error!("DC: deactivate failed for {client_id}: {e}");
                // Still activated: bring the watch task back so the
                // stream matches the attachment set again. The bumped
                // generation retires the old task even if it is still
                // mid-way through opening a stream.
                let (epoch, generation, rx) = {
                    let mut st = self.core.state.write().await;
                    st.watch_generation += 1;
                    let (tx, rx) = mpsc::channel(1);
                    st.watch_tx = Some(tx);
                    (st.epoch, st.watch_generation, rx)
                };
                tokio::spawn(watch::run(self.core.clone(), epoch, generation, rx));
                Err(e.into())
            }
        }
    }

    /// Attach a document: bind its actor, exchange change packs with
    /// the agent, and start replicating it.
    ///
    /// `manual_sync` opts the document out of the background loops;
    /// only explicit [`Client::sync`] calls will move its data.
    pub async fn attach(
        &self,
        document: Arc<dyn DocumentHandle>,
        manual_sync: bool,
    ) -> Result<(), ClientError> {
        let key = document.key();
        let (client_id, epoch) = {
            let st = self.core.state.read().await;
            if st.status != ClientStatus::Activated {
                return Err(ClientError::NotActive);
            }
            if st.attachments.contains_key(&key) {
                return Err(ClientError::AlreadyAttached(key));
            }
            (
                st.server_id
                    .clone()
                    .expect("activated client has a server id"),
                st.epoch,
            )
        };

        document.set_actor(&client_id.to_hex());
        let pack = document.create_change_pack();
        log::debug!("AD: attaching {key} with {} local changes", pack.change_count());

        let req = AttachDocumentRequest {
            client_id,
            change_pack: pack,
        };
        let resp = self
            .core
            .rpc
            .attach_document(self.core.ctx(), req)
            .await
            .map_err(|e| {
                log::error!("AD: attach failed for {key}: {e}");
                e
            })?;

        {
            let mut st = self.core.state.write().await;
            if !st.is_current(epoch) {
                // Deactivated while the RPC was in flight.
                return Err(ClientError::NotActive);
            }
            document.apply_change_pack(resp.change_pack)?;
            st.attachments
                .insert(key.clone(), Attachment::new(document, !manual_sync));
            self.core.request_watch_restart(&st);
        }

        log::info!("attached {key} (realtime: {})", !manual_sync);
        Ok(())
    }

    /// Detach a document: exchange final change packs and stop
    /// replicating it.
    pub async fn detach(&self, document: Arc<dyn DocumentHandle>) -> Result<(), ClientError> {
        let key = document.key();
        let (client_id, epoch) = {
            let st = self.core.state.read().await;
            if st.status != ClientStatus::Activated {
                return Err(ClientError::NotActive);
            }
            if !st.attachments.contains_key(&key) {
                return Err(ClientError::NotAttached(key));
            }
            (
                st.server_id
                    .clone()
                    .expect("activated client has a server id"),
                st.epoch,
            )
        };

        let pack = document.create_change_pack();
        let req = DetachDocumentRequest {
            client_id,
            change_pack: pack,
        };
        let resp = self
            .core
            .rpc
            .detach_document(self.core.ctx(), req)
            .await
            .map_err(|e| {
                log::error!("DD: detach failed for {key}: {e}");
                e
            })?;

        {
            let mut st = self.core.state.write().await;
            if !st.is_current(epoch) {
                return Err(ClientError::NotActive);
            }
            document.apply_change_pack(resp.change_pack)?;
            st.attachments.remove(&key);
            self.core.request_watch_restart(&st);
        }

        log::info!("detached {key}");
        Ok(())
    }

    /// Push-pull every attached document once, regardless of its sync
    /// mode, and resolve with the documents when all rounds complete.
    ///
    /// If any round fails, exactly one `DocumentSynced(SyncFailed)`
    /// event is published and the first error is returned.
    pub async fn sync(&self) -> Result<Vec<Arc<dyn DocumentHandle>>, ClientError> {
        let (documents, epoch) = {
            let st = self.core.state.read().await;
            if st.status != ClientStatus::Activated {
                return Err(ClientError::NotActive);
            }
            let docs: Vec<Arc<dyn DocumentHandle>> = st
                .attachments
                .values()
                .map(|att| att.document.clone())
                .collect();
            (docs, st.epoch)
        };

        let results = join_all(
            documents
                .iter()
                .map(|doc| sync_loop::push_pull(&self.core, doc.clone(), epoch)),
        )
        .await;

        let first_error = results.into_iter().find_map(Result::err);
        if let Some(e) = first_error {
            if self.core.is_current(epoch).await {
                self.core
                    .events
                    .publish(ClientEvent::DocumentSynced(DocumentSyncStatus::SyncFailed));
            }
            return Err(e);
        }
        Ok(documents)
    }
}
