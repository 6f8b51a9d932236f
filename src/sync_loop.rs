//! Periodic push-pull of realtime attachments.
//!
//! One task per activation. Each tick scans the registry for realtime
//! attachments with local changes or a set remote-dirty bit, clears
//! the bit, and runs one push-pull per selected document concurrently.
//! The tick period follows the watch stream: `sync_loop_interval`
//! while it is connected, `reconnect_stream_delay` while it is down or
//! after a failed batch.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::time::sleep;

use crate::client::{ClientError, Core};
use crate::document::DocumentHandle;
use crate::events::{ClientEvent, DocumentSyncStatus};
use crate::rpc::PushPullRequest;

pub(crate) async fn run(core: Arc<Core>, epoch: u64) {
    log::debug!("sync loop started");
    loop {
        let targets: Vec<Arc<dyn DocumentHandle>> = {
            let mut st = core.state.write().await;
            if !st.is_current(epoch) {
                break;
            }
            let mut targets = Vec::new();
            for att in st.attachments.values_mut() {
                if att.needs_sync() {
                    // Cleared before the RPC goes out: a remote change
                    // landing mid-flight re-sets the bit and triggers
                    // a follow-up round. Clearing afterwards would
                    // lose that edge.
                    att.remote_dirty = false;
                    targets.push(att.document.clone());
                }
            }
            targets
        };

        let mut failed = false;
        if !targets.is_empty() {
            let results = join_all(
                targets
                    .iter()
                    .map(|doc| push_pull(&core, doc.clone(), epoch)),
            )
            .await;
            failed = results.iter().any(Result::is_err);
        }

        if failed && core.is_current(epoch).await {
            core.events
                .publish(ClientEvent::DocumentSynced(DocumentSyncStatus::SyncFailed));
        }

        let delay = if failed || !core.state.read().await.stream_connected {
            core.reconnect_stream_delay
        } else {
            core.sync_loop_interval
        };
        sleep(delay).await;
    }
    log::debug!("sync loop stopped");
}

/// One push-pull round for a single document: drain the local pack,
/// exchange it with the agent, apply the returned pack, and publish
/// `DocumentSynced(Synced)`.
///
/// Results arriving after a deactivation are discarded silently. On
/// RPC failure the error is returned and nothing is published; the
/// caller decides how to report the batch.
pub(crate) async fn push_pull(
    core: &Arc<Core>,
    document: Arc<dyn DocumentHandle>,
    epoch: u64,
) -> Result<(), ClientError> {
    let key = document.key();
    let client_id = {
        let st = core.state.read().await;
        if !st.is_current(epoch) {
            return Ok(());
        }
        match st.server_id.clone() {
            Some(id) => id,
            None => return Ok(()),
        }
    };

    let pack = document.create_change_pack();
    let local_count = pack.change_count();

    let req = PushPullRequest {
        client_id,
        change_pack: pack,
    };
    let resp = core
        .rpc
        .push_pull(core.ctx(), req)
        .await
        .map_err(|e| {
            core.stats.record_sync_failed();
            log::error!("PP: push-pull failed for {key}: {e}");
            e
        })?;

    // A deactivation while the RPC was in flight discards the result.
    if !core.is_current(epoch).await {
        return Ok(());
    }

    let remote_count = resp.change_pack.change_count();
    document.apply_change_pack(resp.change_pack)?;
    log::debug!("PP: {key} pushed {local_count} changes, pulled {remote_count}");

    core.stats.record_sync_completed();
    core.events
        .publish(ClientEvent::DocumentSynced(DocumentSyncStatus::Synced));
    Ok(())
}
