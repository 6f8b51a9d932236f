//! Per-document attachment bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;

use crate::document::DocumentHandle;
use crate::rpc::PresenceMetadata;

/// The client's record for one attached document: the engine handle,
/// the sync mode, the co-editing peer set, and the remote-dirty bit
/// that edge-triggers the sync loop.
///
/// An attachment exists in the registry exactly while the agent holds
/// an acknowledged AttachDocument for it. The registry itself is owned
/// by the client state and mutated only by attach/detach and the watch
/// demultiplexer.
pub struct Attachment {
    pub document: Arc<dyn DocumentHandle>,
    /// `true`: the background loops drive this document. `false`:
    /// only explicit `sync()` calls move data.
    pub realtime_sync: bool,
    /// Remote client id (hex) → advertised metadata.
    pub peer_clients: HashMap<String, PresenceMetadata>,
    /// Set by the watch demultiplexer on a remote change, cleared by
    /// the sync loop when it picks the document up.
    pub remote_dirty: bool,
}

impl Attachment {
    pub fn new(document: Arc<dyn DocumentHandle>, realtime_sync: bool) -> Self {
        Self {
            document,
            realtime_sync,
            peer_clients: HashMap::new(),
            remote_dirty: false,
        }
    }

    /// True when the sync loop should pick this attachment up.
    pub fn needs_sync(&self) -> bool {
        self.realtime_sync && (self.remote_dirty || self.document.has_local_changes())
    }
}

// Manual Debug because the document handle is a trait object.
impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("document", &self.document.key())
            .field("realtime_sync", &self.realtime_sync)
            .field("peer_count", &self.peer_clients.len())
            .field("remote_dirty", &self.remote_dirty)
            .finish()
    }
}
