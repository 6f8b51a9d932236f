//! Document-side contract consumed by the session core.
//!
//! The CRDT engine lives outside this crate. The client only needs a
//! narrow surface from it: drain local changes into a [`ChangePack`],
//! apply a pack received from the agent, and answer "is there anything
//! left to push?". [`DocumentKey`] and [`Checkpoint`] are the data
//! types that cross that boundary alongside the pack.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies a document within a collection.
///
/// The combined form `collection$document` is the stable string key
/// used by the attachment registry and the watch stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    pub collection: String,
    pub document: String,
}

impl DocumentKey {
    pub fn new(collection: impl Into<String>, document: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            document: document.into(),
        }
    }

    /// Combined string form used as the registry key.
    pub fn combined(&self) -> String {
        format!("{}${}", self.collection, self.document)
    }
}

impl std::fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}${}", self.collection, self.document)
    }
}

/// Monotone cursor marking the last mutually acknowledged position of
/// a document's change history.
///
/// `server_seq` advances with pulls, `client_seq` with pushes. A
/// checkpoint never moves backwards; redelivering a pack after a
/// transient failure is therefore safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub server_seq: u64,
    pub client_seq: u32,
}

impl Checkpoint {
    pub const INITIAL: Checkpoint = Checkpoint {
        server_seq: 0,
        client_seq: 0,
    };

    pub fn new(server_seq: u64, client_seq: u32) -> Self {
        Self {
            server_seq,
            client_seq,
        }
    }

    /// Component-wise maximum of two checkpoints.
    pub fn forward(&self, other: &Checkpoint) -> Checkpoint {
        Checkpoint {
            server_seq: self.server_seq.max(other.server_seq),
            client_seq: self.client_seq.max(other.client_seq),
        }
    }
}

/// A batch of encoded CRDT operations plus the checkpoint they extend.
///
/// The operation encoding is opaque here; the wire converters own it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePack {
    pub document_key: DocumentKey,
    pub checkpoint: Checkpoint,
    pub changes: Vec<Vec<u8>>,
}

impl ChangePack {
    pub fn new(document_key: DocumentKey, checkpoint: Checkpoint, changes: Vec<Vec<u8>>) -> Self {
        Self {
            document_key,
            checkpoint,
            changes,
        }
    }

    /// Number of operations carried; used for sync logging.
    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Errors surfaced by the document engine when applying a remote pack.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DocumentError {
    #[error("failed to apply change pack: {0}")]
    Apply(String),
}

/// Operations the session core invokes on an attached document.
///
/// Implemented by the CRDT engine. Handles are shared between the
/// caller and the background loops, so implementations synchronize
/// internally and all methods take `&self`.
pub trait DocumentHandle: Send + Sync + std::fmt::Debug {
    /// Bind the CRDT actor to the agent-assigned client id (hex form).
    fn set_actor(&self, actor_id: &str);

    /// Stable document key — the combined [`DocumentKey`] form.
    fn key(&self) -> String;

    /// Structured key for wire use.
    fn document_key(&self) -> DocumentKey;

    /// Drain unsynced local changes into a transmittable pack.
    fn create_change_pack(&self) -> ChangePack;

    /// Apply a pack received from the agent.
    fn apply_change_pack(&self, pack: ChangePack) -> Result<(), DocumentError>;

    fn has_local_changes(&self) -> bool;
}
