//! Agent RPC surface consumed by the session core.
//!
//! Five unary calls plus one server-streaming call:
//!
//! ```text
//! ActivateClient    clientKey            → clientId (bytes)
//! DeactivateClient  clientId             → ()
//! AttachDocument    clientId, changePack → changePack
//! DetachDocument    clientId, changePack → changePack
//! PushPull          clientId, changePack → changePack
//! WatchDocuments    client, keys         → stream of WatchFrame
//! ```
//!
//! Transport adapters implement [`AgentService`]; the core never sees
//! framing, only these typed messages. The bearer token travels in
//! [`RpcContext`] and is injected into transport metadata by the
//! adapter on every call.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::document::ChangePack;

/// Presence metadata advertised to peers (display name, color, ...).
pub type PresenceMetadata = HashMap<String, String>;

/// Agent-assigned client identity: raw bytes with a lowercase-hex
/// string form used as the CRDT actor id and the peer-map key.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(Vec<u8>);

impl ClientId {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientId({})", self.to_hex())
    }
}

/// A client as seen on the watch stream: identity plus advertised
/// presence metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    /// Hex client id.
    pub id: String,
    pub metadata: PresenceMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivateClientRequest {
    pub client_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivateClientResponse {
    pub client_id: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeactivateClientRequest {
    pub client_id: ClientId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachDocumentRequest {
    pub client_id: ClientId,
    pub change_pack: ChangePack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachDocumentResponse {
    pub change_pack: ChangePack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetachDocumentRequest {
    pub client_id: ClientId,
    pub change_pack: ChangePack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetachDocumentResponse {
    pub change_pack: ChangePack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushPullRequest {
    pub client_id: ClientId,
    pub change_pack: ChangePack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushPullResponse {
    pub change_pack: ChangePack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchDocumentsRequest {
    pub client: Peer,
    pub document_keys: Vec<String>,
}

/// Event types carried on the watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventType {
    /// A peer started watching the listed documents.
    DocumentsWatched,
    /// A peer stopped watching the listed documents.
    DocumentsUnwatched,
    /// The listed documents changed remotely; pull on next sync.
    DocumentsChanged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub publisher: Peer,
    pub document_keys: Vec<String>,
}

/// One frame on the watch stream.
///
/// The agent sends a single `Initialization` frame when the stream
/// opens, then `Event` frames as peers come, go, and edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WatchFrame {
    Initialization {
        peers_by_doc: HashMap<String, Vec<Peer>>,
    },
    Event(WatchEvent),
}

/// Server-push frame source backed by a bounded channel.
///
/// Dropping the sender half ends the stream cleanly; a transport error
/// arrives as an `Err` item. Dropping the `WatchStream` cancels it.
pub struct WatchStream {
    rx: mpsc::Receiver<Result<WatchFrame, RpcError>>,
}

impl WatchStream {
    pub fn new(rx: mpsc::Receiver<Result<WatchFrame, RpcError>>) -> Self {
        Self { rx }
    }

    /// Create a connected sender/stream pair.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<WatchFrame, RpcError>>, WatchStream) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, WatchStream::new(rx))
    }

    /// Next frame; `None` means the stream ended.
    pub async fn next(&mut self) -> Option<Result<WatchFrame, RpcError>> {
        self.rx.recv().await
    }
}

/// Per-call context. The transport adapter injects the token into its
/// request metadata.
#[derive(Debug, Clone, Default)]
pub struct RpcContext {
    pub auth_token: Option<String>,
}

/// Transport-level RPC failures, surfaced verbatim to callers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request timed out")]
    Timeout,
}

/// The agent as the session core sees it.
#[async_trait]
pub trait AgentService: Send + Sync {
    async fn activate_client(
        &self,
        ctx: RpcContext,
        req: ActivateClientRequest,
    ) -> Result<ActivateClientResponse, RpcError>;

    async fn deactivate_client(
        &self,
        ctx: RpcContext,
        req: DeactivateClientRequest,
    ) -> Result<(), RpcError>;

    async fn attach_document(
        &self,
        ctx: RpcContext,
        req: AttachDocumentRequest,
    ) -> Result<AttachDocumentResponse, RpcError>;

    async fn detach_document(
        &self,
        ctx: RpcContext,
        req: DetachDocumentRequest,
    ) -> Result<DetachDocumentResponse, RpcError>;

    async fn push_pull(
        &self,
        ctx: RpcContext,
        req: PushPullRequest,
    ) -> Result<PushPullResponse, RpcError>;

    async fn watch_documents(
        &self,
        ctx: RpcContext,
        req: WatchDocumentsRequest,
    ) -> Result<WatchStream, RpcError>;
}
