//! # vellum-client — Session coordination core for Vellum
//!
//! Represents a single end user's session to the central coordinating
//! agent of the Vellum collaborative document service and drives the
//! replication of attached CRDT documents between that user and
//! remote peers.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   unary RPCs + watch stream   ┌────────────┐
//! │   Client   │ ◄───────────────────────────► │   Agent    │
//! │ (per user) │        AgentService           │ (central)  │
//! └──────┬─────┘                               └────────────┘
//!        │ owns
//!        ├── attachment registry (doc key → handle, mode, peers, dirty)
//!        ├── sync loop   — periodic push-pull of realtime documents
//!        ├── watch loop  — server-push stream, reconnects on loss
//!        └── event bus   — typed session events to subscribers
//! ```
//!
//! The CRDT engine itself is an external collaborator consumed through
//! [`DocumentHandle`]; the transport is consumed through
//! [`AgentService`]. This crate owns only the coordination: the
//! session state machine, the attachment bookkeeping, and the two
//! cooperating background loops.
//!
//! ## Modules
//!
//! - [`client`] — session state machine and user-facing API
//! - [`document`] — document-side contract (keys, checkpoints, packs)
//! - [`rpc`] — agent RPC surface and watch stream frames
//! - [`events`] — typed session events and subscription handles
//! - [`attachment`] — per-document bookkeeping record

pub mod attachment;
pub mod client;
pub mod document;
pub mod events;
pub mod rpc;

mod sync_loop;
mod watch;

// Re-exports for convenience
pub use attachment::Attachment;
pub use client::{Client, ClientError, ClientOptions, ClientStats, ClientStatus};
pub use document::{ChangePack, Checkpoint, DocumentError, DocumentHandle, DocumentKey};
pub use events::{
    ClientEvent, DocumentSyncStatus, EventStream, PeersByDocument, StreamConnectionStatus,
};
pub use rpc::{
    ActivateClientRequest, ActivateClientResponse, AgentService, AttachDocumentRequest,
    AttachDocumentResponse, ClientId, DeactivateClientRequest, DetachDocumentRequest,
    DetachDocumentResponse, Peer, PresenceMetadata, PushPullRequest, PushPullResponse, RpcContext,
    RpcError, WatchDocumentsRequest, WatchEvent, WatchEventType, WatchFrame, WatchStream,
};
