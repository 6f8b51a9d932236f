//! Typed session events and their fan-out.
//!
//! A client session is a single producer feeding many observers:
//!
//! ```text
//! lifecycle ──┐
//! sync loop ──┼──► EventBus ──► EventStream (observer 1)
//! watch loop ─┘        │
//!                      └──────► EventStream (observer N)
//! ```
//!
//! The bus is hot: observers only see events published after they
//! subscribed, delivery is in emission order per observer, and a slow
//! or dropped observer never blocks its siblings. Publication iterates
//! a snapshot of the subscriber list, so an observer unsubscribing
//! mid-dispatch cannot corrupt the iteration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::client::ClientStatus;
use crate::rpc::PresenceMetadata;

/// Peer sets keyed by document key, as delivered in
/// [`ClientEvent::PeersChanged`].
pub type PeersByDocument = HashMap<String, HashMap<String, PresenceMetadata>>;

/// Whether the watch stream is currently up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamConnectionStatus {
    Connected,
    Disconnected,
}

/// Outcome of a push-pull round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentSyncStatus {
    Synced,
    SyncFailed,
}

/// Events published by a client session.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The session activated or deactivated.
    StatusChanged(ClientStatus),
    /// The listed documents changed remotely.
    DocumentsChanged(Vec<String>),
    /// Peer sets changed for the listed documents.
    PeersChanged(PeersByDocument),
    /// The watch stream connected or dropped.
    StreamConnectionStatusChanged(StreamConnectionStatus),
    /// A push-pull round finished.
    DocumentSynced(DocumentSyncStatus),
}

struct Observer {
    id: u64,
    tx: mpsc::UnboundedSender<ClientEvent>,
}

/// Single-producer, multi-observer fan-out.
pub(crate) struct EventBus {
    observers: Mutex<Vec<Observer>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a new observer on the bus. No history is replayed.
    pub(crate) fn subscribe(bus: &Arc<EventBus>) -> EventStream {
        let id = bus.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        bus.observers
            .lock()
            .expect("event bus lock poisoned")
            .push(Observer { id, tx });
        EventStream {
            id,
            rx,
            bus: bus.clone(),
        }
    }

    pub(crate) fn unsubscribe(&self, id: u64) {
        self.observers
            .lock()
            .expect("event bus lock poisoned")
            .retain(|o| o.id != id);
    }

    /// Deliver an event to every current observer, in order.
    ///
    /// The observer list is snapshotted before sending; observers whose
    /// receiver has been dropped are pruned afterwards.
    pub(crate) fn publish(&self, event: ClientEvent) {
        let snapshot: Vec<(u64, mpsc::UnboundedSender<ClientEvent>)> = self
            .observers
            .lock()
            .expect("event bus lock poisoned")
            .iter()
            .map(|o| (o.id, o.tx.clone()))
            .collect();

        let mut closed = Vec::new();
        for (id, tx) in snapshot {
            if tx.send(event.clone()).is_err() {
                closed.push(id);
            }
        }

        if !closed.is_empty() {
            self.observers
                .lock()
                .expect("event bus lock poisoned")
                .retain(|o| !closed.contains(&o.id));
        }
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.observers
            .lock()
            .expect("event bus lock poisoned")
            .len()
    }
}

/// Subscription handle returned by `Client::subscribe`.
///
/// Receives session events in emission order; detaches on drop.
pub struct EventStream {
    id: u64,
    rx: mpsc::UnboundedReceiver<ClientEvent>,
    bus: Arc<EventBus>,
}

impl EventStream {
    /// Next event; `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant; `None` when no event is pending.
    pub fn try_recv(&mut self) -> Option<ClientEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}
