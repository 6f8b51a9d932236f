//! Shared test doubles: a scripted in-memory agent and a minimal
//! document handle, plus timing helpers for the async scenarios.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{sleep, timeout};

use vellum_client::{
    ActivateClientRequest, ActivateClientResponse, AgentService, AttachDocumentRequest,
    AttachDocumentResponse, ChangePack, Checkpoint, ClientEvent, ClientOptions,
    DeactivateClientRequest, DetachDocumentRequest, DetachDocumentResponse, DocumentError,
    DocumentHandle, DocumentKey, EventStream, PushPullRequest, PushPullResponse, RpcContext,
    RpcError, WatchDocumentsRequest, WatchFrame, WatchStream,
};

/// Record of one unary call, for asserting what went over the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Activate { client_key: String },
    Deactivate,
    Attach { doc_key: String },
    Detach { doc_key: String },
    PushPull { doc_key: String, pushed: usize },
}

struct WatchSession {
    document_keys: Vec<String>,
    tx: Option<mpsc::Sender<Result<WatchFrame, RpcError>>>,
}

/// In-memory agent double. Acknowledges every call by default; each
/// call kind can be flipped to fail, and push-pull can be held behind
/// a gate to keep RPCs in flight while the test injects frames.
pub struct MockAgent {
    pub client_id: Vec<u8>,
    calls: Mutex<Vec<Call>>,
    tokens_seen: Mutex<Vec<Option<String>>>,
    watch_sessions: Mutex<Vec<WatchSession>>,
    fail_activate: AtomicBool,
    fail_deactivate: AtomicBool,
    fail_push_pull: AtomicBool,
    fail_watch: AtomicBool,
    gate_enabled: AtomicBool,
    gate: Semaphore,
}

impl MockAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            client_id: vec![0x01, 0x02, 0xab, 0xcd],
            calls: Mutex::new(Vec::new()),
            tokens_seen: Mutex::new(Vec::new()),
            watch_sessions: Mutex::new(Vec::new()),
            fail_activate: AtomicBool::new(false),
            fail_deactivate: AtomicBool::new(false),
            fail_push_pull: AtomicBool::new(false),
            fail_watch: AtomicBool::new(false),
            gate_enabled: AtomicBool::new(false),
            gate: Semaphore::new(0),
        })
    }

    pub fn client_id_hex(&self) -> String {
        self.client_id.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn tokens_seen(&self) -> Vec<Option<String>> {
        self.tokens_seen.lock().unwrap().clone()
    }

    pub fn push_pull_count_for(&self, doc_key: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, Call::PushPull { doc_key: k, .. } if k == doc_key))
            .count()
    }

    pub fn set_fail_activate(&self, fail: bool) {
        self.fail_activate.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deactivate(&self, fail: bool) {
        self.fail_deactivate.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_push_pull(&self, fail: bool) {
        self.fail_push_pull.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_watch(&self, fail: bool) {
        self.fail_watch.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent push-pull calls block until released.
    pub fn hold_push_pull(&self) {
        self.gate_enabled.store(true, Ordering::SeqCst);
    }

    /// Let `n` held push-pull calls proceed.
    pub fn release_push_pull(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn stop_holding_push_pull(&self) {
        self.gate_enabled.store(false, Ordering::SeqCst);
    }

    /// Number of WatchDocuments streams opened so far.
    pub fn watch_count(&self) -> usize {
        self.watch_sessions.lock().unwrap().len()
    }

    /// Key set of the most recent stream, sorted.
    pub fn last_watch_keys(&self) -> Option<Vec<String>> {
        self.watch_sessions.lock().unwrap().last().map(|s| {
            let mut keys = s.document_keys.clone();
            keys.sort();
            keys
        })
    }

    /// Whether the most recent stream is still open on both ends.
    pub fn stream_open(&self) -> bool {
        self.watch_sessions
            .lock()
            .unwrap()
            .last()
            .and_then(|s| s.tx.as_ref())
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Deliver a frame on the most recent stream. Returns `false` when
    /// the client has already dropped its end.
    pub async fn push_frame(&self, frame: WatchFrame) -> bool {
        let tx = self
            .watch_sessions
            .lock()
            .unwrap()
            .last()
            .and_then(|s| s.tx.clone())
            .expect("no watch stream open");
        tx.send(Ok(frame)).await.is_ok()
    }

    /// Inject a transport error on the most recent stream.
    pub async fn fail_stream(&self) {
        let tx = self
            .watch_sessions
            .lock()
            .unwrap()
            .last()
            .and_then(|s| s.tx.clone())
            .expect("no watch stream open");
        let _ = tx
            .send(Err(RpcError::Transport("stream reset".into())))
            .await;
    }

    /// End the most recent stream cleanly by dropping the sender.
    pub fn close_stream(&self) {
        if let Some(session) = self.watch_sessions.lock().unwrap().last_mut() {
            session.tx = None;
        }
    }

    fn record(&self, ctx: &RpcContext, call: Call) {
        self.calls.lock().unwrap().push(call);
        self.tokens_seen.lock().unwrap().push(ctx.auth_token.clone());
    }

    /// Acknowledge a pack: advance the checkpoint past what was
    /// pushed, return no remote changes.
    fn ack_pack(pack: &ChangePack) -> ChangePack {
        let ack = Checkpoint::new(
            pack.checkpoint.server_seq + 1,
            pack.checkpoint.client_seq + pack.change_count() as u32,
        );
        ChangePack::new(pack.document_key.clone(), pack.checkpoint.forward(&ack), Vec::new())
    }
}

#[async_trait]
impl AgentService for MockAgent {
    async fn activate_client(
        &self,
        ctx: RpcContext,
        req: ActivateClientRequest,
    ) -> Result<ActivateClientResponse, RpcError> {
        self.record(
            &ctx,
            Call::Activate {
                client_key: req.client_key,
            },
        );
        if self.fail_activate.load(Ordering::SeqCst) {
            return Err(RpcError::Transport("activate refused".into()));
        }
        Ok(ActivateClientResponse {
            client_id: self.client_id.clone(),
        })
    }

    async fn deactivate_client(
        &self,
        ctx: RpcContext,
        _req: DeactivateClientRequest,
    ) -> Result<(), RpcError> {
        self.record(&ctx, Call::Deactivate);
        if self.fail_deactivate.load(Ordering::SeqCst) {
            return Err(RpcError::Transport("deactivate refused".into()));
        }
        Ok(())
    }

    async fn attach_document(
        &self,
        ctx: RpcContext,
        req: AttachDocumentRequest,
    ) -> Result<AttachDocumentResponse, RpcError> {
        self.record(
            &ctx,
            Call::Attach {
                doc_key: req.change_pack.document_key.combined(),
            },
        );
        Ok(AttachDocumentResponse {
            change_pack: Self::ack_pack(&req.change_pack),
        })
    }

    async fn detach_document(
        &self,
        ctx: RpcContext,
        req: DetachDocumentRequest,
    ) -> Result<DetachDocumentResponse, RpcError> {
        self.record(
            &ctx,
            Call::Detach {
                doc_key: req.change_pack.document_key.combined(),
            },
        );
        Ok(DetachDocumentResponse {
            change_pack: Self::ack_pack(&req.change_pack),
        })
    }

    async fn push_pull(
        &self,
        ctx: RpcContext,
        req: PushPullRequest,
    ) -> Result<PushPullResponse, RpcError> {
        self.record(
            &ctx,
            Call::PushPull {
                doc_key: req.change_pack.document_key.combined(),
                pushed: req.change_pack.change_count(),
            },
        );
        if self.gate_enabled.load(Ordering::SeqCst) {
            self.gate.acquire().await.unwrap().forget();
        }
        if self.fail_push_pull.load(Ordering::SeqCst) {
            return Err(RpcError::Transport("push-pull refused".into()));
        }
        Ok(PushPullResponse {
            change_pack: Self::ack_pack(&req.change_pack),
        })
    }

    async fn watch_documents(
        &self,
        _ctx: RpcContext,
        req: WatchDocumentsRequest,
    ) -> Result<WatchStream, RpcError> {
        if self.fail_watch.load(Ordering::SeqCst) {
            return Err(RpcError::Transport("watch refused".into()));
        }
        let (tx, stream) = WatchStream::channel(16);
        self.watch_sessions.lock().unwrap().push(WatchSession {
            document_keys: req.document_keys,
            tx: Some(tx),
        });
        Ok(stream)
    }
}

/// Minimal document handle: queued local edits, applied-pack log.
#[derive(Debug)]
pub struct MockDocument {
    key: DocumentKey,
    actor: Mutex<Option<String>>,
    pending: Mutex<Vec<Vec<u8>>>,
    applied: Mutex<Vec<ChangePack>>,
    checkpoint: Mutex<Checkpoint>,
}

impl MockDocument {
    pub fn new(collection: &str, name: &str) -> Arc<Self> {
        Arc::new(Self {
            key: DocumentKey::new(collection, name),
            actor: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            checkpoint: Mutex::new(Checkpoint::INITIAL),
        })
    }

    /// Queue a local edit for the next change pack.
    pub fn edit(&self, payload: Vec<u8>) {
        self.pending.lock().unwrap().push(payload);
    }

    pub fn actor(&self) -> Option<String> {
        self.actor.lock().unwrap().clone()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        *self.checkpoint.lock().unwrap()
    }
}

impl DocumentHandle for MockDocument {
    fn set_actor(&self, actor_id: &str) {
        *self.actor.lock().unwrap() = Some(actor_id.to_string());
    }

    fn key(&self) -> String {
        self.key.combined()
    }

    fn document_key(&self) -> DocumentKey {
        self.key.clone()
    }

    fn create_change_pack(&self) -> ChangePack {
        let changes = std::mem::take(&mut *self.pending.lock().unwrap());
        ChangePack::new(self.key.clone(), *self.checkpoint.lock().unwrap(), changes)
    }

    fn apply_change_pack(&self, pack: ChangePack) -> Result<(), DocumentError> {
        let mut checkpoint = self.checkpoint.lock().unwrap();
        *checkpoint = checkpoint.forward(&pack.checkpoint);
        drop(checkpoint);
        self.applied.lock().unwrap().push(pack);
        Ok(())
    }

    fn has_local_changes(&self) -> bool {
        !self.pending.lock().unwrap().is_empty()
    }
}

/// Options tuned for tests: short periods, fixed key.
pub fn fast_options(key: &str) -> ClientOptions {
    ClientOptions {
        key: Some(key.to_string()),
        sync_loop_interval: Duration::from_millis(10),
        reconnect_stream_delay: Duration::from_millis(200),
        ..ClientOptions::default()
    }
}

pub fn metadata(name: &str) -> HashMap<String, String> {
    let mut m = HashMap::new();
    m.insert("name".to_string(), name.to_string());
    m
}

/// Next event, failing the test after two seconds.
pub async fn expect_event(events: &mut EventStream, what: &str) -> ClientEvent {
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(event)) => event,
        _ => panic!("timed out waiting for {what}"),
    }
}

/// Poll a condition until it holds, failing the test after two seconds.
pub async fn wait_until(what: &str, check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
