//! # Session
//!
//! The per-client state machine. A session is a cooperative single-task
//! actor: one worker drains the inbox, processing one protocol message
//! at a time (a method may release the worker early through
//! `unblock`). Everything a client sees flows through the session's
//! sender; everything it says arrives through the inbox.

mod collection_view;
mod heartbeat;
mod sender;
mod subscription;

pub use collection_view::SessionCollectionView;
pub use collection_view::SessionDocumentView;
pub use collection_view::UnknownDocument;
pub use subscription::LiveCursor;
pub use subscription::PublishHandler;
pub use subscription::PublishOutcome;
pub use subscription::PublishableCursor;
pub use subscription::Subscription;


use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use ddp_engine_core::WriteFence;
use ddp_engine_core::diff::diff_fields;
use ddp_engine_core::random_id;
use ddp_engine_proto::ClientError;
use ddp_engine_proto::ClientMessage;
use ddp_engine_proto::FieldPatch;
use ddp_engine_proto::Fields;
use ddp_engine_proto::ServerMessage;
use ddp_engine_proto::from_wire_params;
use ddp_engine_proto::to_wire;
use ddp_engine_proto::version_supports_ping;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::method::MethodContext;
use crate::server::ServerInner;
use crate::session::heartbeat::Heartbeat;
use crate::session::sender::SessionSender;
use crate::transport::ConnectionSink;

/// Where merge-box output lands. Implemented by the session's sender.
pub trait ViewCallbacks: Send + Sync {
    fn view_added(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
    );
    fn view_changed(
        &self,
        collection: &str,
        id: &str,
        patch: FieldPatch,
    );
    fn view_removed(
        &self,
        collection: &str,
        id: &str,
    );
}

impl ViewCallbacks for SessionSender {
    fn view_added(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
    ) {
        self.send_added(collection, id, fields);
    }

    fn view_changed(
        &self,
        collection: &str,
        id: &str,
        patch: FieldPatch,
    ) {
        self.send_changed(collection, id, &patch);
    }

    fn view_removed(
        &self,
        collection: &str,
        id: &str,
    ) {
        self.send_removed(collection, id);
    }
}

struct SubscriptionTable {
    named: HashMap<String, Arc<Subscription>>,
    universal: Vec<Arc<Subscription>>,
}

/// One connected client.
pub struct Session {
    weak_self: Weak<Session>,
    id: String,
    version: String,
    server: Weak<ServerInner>,
    sender: SessionSender,
    inbox_tx: mpsc::UnboundedSender<ClientMessage>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientMessage>>>,
    shutdown_tx: watch::Sender<bool>,
    heartbeat: Mutex<Option<Heartbeat>>,
    user_id: Mutex<Option<String>>,
    subscriptions: Mutex<SubscriptionTable>,
    views: Mutex<HashMap<String, SessionCollectionView>>,
    close_callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    closed: AtomicBool,
    remote_address: Option<String>,
    http_headers: HashMap<String, String>,
}

impl Session {
    pub(crate) fn new(
        server: &Arc<ServerInner>,
        version: String,
        sink: Arc<dyn ConnectionSink>,
        remote_address: Option<String>,
        http_headers: HashMap<String, String>,
    ) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let sender = SessionSender::new(sink, version.clone());
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            id: random_id(),
            version,
            server: Arc::downgrade(server),
            sender,
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            shutdown_tx,
            heartbeat: Mutex::new(None),
            user_id: Mutex::new(None),
            subscriptions: Mutex::new(SubscriptionTable {
                named: HashMap::new(),
                universal: Vec::new(),
            }),
            views: Mutex::new(HashMap::new()),
            close_callbacks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            remote_address,
            http_headers,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_id.lock().expect("session poisoned").clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The client address behind the configured number of trusted
    /// proxies.
    pub fn client_address(&self) -> Option<String> {
        let forwarded_count = self
            .server
            .upgrade()
            .map(|s| s.config().transport.forwarded_count)
            .unwrap_or(0);
        crate::transport::client_address(
            &self.http_headers,
            self.remote_address.as_deref(),
            forwarded_count,
        )
    }

    pub fn http_headers(&self) -> &HashMap<String, String> {
        &self.http_headers
    }

    /// Register work to run (on a deferred task) when the session
    /// closes.
    pub fn on_close<F>(
        &self,
        callback: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            tokio::spawn(async move {
                callback();
            });
            return;
        }
        self.close_callbacks.lock().expect("session poisoned").push(Box::new(callback));
    }

    /// Announce the session, start the heartbeat and the inbox worker,
    /// and kick off universal subscriptions.
    pub(crate) fn start(&self) {
        info!("[Session-{}] connected (protocol {})", self.id, self.version);
        self.sender.send(ServerMessage::Connected {
            session: self.id.clone(),
        });
        self.start_heartbeat();

        let session = self.weak_self.upgrade().expect("session alive");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut inbox_rx = self
            .inbox_rx
            .lock()
            .expect("session poisoned")
            .take()
            .expect("session started twice");
        tokio::spawn(async move {
            session.start_universal_subs().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    message = inbox_rx.recv() => match message {
                        Some(message) => session.process_message(message).await,
                        None => return,
                    }
                }
            }
        });
    }

    fn start_heartbeat(&self) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let config = &server.config().heartbeat;
        if !version_supports_ping(&self.version) || config.interval_ms == 0 {
            return;
        }
        let ping_session = self.weak_self.clone();
        let timeout_session = self.weak_self.clone();
        let heartbeat = Heartbeat::start(
            config.interval_ms,
            config.timeout_ms,
            Arc::new(move || {
                if let Some(session) = ping_session.upgrade() {
                    session.sender.send(ServerMessage::Ping {
                        id: None,
                    });
                }
            }),
            Arc::new(move || {
                if let Some(session) = timeout_session.upgrade() {
                    warn!("[Session-{}] heartbeat timeout", session.id);
                    session.close();
                }
            }),
        );
        *self.heartbeat.lock().expect("session poisoned") = Some(heartbeat);
    }

    async fn start_universal_subs(&self) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let this = self.weak_self.upgrade().expect("session alive");
        for handler in server.universal_publish_handlers() {
            let sub = Subscription::new(
                &this,
                handler,
                None,
                None,
                Vec::new(),
                server.publication_strategy(None),
            );
            self.subscriptions.lock().expect("session poisoned").universal.push(Arc::clone(&sub));
            sub.run_handler().await;
        }
    }

    /// Start one late-registered universal publication on this session.
    pub(crate) fn start_universal_sub(
        &self,
        handler: PublishHandler,
    ) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let this = self.weak_self.upgrade().expect("session alive");
        let sub = Subscription::new(
            &this,
            handler,
            None,
            None,
            Vec::new(),
            server.publication_strategy(None),
        );
        self.subscriptions.lock().expect("session poisoned").universal.push(Arc::clone(&sub));
        tokio::spawn(async move {
            sub.run_handler().await;
        });
    }

    /// Feed one parsed message into the inbox.
    pub(crate) fn queue_message(
        &self,
        message: ClientMessage,
    ) {
        self.note_traffic();
        let _ = self.inbox_tx.send(message);
    }

    /// Any inbound frame (parsed or not) counts as heartbeat liveness.
    pub(crate) fn note_traffic(&self) {
        if let Some(heartbeat) = &*self.heartbeat.lock().expect("session poisoned") {
            heartbeat.message_received();
        }
    }

    pub(crate) fn send_protocol_error(
        &self,
        reason: impl Into<String>,
        offending_message: Option<Value>,
    ) {
        self.sender.send(ServerMessage::Error {
            reason: reason.into(),
            offending_message,
        });
    }

    async fn process_message(
        &self,
        message: ClientMessage,
    ) {
        match message {
            ClientMessage::Sub {
                id,
                name,
                params,
            } => self.handle_sub(id, name, params.unwrap_or_default()).await,
            ClientMessage::Unsub {
                id,
            } => self.stop_subscription(&id, None),
            ClientMessage::Method {
                id,
                method,
                params,
                random_seed,
            } => self.handle_method(id, method, params.unwrap_or_default(), random_seed).await,
            ClientMessage::Ping {
                id,
            } => {
                let respond = self
                    .server
                    .upgrade()
                    .map(|s| s.config().heartbeat.respond_to_pings)
                    .unwrap_or(false);
                if respond && version_supports_ping(&self.version) {
                    self.sender.send(ServerMessage::Pong {
                        id,
                    });
                }
            }
            ClientMessage::Pong {
                ..
            } => {}
            ClientMessage::Connect {
                ..
            } => {
                self.send_protocol_error("Already connected", None);
            }
        }
    }

    async fn handle_sub(
        &self,
        sub_id: String,
        name: String,
        params: Vec<Value>,
    ) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        {
            let subscriptions = self.subscriptions.lock().expect("session poisoned");
            if subscriptions.named.contains_key(&sub_id) {
                // Duplicate sub ids are a silent no-op.
                return;
            }
        }
        let params = match from_wire_params(&params) {
            Ok(params) => params,
            Err(err) => {
                self.sender.send(ServerMessage::Nosub {
                    id: sub_id,
                    error: Some(err),
                });
                return;
            }
        };
        let Some(handler) = server.publish_handler(&name) else {
            debug!("[Session-{}] sub to unknown publication '{name}'", self.id);
            self.sender.send(ServerMessage::Nosub {
                id: sub_id,
                error: Some(ClientError::not_found(format!(
                    "Subscription '{name}' not found"
                ))),
            });
            return;
        };
        let this = self.weak_self.upgrade().expect("session alive");
        let sub = Subscription::new(
            &this,
            handler,
            Some(sub_id.clone()),
            Some(name.clone()),
            params,
            server.publication_strategy(Some(&name)),
        );
        self.subscriptions
            .lock()
            .expect("session poisoned")
            .named
            .insert(sub_id, Arc::clone(&sub));
        sub.run_handler().await;
    }

    /// Stop a named subscription and answer `nosub`. Unknown ids still
    /// answer `nosub` (unsubscription is idempotent).
    pub(crate) fn stop_subscription(
        &self,
        sub_id: &str,
        error: Option<ClientError>,
    ) {
        let sub = self.subscriptions.lock().expect("session poisoned").named.remove(sub_id);
        if let Some(sub) = sub {
            sub.deactivate();
            // 1a clients drop a stopped subscription's documents
            // themselves.
            if self.version != "1a" {
                sub.remove_all_documents();
            }
        }
        self.sender.send(ServerMessage::Nosub {
            id: sub_id.to_string(),
            error,
        });
    }

    async fn handle_method(
        &self,
        method_id: String,
        method: String,
        params: Vec<Value>,
        random_seed: Option<String>,
    ) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let Some(handler) = server.method_handler(&method) else {
            self.sender.send(ServerMessage::Result {
                id: method_id.clone(),
                result: None,
                error: Some(ClientError::not_found(format!("Method '{method}' not found"))),
            });
            self.sender.send(ServerMessage::Updated {
                methods: vec![method_id],
            });
            return;
        };

        let params = match from_wire_params(&params) {
            Ok(params) => params,
            Err(err) => {
                self.sender.send(ServerMessage::Result {
                    id: method_id.clone(),
                    result: None,
                    error: Some(err),
                });
                self.sender.send(ServerMessage::Updated {
                    methods: vec![method_id],
                });
                return;
            }
        };

        let this = self.weak_self.upgrade().expect("session alive");
        let fence = WriteFence::new();
        let (unblock_tx, unblock_rx) = oneshot::channel();
        let context = MethodContext::new(Some(Arc::clone(&this)), random_seed, Some(unblock_tx));

        let session = this;
        let method_fence = fence.clone();
        let mut invocation = tokio::spawn(async move {
            let output =
                WriteFence::scope(method_fence.clone(), (handler)(context, params)).await;
            let message = match output {
                Ok(result) => ServerMessage::Result {
                    id: method_id.clone(),
                    result: result.map(|v| to_wire(&v)),
                    error: None,
                },
                Err(err) => ServerMessage::Result {
                    id: method_id.clone(),
                    result: None,
                    error: Some(err.into_payload()),
                },
            };
            session.sender.send(message);

            // The ack waits for every observer flush the method caused.
            let updated_session = Arc::clone(&session);
            let register = method_fence.on_all_committed(move |fence| {
                updated_session.sender.send(ServerMessage::Updated {
                    methods: vec![method_id],
                });
                if let Err(err) = fence.retire() {
                    error!("[Session] fence retire failed: {err}");
                }
            });
            if let Err(err) = register {
                error!("[Session] fence completion registration failed: {err}");
            }
            if let Err(err) = method_fence.arm() {
                error!("[Session] fence arm failed: {err}");
            }
        });

        // Hold the inbox until the method finishes, unless the handler
        // releases it early.
        tokio::select! {
            _ = &mut invocation => {}
            unblocked = unblock_rx => {
                if unblocked.is_err() {
                    // The context was dropped without unblocking; the
                    // invocation is (nearly) done, wait it out.
                    let _ = invocation.await;
                }
                // On unblock the invocation keeps running detached.
            }
        }
    }

    // ---- merge-box access (called from subscriptions) ----

    fn with_view<R>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut SessionCollectionView) -> R,
    ) -> R {
        let mut views = self.views.lock().expect("session poisoned");
        let view = views.entry(collection.to_string()).or_insert_with(|| {
            SessionCollectionView::new(collection, Arc::new(self.sender.clone()))
        });
        let result = f(view);
        if view.is_empty() {
            views.remove(collection);
        }
        result
    }

    pub(crate) fn merge_added(
        &self,
        subscription_handle: &str,
        collection: &str,
        id: &str,
        fields: &Fields,
    ) {
        self.with_view(collection, |view| view.added(subscription_handle, id, fields));
    }

    pub(crate) fn merge_changed(
        &self,
        subscription_handle: &str,
        collection: &str,
        id: &str,
        patch: &FieldPatch,
    ) {
        let result =
            self.with_view(collection, |view| view.changed(subscription_handle, id, patch));
        if let Err(err) = result {
            error!("[Session-{}] merge-box changed: {err}", self.id);
        }
    }

    pub(crate) fn merge_removed(
        &self,
        subscription_handle: &str,
        collection: &str,
        id: &str,
    ) {
        let result = self.with_view(collection, |view| view.removed(subscription_handle, id));
        if let Err(err) = result {
            error!("[Session-{}] merge-box removed: {err}", self.id);
        }
    }

    // ---- direct send path (strategies that bypass the merge-box) ----

    pub(crate) fn send_added_direct(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
    ) {
        self.sender.send_added(collection, id, fields);
    }

    pub(crate) fn send_changed_direct(
        &self,
        collection: &str,
        id: &str,
        patch: &FieldPatch,
    ) {
        self.sender.send_changed(collection, id, patch);
    }

    pub(crate) fn send_removed_direct(
        &self,
        collection: &str,
        id: &str,
    ) {
        self.sender.send_removed(collection, id);
    }

    pub(crate) fn send_ready(
        &self,
        subs: Vec<String>,
    ) {
        self.sender.send_ready(subs);
    }

    pub(crate) fn begin_init_batch(
        &self,
        collection: &str,
    ) {
        self.sender.begin_init_batch(collection);
    }

    pub(crate) fn end_init_batch(&self) {
        self.sender.end_init_batch();
    }

    // ---- user id rebind ----

    /// Swap the session's user id: snapshot the views, deactivate and
    /// rerun every subscription under the new identity, then send the
    /// client the minimal diff between what it has and what it should
    /// now have.
    pub(crate) async fn set_user_id(
        &self,
        user_id: Option<String>,
    ) {
        debug!("[Session-{}] rebinding user id", self.id);
        let old_snapshot = self.snapshot_views();
        self.sender.set_sending(false);

        let (named, universal) = {
            let mut subscriptions = self.subscriptions.lock().expect("session poisoned");
            (
                std::mem::take(&mut subscriptions.named),
                std::mem::take(&mut subscriptions.universal),
            )
        };
        for sub in named.values().chain(universal.iter()) {
            sub.deactivate();
        }
        self.views.lock().expect("session poisoned").clear();
        *self.user_id.lock().expect("session poisoned") = user_id;

        let this = self.weak_self.upgrade().expect("session alive");
        for (sub_id, old_sub) in named {
            let fresh = old_sub.recreate(&this);
            self.subscriptions
                .lock()
                .expect("session poisoned")
                .named
                .insert(sub_id, Arc::clone(&fresh));
            fresh.run_handler().await;
        }
        for old_sub in universal {
            let fresh = old_sub.recreate(&this);
            self.subscriptions
                .lock()
                .expect("session poisoned")
                .universal
                .push(Arc::clone(&fresh));
            fresh.run_handler().await;
        }

        let new_snapshot = self.snapshot_views();
        self.sender.set_sending(true);
        self.send_view_diff(old_snapshot, new_snapshot);
        self.sender.flush_pending_ready();
    }

    fn snapshot_views(&self) -> HashMap<String, HashMap<String, Fields>> {
        let views = self.views.lock().expect("session poisoned");
        views.iter().map(|(name, view)| (name.clone(), view.snapshot())).collect()
    }

    /// Emit the per-document difference between two view snapshots.
    fn send_view_diff(
        &self,
        old: HashMap<String, HashMap<String, Fields>>,
        new: HashMap<String, HashMap<String, Fields>>,
    ) {
        for (collection, old_docs) in &old {
            let new_docs = new.get(collection);
            for (id, old_fields) in old_docs {
                match new_docs.and_then(|docs| docs.get(id)) {
                    None => self.sender.send_removed(collection, id),
                    Some(new_fields) => {
                        let patch = diff_fields(old_fields, new_fields);
                        self.sender.send_changed(collection, id, &patch);
                    }
                }
            }
        }
        for (collection, new_docs) in new {
            let old_docs = old.get(&collection);
            for (id, fields) in new_docs {
                if !old_docs.is_some_and(|docs| docs.contains_key(&id)) {
                    self.sender.send_added(&collection, &id, fields);
                }
            }
        }
    }

    // ---- teardown ----

    /// Close the session: stop the worker and heartbeat, drop the
    /// socket, and deactivate subscriptions on a deferred task.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[Session-{}] closing", self.id);
        if let Some(heartbeat) = self.heartbeat.lock().expect("session poisoned").take() {
            heartbeat.stop();
        }
        let _ = self.shutdown_tx.send(true);
        self.sender.close();
        if let Some(server) = self.server.upgrade() {
            server.remove_session(&self.id);
        }

        let session = self.weak_self.upgrade().expect("session alive");
        tokio::spawn(async move {
            let (named, universal) = {
                let mut subscriptions = session.subscriptions.lock().expect("session poisoned");
                (
                    std::mem::take(&mut subscriptions.named),
                    std::mem::take(&mut subscriptions.universal),
                )
            };
            for sub in named.values().chain(universal.iter()) {
                sub.deactivate();
            }
            let callbacks =
                std::mem::take(&mut *session.close_callbacks.lock().expect("session poisoned"));
            for callback in callbacks {
                callback();
            }
        });
    }
}
