//! # Server
//!
//! The registry of publications, methods, and live sessions, plus the
//! connection accept path (version negotiation and frame routing).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::Weak;

use dashmap::DashMap;
use ddp_engine_core::EngineConfig;
use ddp_engine_core::LiveConnection;
use ddp_engine_core::WriteFence;
use ddp_engine_proto::ClientMessage;
use ddp_engine_proto::Negotiation;
use ddp_engine_proto::ServerMessage;
use ddp_engine_proto::negotiate_version;
use ddp_engine_proto::parse_ddp;
use ddp_engine_proto::stringify_ddp;
use serde_json::Value;
use tracing::debug;
use tracing::info;

use crate::method::HandlerError;
use crate::method::MethodContext;
use crate::session::PublishHandler;
use crate::session::PublishOutcome;
use crate::session::Session;
use crate::session::Subscription;
use crate::strategy::PublicationStrategy;
use crate::transport::RawConnection;

type MethodHandler = Arc<
    dyn Fn(
            MethodContext,
            Vec<Value>,
        ) -> futures::future::BoxFuture<'static, Result<Option<Value>, HandlerError>>
        + Send
        + Sync,
>;

type ConnectionHook = Arc<dyn Fn(&ConnectionHandle) + Send + Sync>;
type MessageHook = Arc<dyn Fn(&str) + Send + Sync>;

/// What a connection hook receives: enough of the session to identify,
/// observe, and close it.
pub struct ConnectionHandle {
    session: Weak<Session>,
    id: String,
    client_address: Option<String>,
    http_headers: HashMap<String, String>,
}

impl ConnectionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_address(&self) -> Option<&str> {
        self.client_address.as_deref()
    }

    pub fn http_headers(&self) -> &HashMap<String, String> {
        &self.http_headers
    }

    pub fn close(&self) {
        if let Some(session) = self.session.upgrade() {
            session.close();
        }
    }

    pub fn on_close<F>(
        &self,
        callback: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        if let Some(session) = self.session.upgrade() {
            session.on_close(callback);
        }
    }
}

pub(crate) struct ServerInner {
    config: EngineConfig,
    live: Arc<LiveConnection>,
    publish_handlers: RwLock<HashMap<String, PublishHandler>>,
    universal_publish_handlers: RwLock<Vec<PublishHandler>>,
    method_handlers: RwLock<HashMap<String, MethodHandler>>,
    sessions: DashMap<String, Arc<Session>>,
    strategies: RwLock<HashMap<String, PublicationStrategy>>,
    default_strategy: RwLock<PublicationStrategy>,
    connection_hooks: Mutex<Vec<ConnectionHook>>,
    message_hooks: Mutex<Vec<MessageHook>>,
}

impl ServerInner {
    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn publish_handler(
        &self,
        name: &str,
    ) -> Option<PublishHandler> {
        self.publish_handlers.read().expect("server poisoned").get(name).cloned()
    }

    pub(crate) fn universal_publish_handlers(&self) -> Vec<PublishHandler> {
        self.universal_publish_handlers.read().expect("server poisoned").clone()
    }

    pub(crate) fn method_handler(
        &self,
        name: &str,
    ) -> Option<MethodHandler> {
        self.method_handlers.read().expect("server poisoned").get(name).cloned()
    }

    pub(crate) fn publication_strategy(
        &self,
        name: Option<&str>,
    ) -> PublicationStrategy {
        if let Some(name) = name {
            if let Some(strategy) =
                self.strategies.read().expect("server poisoned").get(name)
            {
                return *strategy;
            }
        }
        *self.default_strategy.read().expect("server poisoned")
    }

    pub(crate) fn remove_session(
        &self,
        id: &str,
    ) {
        self.sessions.remove(id);
    }
}

/// The reactive-data protocol server. Cheap to clone; all clones share
/// one registry.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(
        live: Arc<LiveConnection>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                live,
                publish_handlers: RwLock::new(HashMap::new()),
                universal_publish_handlers: RwLock::new(Vec::new()),
                method_handlers: RwLock::new(HashMap::new()),
                sessions: DashMap::new(),
                strategies: RwLock::new(HashMap::new()),
                default_strategy: RwLock::new(PublicationStrategy::default()),
                connection_hooks: Mutex::new(Vec::new()),
                message_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The shared live store connection (for building [`LiveCursor`]s
    /// and writing from method handlers).
    ///
    /// [`LiveCursor`]: crate::session::LiveCursor
    pub fn live(&self) -> Arc<LiveConnection> {
        Arc::clone(&self.inner.live)
    }

    /// Register a named publication, or a universal one with
    /// `name = None` (auto-started on every session, including those
    /// already connected).
    pub fn publish<F, Fut>(
        &self,
        name: Option<&str>,
        handler: F,
    ) where
        F: Fn(Arc<Subscription>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PublishOutcome, HandlerError>> + Send + 'static,
    {
        let handler: PublishHandler =
            Arc::new(move |sub, params| Box::pin(handler(sub, params)));
        match name {
            Some(name) => {
                self.inner
                    .publish_handlers
                    .write()
                    .expect("server poisoned")
                    .insert(name.to_string(), handler);
            }
            None => {
                self.inner
                    .universal_publish_handlers
                    .write()
                    .expect("server poisoned")
                    .push(Arc::clone(&handler));
                for session in self.inner.sessions.iter() {
                    session.value().start_universal_sub(Arc::clone(&handler));
                }
            }
        }
    }

    /// Register a method.
    pub fn method<F, Fut>(
        &self,
        name: &str,
        handler: F,
    ) where
        F: Fn(MethodContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, HandlerError>> + Send + 'static,
    {
        let handler: MethodHandler =
            Arc::new(move |context, params| Box::pin(handler(context, params)));
        self.inner
            .method_handlers
            .write()
            .expect("server poisoned")
            .insert(name.to_string(), handler);
    }

    /// Pick the strategy for one publication name.
    pub fn set_publication_strategy(
        &self,
        name: &str,
        strategy: PublicationStrategy,
    ) {
        self.inner
            .strategies
            .write()
            .expect("server poisoned")
            .insert(name.to_string(), strategy);
    }

    /// Change the process-wide default strategy.
    pub fn set_default_publication_strategy(
        &self,
        strategy: PublicationStrategy,
    ) {
        *self.inner.default_strategy.write().expect("server poisoned") = strategy;
    }

    /// Observe every session that reaches `connected`.
    pub fn on_connection<F>(
        &self,
        hook: F,
    ) where
        F: Fn(&ConnectionHandle) + Send + Sync + 'static,
    {
        self.inner.connection_hooks.lock().expect("server poisoned").push(Arc::new(hook));
    }

    /// Observe every raw inbound frame.
    pub fn on_message<F>(
        &self,
        hook: F,
    ) where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.message_hooks.lock().expect("server poisoned").push(Arc::new(hook));
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn session(
        &self,
        id: &str,
    ) -> Option<Arc<Session>> {
        self.inner.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    /// Invoke a method in-process: a fresh fence, no session. Resolves
    /// after the write fence has fully committed, so every observer has
    /// seen the method's writes.
    pub async fn call_method(
        &self,
        name: &str,
        params: Vec<Value>,
    ) -> Result<Option<Value>, HandlerError> {
        let handler = self
            .inner
            .method_handler(name)
            .ok_or_else(|| HandlerError::Internal(format!("method '{name}' not found")))?;
        let fence = WriteFence::new();
        let context = MethodContext::new(None, None, None);
        let result = WriteFence::scope(fence.clone(), handler(context, params)).await;
        fence.arm_and_wait().await.map_err(HandlerError::from)?;
        let _ = fence.retire();
        result
    }

    /// Hand the server one accepted transport connection. Spawns the
    /// read loop; returns immediately.
    pub fn handle_connection(
        &self,
        connection: RawConnection,
    ) {
        let server = self.clone();
        tokio::spawn(async move {
            server.connection_loop(connection).await;
        });
    }

    async fn connection_loop(
        &self,
        connection: RawConnection,
    ) {
        let RawConnection {
            mut frames,
            sink,
            remote_address,
            headers,
        } = connection;

        let mut session: Option<Arc<Session>> = None;
        while let Some(frame) = frames.recv().await {
            let message_hooks: Vec<MessageHook> =
                self.inner.message_hooks.lock().expect("server poisoned").clone();
            for hook in &message_hooks {
                hook(&frame);
            }

            if let Some(session) = &session {
                session.note_traffic();
                match parse_ddp(&frame) {
                    Ok(message) => session.queue_message(message),
                    Err(err) => {
                        session.send_protocol_error(err.to_string(), err.offending_message());
                    }
                }
                continue;
            }

            match parse_ddp(&frame) {
                Ok(ClientMessage::Connect {
                    version,
                    support,
                }) => match negotiate_version(&version, &support) {
                    Negotiation::Accepted(version) => {
                        let new_session = Session::new(
                            &self.inner,
                            version,
                            Arc::clone(&sink),
                            remote_address.clone(),
                            headers.clone(),
                        );
                        self.inner
                            .sessions
                            .insert(new_session.id().to_string(), Arc::clone(&new_session));
                        new_session.start();
                        self.run_connection_hooks(&new_session);
                        session = Some(new_session);
                    }
                    Negotiation::Failed(version) => {
                        debug!("[Server] version negotiation failed, offering {version}");
                        sink.send_frame(stringify_ddp(&ServerMessage::Failed {
                            version,
                        }));
                        sink.close();
                        return;
                    }
                },
                Ok(_) => {
                    sink.send_frame(stringify_ddp(&ServerMessage::Error {
                        reason: "Must connect first".to_string(),
                        offending_message: None,
                    }));
                }
                Err(err) => {
                    sink.send_frame(stringify_ddp(&ServerMessage::Error {
                        reason: err.to_string(),
                        offending_message: err.offending_message(),
                    }));
                }
            }
        }

        // Transport gone.
        if let Some(session) = session {
            session.close();
        }
    }

    fn run_connection_hooks(
        &self,
        session: &Arc<Session>,
    ) {
        let handle = ConnectionHandle {
            session: Arc::downgrade(session),
            id: session.id().to_string(),
            client_address: session.client_address(),
            http_headers: session.http_headers().clone(),
        };
        let hooks: Vec<ConnectionHook> =
            self.inner.connection_hooks.lock().expect("server poisoned").clone();
        for hook in &hooks {
            hook(&handle);
        }
        if !hooks.is_empty() {
            info!("[Server] connection hooks ran for session {}", session.id());
        }
    }
}
