//! Method invocation context and the handler error split.
//!
//! The context is the explicit replacement for ambient "current method"
//! state: handlers receive it by value, and anything they need past a
//! suspension point they already own. The current *write fence* is
//! scoped separately by the session around the handler future (see
//! [`ddp_engine_core::WriteFence::scope`]).

use std::sync::Arc;
use std::sync::Mutex;

use ddp_engine_proto::ClientError;
use tokio::sync::oneshot;
use tracing::error;

use crate::session::Session;

/// What a method or publish handler may fail with.
///
/// Only `Client` errors reach the wire as-is; everything else is logged
/// in full and replaced by a sanitized internal-error payload.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("internal handler error: {0}")]
    Internal(String),
}

impl From<ddp_engine_core::Error> for HandlerError {
    fn from(err: ddp_engine_core::Error) -> Self {
        HandlerError::Internal(err.to_string())
    }
}

impl HandlerError {
    /// The wire-safe payload, logging internals on the way.
    pub fn into_payload(self) -> ClientError {
        match self {
            HandlerError::Client(err) => err,
            HandlerError::Internal(detail) => {
                error!("[Handler] internal error sanitized for the wire: {detail}");
                ClientError::internal()
            }
        }
    }
}

/// `this` for a method handler: the calling session's identity plus the
/// per-call capabilities.
pub struct MethodContext {
    session: Option<Arc<Session>>,
    user_id: Option<String>,
    random_seed: Option<String>,
    unblock_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl MethodContext {
    pub(crate) fn new(
        session: Option<Arc<Session>>,
        random_seed: Option<String>,
        unblock_tx: Option<oneshot::Sender<()>>,
    ) -> Self {
        let user_id = session.as_ref().and_then(|s| s.user_id());
        Self {
            session,
            user_id,
            random_seed,
            unblock_tx: Mutex::new(unblock_tx),
        }
    }

    /// The user id bound to the session when the method started.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// The id-generation seed the client attached, if any.
    pub fn random_seed(&self) -> Option<&str> {
        self.random_seed.as_deref()
    }

    /// The calling session's id; `None` for in-process calls.
    pub fn session_id(&self) -> Option<String> {
        self.session.as_ref().map(|s| s.id().to_string())
    }

    /// Release the session worker: later inbox messages may be processed
    /// while this handler keeps running. Idempotent.
    pub fn unblock(&self) {
        if let Some(tx) = self.unblock_tx.lock().expect("context poisoned").take() {
            let _ = tx.send(());
        }
    }

    /// Rebind the session's user id, rerunning every subscription and
    /// diffing the client's view across the switch.
    ///
    /// Callable from method handlers only (there is no session on an
    /// in-process call without one).
    pub async fn set_user_id(
        &self,
        user_id: Option<String>,
    ) -> Result<(), HandlerError> {
        match &self.session {
            Some(session) => {
                session.set_user_id(user_id).await;
                Ok(())
            }
            None => Err(HandlerError::Internal(
                "set_user_id requires a session-bound method call".to_string(),
            )),
        }
    }
}
