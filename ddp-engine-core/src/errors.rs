//! Live-Data Engine Error Hierarchy
//!
//! Defines error types for the reactive engine, categorized by component:
//! task queues, write fences, observe machinery, and the document store
//! boundary.

use ddp_engine_proto::ClientError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Task queue lifecycle failures
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Write fence lifecycle violations
    #[error(transparent)]
    Fence(#[from] FenceError),

    /// Observe multiplexer / cache / driver contract violations
    #[error(transparent)]
    Observe(#[from] ObserveError),

    /// Document store failures
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Cursor construction failures (bad selector, bad options)
    #[error(transparent)]
    Cursor(#[from] ClientError),

    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    /// Unrecoverable failures requiring engine shutdown
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue's worker is gone; the task result will never arrive.
    #[error("Task queue stopped before the task completed")]
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum FenceError {
    /// `begin_write` once the fence has fired (and is not retired).
    #[error("Fence cannot accept writes: it has already fired")]
    WriteAfterFire,

    /// Arming the fence that is the current scoped fence would deadlock
    /// the method that owns it.
    #[error("Cannot arm the current write fence from inside its own scope")]
    ArmCurrentFence,

    /// `retire` is only legal on a fence that has fired.
    #[error("Cannot retire a fence that has not fired")]
    RetireBeforeFire,

    /// Completion callbacks cannot be added once the fence has fired.
    #[error("Fence has already fired; completion callback would never run")]
    CallbackAfterFire,
}

#[derive(Debug, thiserror::Error)]
pub enum ObserveError {
    /// A non-add event arrived before the readiness barrier; the driver
    /// is broken.
    #[error("Observe event '{kind}' received before the multiplexer was ready")]
    NotReady { kind: &'static str },

    /// `ready` is single-shot.
    #[error("Multiplexer marked ready twice")]
    AlreadyReady,

    /// `query_error` is only legal before the readiness barrier.
    #[error("query_error after the multiplexer was ready")]
    QueryErrorAfterReady,

    /// The multiplexer has stopped; no more handles can be attached.
    #[error("Multiplexer already stopped")]
    Stopped,

    /// A `changed`, `moved_before` or `removed` named a document the
    /// cache does not hold.
    #[error("Observe event for unknown document '{id}'")]
    MissingDocument { id: String },

    /// An ordered-only event reached an unordered cache or vice versa.
    #[error("Observe event '{kind}' is not valid for this cache mode")]
    WrongMode { kind: &'static str },
}

/// Errors from the document store collaborator.
///
/// A numeric `code` marks a permanent query error (for example a selector
/// the store cannot compile); errors without a code are transient and the
/// polling driver retries them.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Store error{}: {message}", .code.map(|c| format!(" (code {c})")).unwrap_or_default())]
pub struct StoreError {
    pub code: Option<i64>,
    pub message: String,
}

impl StoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn permanent(
        code: i64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.code.is_some()
    }
}
