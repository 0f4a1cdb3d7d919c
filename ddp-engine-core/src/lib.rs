//! # ddp-engine-core
//!
//! The live-data engine behind a reactive-data protocol server.
//!
//! ## What this crate provides
//!
//! - **Observe multiplexing** - one store query feeding any number of subscribers with a consistent
//!   snapshot-plus-deltas view
//! - **Polling drivers** - invalidation-triggered, throttled query re-execution with diffing
//! - **Write fences** - barriers tying a method's acknowledgment to observer flushes
//! - **Invalidation crossbar** - pattern-matched change notification between writers and observers
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────┐
//! │   ddp-engine-server (sessions)    │
//! ├───────────────────────────────────┤
//! │   ddp-engine-core (this crate)    │
//! ├───────────────────────────────────┤
//! │   Your store │ matcher │ oplog    │  ← collaborator traits
//! └───────────────────────────────────┘
//! ```
//!
//! The document store, selector matcher/sorter, and oplog tailer are
//! collaborator traits in [`store`]; this crate never talks to a real
//! database.
//!
//! ## Key types
//!
//! - [`LiveConnection`] - observe registry + fenced write helpers
//! - [`ObserveMultiplexer`](observe::ObserveMultiplexer) / [`ObserveHandle`](observe::ObserveHandle)
//! - [`PollingObserveDriver`](observe::PollingObserveDriver)
//! - [`WriteFence`] / [`Crossbar`]
//! - [`TaskQueue`] - the strict FIFO executor every actor runs on

mod config;
mod crossbar;
mod cursor;
mod errors;
mod fence;
mod live;
mod task_queue;
mod utils;

pub mod diff;
pub mod observe;
pub mod store;

pub use config::EngineConfig;
pub use config::HeartbeatConfig;
pub use config::PollingConfig;
pub use config::TransportConfig;
pub use crossbar::Crossbar;
pub use crossbar::ListenHandle;
pub use cursor::CursorDescription;
pub use cursor::CursorOptions;
pub use cursor::canonical_string;
pub use errors::Error;
pub use errors::FenceError;
pub use errors::ObserveError;
pub use errors::QueueError;
pub use errors::Result;
pub use errors::StoreError;
pub use fence::FenceWrite;
pub use fence::WriteFence;
pub use live::LiveConnection;
pub use task_queue::TaskQueue;
pub use utils::random_id;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

#[cfg(test)]
mod diff_test;
