//! # ddp-engine-server
//!
//! The protocol server over `ddp-engine-core`: sessions, subscriptions,
//! the merge-box, publication strategies, and method invocation with
//! write-fenced acknowledgments.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use ddp_engine_core::{EngineConfig, LiveConnection, CursorDescription, CursorOptions};
//! use ddp_engine_server::{Server, LiveCursor, PublishOutcome};
//! use serde_json::json;
//!
//! let live = LiveConnection::new(store, EngineConfig::load()?);
//! let server = Server::new(live.clone(), EngineConfig::load()?);
//!
//! server.publish(Some("apples"), move |_sub, _params| {
//!     let live = live.clone();
//!     async move {
//!         let desc = CursorDescription::new(
//!             "fruit",
//!             json!({"category": "apples"}),
//!             CursorOptions::default(),
//!         )?;
//!         Ok(PublishOutcome::Cursor(Box::new(LiveCursor {
//!             connection: live,
//!             description: desc,
//!         })))
//!     }
//! });
//!
//! // For each accepted socket:
//! server.handle_connection(raw_connection);
//! ```
//!
//! The transport (WebSocket framing, long-poll) is a collaborator: it
//! hands the server a [`RawConnection`] per socket and moves text frames
//! both ways.

mod method;
mod server;
mod session;
mod strategy;
mod transport;

pub use method::HandlerError;
pub use method::MethodContext;
pub use server::ConnectionHandle;
pub use server::Server;
pub use session::LiveCursor;
pub use session::PublishHandler;
pub use session::PublishOutcome;
pub use session::PublishableCursor;
pub use session::Session;
pub use session::SessionCollectionView;
pub use session::SessionDocumentView;
pub use session::Subscription;
pub use session::UnknownDocument;
pub use session::ViewCallbacks;
pub use strategy::PublicationStrategy;
pub use transport::ConnectionSink;
pub use transport::RawConnection;
pub use transport::client_address;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
