//! # ddp-engine
//!
//! A server for a reactive-data protocol: clients subscribe to named
//! publications over a message-framed transport and receive an initial
//! snapshot plus a live delta feed drawn from a document store; server
//! methods are acknowledged only after every affected session has seen
//! the changes they caused (the write fence).
//!
//! This crate is the batteries-included facade. The pieces live in:
//!
//! - [`ddp_engine_core`] - observe multiplexing, polling drivers, write fences, the crossbar
//! - [`ddp_engine_server`] - sessions, subscriptions, the merge-box, method dispatch
//! - [`ddp_engine_proto`] - the wire message set and document model
//!
//! ## Example
//!
//! ```rust,ignore
//! use ddp_engine::{
//!     CursorDescription, CursorOptions, EngineConfig, LiveConnection, LiveCursor,
//!     PublishOutcome, Server,
//! };
//! use serde_json::json;
//!
//! let config = EngineConfig::load()?;
//! let live = LiveConnection::new(store, config.clone());
//! let server = Server::new(live.clone(), config);
//!
//! server.publish(Some("apples"), move |_sub, _params| {
//!     let live = live.clone();
//!     async move {
//!         Ok(PublishOutcome::Cursor(Box::new(LiveCursor {
//!             connection: live,
//!             description: CursorDescription::new(
//!                 "fruit",
//!                 json!({"category": "apples"}),
//!                 CursorOptions::default(),
//!             )?,
//!         })))
//!     }
//! });
//! ```
//!
//! Storage and the socket layer are collaborator traits
//! ([`store::DocumentStore`], [`ConnectionSink`]); bring your own.
//!
//! [`store::DocumentStore`]: ddp_engine_core::store::DocumentStore

pub use ddp_engine_core::Crossbar;
pub use ddp_engine_core::CursorDescription;
pub use ddp_engine_core::CursorOptions;
pub use ddp_engine_core::EngineConfig;
pub use ddp_engine_core::HeartbeatConfig;
pub use ddp_engine_core::LiveConnection;
pub use ddp_engine_core::PollingConfig;
pub use ddp_engine_core::WriteFence;
pub use ddp_engine_core::diff;
pub use ddp_engine_core::observe;
pub use ddp_engine_core::store;

pub use ddp_engine_proto::ClientError;
pub use ddp_engine_proto::ClientMessage;
pub use ddp_engine_proto::Document;
pub use ddp_engine_proto::FieldPatch;
pub use ddp_engine_proto::Fields;
pub use ddp_engine_proto::ServerMessage;
pub use ddp_engine_proto::parse_ddp;
pub use ddp_engine_proto::stringify_ddp;

pub use ddp_engine_server::ConnectionHandle;
pub use ddp_engine_server::ConnectionSink;
pub use ddp_engine_server::HandlerError;
pub use ddp_engine_server::LiveCursor;
pub use ddp_engine_server::MethodContext;
pub use ddp_engine_server::PublicationStrategy;
pub use ddp_engine_server::PublishOutcome;
pub use ddp_engine_server::PublishableCursor;
pub use ddp_engine_server::RawConnection;
pub use ddp_engine_server::Server;
pub use ddp_engine_server::Session;
pub use ddp_engine_server::Subscription;
