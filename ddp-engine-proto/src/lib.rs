//! # ddp-engine-proto
//!
//! Wire-level types shared by every ddp-engine crate:
//!
//! - [`Document`] and the field-map/field-patch model
//! - The DDP message set ([`ClientMessage`], [`ServerMessage`]) with
//!   [`parse_ddp`] / [`stringify_ddp`]
//! - The `cleared` ↔ field-removal transform applied to `changed` messages
//! - EJSON-style value adjustment (dates, binary, decimal wrappers)
//! - [`ClientError`], the only error shape that ever reaches a client
//! - Protocol version negotiation
//!
//! Everything here is plain data: no I/O, no runtime. The transport that
//! moves these frames is a collaborator of `ddp-engine-server`, not part
//! of this workspace.

mod document;
mod ejson;
mod error;
mod message;
mod version;

pub use document::Document;
pub use document::FieldPatch;
pub use document::Fields;
pub use document::apply_patch;
pub use error::ClientError;
pub use message::ClientMessage;
pub use message::ErrorPayload;
pub use message::InitItem;
pub use message::ParseError;
pub use message::ServerMessage;
pub use message::parse_ddp;
pub use message::stringify_client;
pub use message::stringify_ddp;
pub use version::Negotiation;
pub use version::SUPPORTED_VERSIONS;
pub use version::negotiate_version;
pub use version::version_supports_ping;

pub use ejson::from_wire;
pub use ejson::from_wire_params;
pub use ejson::to_wire;
pub use ejson::to_wire_fields;
pub use ejson::to_wire_patch;
