//! The DDP message set and its JSON framing.
//!
//! One JSON object per frame, discriminated by the `msg` key. Client and
//! server message sets are disjoint. The `changed` message is special: a
//! [`FieldPatch`] splits into `fields` (values) and `cleared` (removed
//! field names) on the wire, and the two halves are merged back on
//! receive.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::document::FieldPatch;
use crate::document::Fields;
use crate::error::ClientError;

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ClientMessage {
    Connect {
        version: String,
        #[serde(default)]
        support: Vec<String>,
    },
    Sub {
        id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Vec<Value>>,
    },
    Unsub {
        id: String,
    },
    Method {
        id: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Vec<Value>>,
        #[serde(
            rename = "randomSeed",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        random_seed: Option<String>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

/// The wire form of a [`ClientError`] attached to `nosub` and `result`.
pub type ErrorPayload = ClientError;

/// One document inside an `init` batch (version 1a only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Fields::is_empty")]
    pub fields: Fields,
}

/// Messages the server may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ServerMessage {
    Connected {
        session: String,
    },
    Failed {
        version: String,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Nosub {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
    Added {
        collection: String,
        id: String,
        #[serde(default, skip_serializing_if = "Fields::is_empty")]
        fields: Fields,
    },
    Changed {
        collection: String,
        id: String,
        #[serde(default, skip_serializing_if = "Fields::is_empty")]
        fields: Fields,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        cleared: Vec<String>,
    },
    Removed {
        collection: String,
        id: String,
    },
    Ready {
        subs: Vec<String>,
    },
    Updated {
        methods: Vec<String>,
    },
    Result {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
    Error {
        reason: String,
        #[serde(
            rename = "offendingMessage",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        offending_message: Option<Value>,
    },
    Init {
        collection: String,
        items: Vec<InitItem>,
    },
}

impl ServerMessage {
    /// Build a `changed` message from an in-memory field patch, splitting
    /// removals into the `cleared` array.
    pub fn changed(
        collection: impl Into<String>,
        id: impl Into<String>,
        patch: &FieldPatch,
    ) -> Self {
        let mut fields = Fields::new();
        let mut cleared = Vec::new();
        for (key, change) in patch {
            match change {
                Some(value) => {
                    fields.insert(key.clone(), value.clone());
                }
                None => cleared.push(key.clone()),
            }
        }
        ServerMessage::Changed {
            collection: collection.into(),
            id: id.into(),
            fields,
            cleared,
        }
    }

    /// Merge `fields` and `cleared` back into a field patch. Inverse of
    /// [`ServerMessage::changed`].
    pub fn patch_from_wire(
        fields: &Fields,
        cleared: &[String],
    ) -> FieldPatch {
        let mut patch = FieldPatch::new();
        for (key, value) in fields {
            patch.insert(key.clone(), Some(value.clone()));
        }
        for key in cleared {
            patch.insert(key.clone(), None);
        }
        patch
    }
}

/// Why an inbound frame could not become a [`ClientMessage`].
///
/// Carries the parsed value (when there was one) so the server can echo it
/// back as `offendingMessage` per the protocol-error contract.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("frame is not valid JSON: {reason}")]
    Json { reason: String },
    #[error("frame is not a DDP message: {reason}")]
    Message {
        reason: String,
        offending: Value,
    },
}

impl ParseError {
    pub fn offending_message(&self) -> Option<Value> {
        match self {
            ParseError::Json { .. } => None,
            ParseError::Message { offending, .. } => Some(offending.clone()),
        }
    }
}

/// Parse one inbound frame.
pub fn parse_ddp(frame: &str) -> Result<ClientMessage, ParseError> {
    let value: Value = serde_json::from_str(frame).map_err(|e| ParseError::Json {
        reason: e.to_string(),
    })?;
    serde_json::from_value(value.clone()).map_err(|e| ParseError::Message {
        reason: e.to_string(),
        offending: value,
    })
}

/// Serialize one outbound frame.
pub fn stringify_ddp(message: &ServerMessage) -> String {
    // Message enums contain nothing that can fail to serialize.
    serde_json::to_string(message).unwrap_or_else(|_| String::from("{}"))
}

/// Serialize a client message; used by tests and embedded clients.
pub fn stringify_client(message: &ClientMessage) -> String {
    serde_json::to_string(message).unwrap_or_else(|_| String::from("{}"))
}
