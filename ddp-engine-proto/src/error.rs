//! The only error shape that ever crosses the wire.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// A client-safe error: an HTTP-like integer or symbolic string code,
/// an optional human-readable reason, and optional structured details.
///
/// Anything that is not a `ClientError` must be replaced by
/// [`ClientError::internal`] before serialization; the original belongs in
/// the server log, never on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientError {
    /// HTTP-like integer (e.g. `404`) or symbolic string code.
    pub error: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl std::fmt::Display for ClientError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "[{}] {}", self.error, reason),
            None => write!(f, "[{}]", self.error),
        }
    }
}

impl std::error::Error for ClientError {}

impl ClientError {
    pub fn new(code: impl Into<Value>) -> Self {
        Self {
            error: code.into(),
            reason: None,
            details: None,
        }
    }

    pub fn with_reason(
        code: impl Into<Value>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            error: code.into(),
            reason: Some(reason.into()),
            details: None,
        }
    }

    pub fn details(
        mut self,
        details: Value,
    ) -> Self {
        self.details = Some(details);
        self
    }

    /// The sanitized stand-in for any internal failure.
    pub fn internal() -> Self {
        Self::with_reason(500, "Internal server error")
    }

    /// Malformed input from a client.
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::with_reason(400, reason)
    }

    /// Unknown publication or method.
    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::with_reason(404, reason)
    }
}
