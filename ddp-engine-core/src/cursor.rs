//! Cursor descriptions: the immutable (collection, selector, options)
//! triple that identifies a query.
//!
//! Two descriptions are equivalent iff their canonical serializations are
//! byte-equal; that string is the dedup key for observe multiplexers.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::utils::random_id;
use ddp_engine_proto::ClientError;

/// Query options the engine recognizes. Everything else belongs to the
/// store collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projection: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    pub tailable: bool,
    pub disable_oplog: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polling_throttle_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polling_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_time_ms: Option<u64>,
}

/// An immutable description of a query against one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorDescription {
    pub collection: String,
    pub selector: Value,
    pub options: CursorOptions,
}

impl CursorDescription {
    /// Build a description, applying the selector rewrite:
    ///
    /// - an array selector is rejected outright;
    /// - a string selector is shorthand for `{_id: <string>}`;
    /// - `null`, `{}`, and any selector whose `_id` is present but falsy
    ///   rewrite to a fresh `{_id: <random>}` that matches nothing.
    pub fn new(
        collection: impl Into<String>,
        selector: Value,
        options: CursorOptions,
    ) -> Result<Self, ClientError> {
        let selector = rewrite_selector(selector)?;
        Ok(Self {
            collection: collection.into(),
            selector,
            options,
        })
    }

    /// The multiplexer dedup key: a canonical (sorted-key) serialization
    /// of the ordered flag plus the full description.
    pub fn canonical_key(
        &self,
        ordered: bool,
    ) -> String {
        let value = json!({
            "ordered": ordered,
            "collection": self.collection,
            "selector": self.selector,
            "options": serde_json::to_value(&self.options).unwrap_or(Value::Null),
        });
        canonical_string(&value)
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn rewrite_selector(selector: Value) -> Result<Value, ClientError> {
    match selector {
        Value::Array(_) => Err(ClientError::bad_request("selector cannot be an array")),
        Value::String(id) => Ok(json!({ "_id": id })),
        Value::Null => Ok(unmatchable()),
        Value::Object(map) => {
            if map.is_empty() || map.get("_id").is_some_and(is_falsy) {
                Ok(unmatchable())
            } else {
                Ok(Value::Object(map))
            }
        }
        other => Err(ClientError::bad_request(format!(
            "selector must be an object, string or null, got {other}"
        ))),
    }
}

/// A selector that matches no document: a fresh random id no real
/// document can carry.
fn unmatchable() -> Value {
    json!({ "_id": random_id() })
}

/// Serialize with object keys sorted recursively, so equivalent values
/// have byte-equal representations.
pub fn canonical_string(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = serde_json::Map::new();
                for key in keys {
                    out.insert(key.clone(), sort(&map[key]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    // Sorted maps serialize deterministically; this cannot fail.
    serde_json::to_string(&sort(value)).unwrap_or_default()
}
