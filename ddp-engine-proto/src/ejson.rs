//! EJSON-style value adjustment.
//!
//! The wire carries plain JSON, so richer types travel as single-key
//! wrapper objects: `{"$date": <ms>}`, `{"$binary": <base64>}`,
//! `{"$type": "Decimal", "$value": <string>}`. This module does not decode
//! wrappers into native types; it guarantees the round trip instead:
//!
//! - recognized wrappers pass through untouched (binary payloads are
//!   validated as base64 on the way in),
//! - any other object containing a `$`-prefixed key is escaped as
//!   `{"$escape": {...}}` on the way out and unescaped on the way in, so
//!   user data can never be mistaken for a wrapper.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Map;
use serde_json::Value;

use crate::error::ClientError;

/// True if this object is one of the recognized type wrappers.
fn is_wrapper(map: &Map<String, Value>) -> bool {
    if map.len() == 1 {
        return map.contains_key("$date") || map.contains_key("$binary") || map.contains_key("$escape");
    }
    if map.len() == 2 {
        return map.contains_key("$type") && map.contains_key("$value");
    }
    false
}

fn has_dollar_key(map: &Map<String, Value>) -> bool {
    map.keys().any(|k| k.starts_with('$'))
}

/// Adjust an in-memory value for the wire.
///
/// Wrappers pass through; other objects with `$`-prefixed keys are wrapped
/// in `$escape`. Arrays and nested objects are adjusted recursively.
pub fn to_wire(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(to_wire).collect()),
        Value::Object(map) => {
            if is_wrapper(map) {
                return value.clone();
            }
            let adjusted: Map<String, Value> =
                map.iter().map(|(k, v)| (k.clone(), to_wire(v))).collect();
            if has_dollar_key(map) {
                let mut escaped = Map::new();
                escaped.insert("$escape".to_string(), Value::Object(adjusted));
                Value::Object(escaped)
            } else {
                Value::Object(adjusted)
            }
        }
        other => other.clone(),
    }
}

/// Adjust a wire value for in-memory use. Inverse of [`to_wire`].
///
/// Rejects malformed wrappers (a `$binary` that is not valid base64, a
/// `$date` that is not a number) so protocol errors surface at the
/// boundary rather than deep inside a subscription.
pub fn from_wire(value: &Value) -> Result<Value, ClientError> {
    match value {
        Value::Array(items) => {
            let out: Result<Vec<Value>, ClientError> = items.iter().map(from_wire).collect();
            Ok(Value::Array(out?))
        }
        Value::Object(map) => {
            if let Some(inner) = map.get("$escape") {
                if map.len() == 1 {
                    let Value::Object(inner_map) = inner else {
                        return Err(ClientError::bad_request("$escape payload must be an object"));
                    };
                    let mut out = Map::new();
                    for (k, v) in inner_map {
                        out.insert(k.clone(), from_wire(v)?);
                    }
                    return Ok(Value::Object(out));
                }
            }
            if is_wrapper(map) {
                validate_wrapper(map)?;
                return Ok(value.clone());
            }
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), from_wire(v)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn validate_wrapper(map: &Map<String, Value>) -> Result<(), ClientError> {
    if let Some(date) = map.get("$date") {
        if !date.is_number() {
            return Err(ClientError::bad_request("$date must be a number of milliseconds"));
        }
    }
    if let Some(binary) = map.get("$binary") {
        let Value::String(b64) = binary else {
            return Err(ClientError::bad_request("$binary must be a base64 string"));
        };
        BASE64
            .decode(b64)
            .map_err(|_| ClientError::bad_request("$binary is not valid base64"))?;
    }
    if let Some(type_name) = map.get("$type") {
        if !type_name.is_string() {
            return Err(ClientError::bad_request("$type must be a string"));
        }
        if !map.get("$value").is_some_and(Value::is_string) {
            return Err(ClientError::bad_request("$value must be a string"));
        }
    }
    Ok(())
}

/// Adjust every value of an outbound field map.
pub fn to_wire_fields(fields: &crate::Fields) -> crate::Fields {
    fields.iter().map(|(key, value)| (key.clone(), to_wire(value))).collect()
}

/// Adjust an outbound field patch, leaving clears untouched.
pub fn to_wire_patch(patch: &crate::FieldPatch) -> crate::FieldPatch {
    patch
        .iter()
        .map(|(key, change)| (key.clone(), change.as_ref().map(to_wire)))
        .collect()
}

/// Adjust inbound call parameters; any malformed wrapper rejects the
/// whole list.
pub fn from_wire_params(params: &[Value]) -> Result<Vec<Value>, ClientError> {
    params.iter().map(from_wire).collect()
}

/// Wrap a millisecond timestamp as an EJSON date.
pub fn date(ms: i64) -> Value {
    serde_json::json!({ "$date": ms })
}

/// Wrap raw bytes as an EJSON binary value.
pub fn binary(bytes: &[u8]) -> Value {
    serde_json::json!({ "$binary": BASE64.encode(bytes) })
}

/// Wrap a decimal string as an EJSON decimal value.
pub fn decimal(repr: &str) -> Value {
    serde_json::json!({ "$type": "Decimal", "$value": repr })
}
