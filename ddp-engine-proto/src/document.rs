//! Document model: an id plus a flat map from field name to JSON value.
//!
//! Field maps are `BTreeMap`s so that serialization order is deterministic,
//! which gives cursor descriptions a canonical byte form for free and keeps
//! test output stable.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::ClientError;

/// Field name → value. The identity field `_id` is never stored here.
pub type Fields = BTreeMap<String, Value>;

/// Field name → new value, where `None` means "remove this field".
///
/// This is the in-memory shape of a `changed` event; on the wire the
/// `None` entries become the `cleared` array.
pub type FieldPatch = BTreeMap<String, Option<Value>>;

/// A document: a mandatory string identity plus its fields.
///
/// Identity is immutable for the lifetime of the document; every mutation
/// is expressed as a [`FieldPatch`] against the same id.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        fields: Fields,
    ) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Build a document from a JSON object containing an `_id` string.
    ///
    /// Rejects objects without `_id`, with a non-string `_id`, or
    /// non-object values.
    pub fn from_object(value: Value) -> Result<Self, ClientError> {
        let Value::Object(map) = value else {
            return Err(ClientError::bad_request("document must be an object"));
        };
        let mut fields = Fields::new();
        let mut id = None;
        for (key, val) in map {
            if key == "_id" {
                match val {
                    Value::String(s) => id = Some(s),
                    _ => {
                        return Err(ClientError::bad_request("document _id must be a string"));
                    }
                }
            } else {
                fields.insert(key, val);
            }
        }
        match id {
            Some(id) => Ok(Self { id, fields }),
            None => Err(ClientError::bad_request("document is missing _id")),
        }
    }

    /// The inverse of [`Document::from_object`].
    pub fn to_object(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("_id".to_string(), Value::String(self.id.clone()));
        for (key, val) in &self.fields {
            map.insert(key.clone(), val.clone());
        }
        Value::Object(map)
    }

    /// Apply a field patch in place.
    pub fn apply(
        &mut self,
        patch: &FieldPatch,
    ) {
        apply_patch(&mut self.fields, patch);
    }
}

/// Apply a patch to a field map: `Some` upserts, `None` removes.
pub fn apply_patch(
    fields: &mut Fields,
    patch: &FieldPatch,
) {
    for (key, change) in patch {
        match change {
            Some(value) => {
                fields.insert(key.clone(), value.clone());
            }
            None => {
                fields.remove(key);
            }
        }
    }
}
