//! In-memory fakes for tests: a document store with equality selectors
//! and a trivial matcher. Enabled for downstream crates through the
//! `test-utils` feature.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use ddp_engine_proto::Document;
use ddp_engine_proto::FieldPatch;
use ddp_engine_proto::apply_patch;
use serde_json::Value;

use crate::StoreError;
use crate::store::DocumentStore;
use crate::store::FindOptions;
use crate::store::MatchResult;
use crate::store::Matcher;
use crate::store::MatcherFactory;
use crate::store::StoreResult;

/// An in-memory document store.
///
/// Selectors are interpreted as top-level equality (plus `_id`); sort
/// specs as `{field: 1 | -1}` maps applied left to right. That covers
/// what the engine's own tests need; anything fancier belongs to a real
/// store.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Document>>>,
    /// One-shot injected failures, consumed by the next `find`.
    injected_errors: Mutex<Vec<StoreError>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error for the next `find` call.
    pub fn inject_find_error(
        &self,
        error: StoreError,
    ) {
        self.injected_errors.lock().unwrap().push(error);
    }

    pub fn doc_count(
        &self,
        collection: &str,
    ) -> usize {
        self.collections.lock().unwrap().get(collection).map(BTreeMap::len).unwrap_or(0)
    }

    fn matches(
        selector: &Value,
        doc: &Document,
    ) -> bool {
        let Some(map) = selector.as_object() else {
            return true;
        };
        map.iter().all(|(key, want)| {
            if key == "_id" {
                want.as_str() == Some(doc.id.as_str())
            } else {
                doc.fields.get(key) == Some(want)
            }
        })
    }

    fn compare_values(
        a: Option<&Value>,
        b: Option<&Value>,
    ) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => {
                if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
                    return a.partial_cmp(&b).unwrap_or(Ordering::Equal);
                }
                if let (Some(a), Some(b)) = (a.as_str(), b.as_str()) {
                    return a.cmp(b);
                }
                Ordering::Equal
            }
        }
    }

    fn sort_docs(
        docs: &mut [Document],
        sort: &Value,
    ) {
        let Some(spec) = sort.as_object() else {
            return;
        };
        docs.sort_by(|a, b| {
            for (field, direction) in spec {
                let ord = Self::compare_values(a.fields.get(field), b.fields.get(field));
                let ord = if direction.as_i64() == Some(-1) {
                    ord.reverse()
                } else {
                    ord
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.id.cmp(&b.id)
        });
    }

    fn project(
        doc: &Document,
        projection: Option<&Value>,
    ) -> Document {
        let Some(spec) = projection.and_then(Value::as_object) else {
            return doc.clone();
        };
        if spec.is_empty() {
            return doc.clone();
        }
        let including = spec.values().any(|v| v.as_i64() == Some(1) || v.as_bool() == Some(true));
        let mut out = Document::new(doc.id.clone(), Default::default());
        if including {
            for (field, flag) in spec {
                if (flag.as_i64() == Some(1) || flag.as_bool() == Some(true))
                    && doc.fields.contains_key(field)
                {
                    out.fields.insert(field.clone(), doc.fields[field].clone());
                }
            }
        } else {
            out.fields = doc.fields.clone();
            for field in spec.keys() {
                out.fields.remove(field);
            }
        }
        out
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find(
        &self,
        collection: &str,
        selector: &Value,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>> {
        if let Some(error) = self.injected_errors.lock().unwrap().pop() {
            return Err(error);
        }
        let collections = self.collections.lock().unwrap();
        let mut docs: Vec<Document> = collections
            .get(collection)
            .map(|docs| {
                docs.values().filter(|d| Self::matches(selector, d)).cloned().collect()
            })
            .unwrap_or_default();
        if let Some(sort) = &options.sort {
            Self::sort_docs(&mut docs, sort);
        }
        let skip = options.skip.unwrap_or(0) as usize;
        if skip > 0 {
            docs.drain(..skip.min(docs.len()));
        }
        if let Some(limit) = options.limit {
            docs.truncate(limit as usize);
        }
        Ok(docs.iter().map(|d| Self::project(d, options.projection.as_ref())).collect())
    }

    async fn find_one(
        &self,
        collection: &str,
        id: &str,
    ) -> StoreResult<Option<Document>> {
        let collections = self.collections.lock().unwrap();
        Ok(collections.get(collection).and_then(|docs| docs.get(id)).cloned())
    }

    async fn insert_one(
        &self,
        collection: &str,
        doc: &Document,
    ) -> StoreResult<()> {
        let mut collections = self.collections.lock().unwrap();
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.contains_key(&doc.id) {
            return Err(StoreError::permanent(11000, format!("duplicate key: {}", doc.id)));
        }
        docs.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn update_one(
        &self,
        collection: &str,
        id: &str,
        patch: &FieldPatch,
    ) -> StoreResult<bool> {
        let mut collections = self.collections.lock().unwrap();
        match collections.get_mut(collection).and_then(|docs| docs.get_mut(id)) {
            Some(doc) => {
                apply_patch(&mut doc.fields, patch);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_one(
        &self,
        collection: &str,
        id: &str,
    ) -> StoreResult<bool> {
        let mut collections = self.collections.lock().unwrap();
        Ok(collections.get_mut(collection).map(|docs| docs.remove(id).is_some()).unwrap_or(false))
    }
}

/// A matcher that accepts exactly what [`MemoryStore`] accepts.
pub struct TrivialMatcher {
    selector: Value,
}

impl Matcher for TrivialMatcher {
    fn document_matches(
        &self,
        doc: &Document,
    ) -> MatchResult {
        MatchResult {
            result: MemoryStore::matches(&self.selector, doc),
            array_indices: None,
            distance: None,
        }
    }

    fn is_simple(&self) -> bool {
        true
    }

    fn has_geo_query(&self) -> bool {
        false
    }

    fn can_become_true_by_modifier(
        &self,
        _modifier: &Value,
    ) -> bool {
        true
    }

    fn affected_by_modifier(
        &self,
        _modifier: &Value,
    ) -> bool {
        true
    }

    fn combine_into_projection(
        &self,
        projection: &Value,
    ) -> Value {
        projection.clone()
    }
}

/// Compiles any object selector whose values are plain equalities;
/// operator selectors (keys starting with `$`) are beyond it.
pub struct TrivialMatcherFactory;

impl MatcherFactory for TrivialMatcherFactory {
    fn compile(
        &self,
        selector: &Value,
    ) -> Result<Box<dyn Matcher>, StoreError> {
        let Some(map) = selector.as_object() else {
            return Err(StoreError::permanent(2, "unsupported selector shape"));
        };
        if map.values().any(|v| {
            v.as_object().is_some_and(|inner| inner.keys().any(|k| k.starts_with('$')))
        }) {
            return Err(StoreError::permanent(2, "operator selectors unsupported"));
        }
        Ok(Box::new(TrivialMatcher {
            selector: selector.clone(),
        }))
    }
}

#[cfg(test)]
mod test_utils_test {
    use serde_json::json;

    use super::*;
    use crate::store::FindOptions;

    fn doc(
        id: &str,
        fields: serde_json::Value,
    ) -> Document {
        let mut object = fields;
        object["_id"] = json!(id);
        Document::from_object(object).unwrap()
    }

    /// Test: find honors sort, skip, limit and projection together
    #[tokio::test]
    async fn test_find_options() {
        let store = MemoryStore::new();
        for (id, qty) in [("a", 3), ("b", 1), ("c", 2)] {
            store.insert_one("fruit", &doc(id, json!({"qty": qty, "kind": "fruit"}))).await.unwrap();
        }

        let options = FindOptions {
            sort: Some(json!({"qty": 1})),
            skip: Some(1),
            limit: Some(1),
            projection: Some(json!({"kind": 0})),
            max_time_ms: None,
        };
        let docs = store.find("fruit", &json!({"kind": "fruit"}), &options).await.unwrap();

        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "c", "sorted by qty ascending, skipping b");
        assert!(!docs[0].fields.contains_key("kind"), "excluded by projection");
        assert!(docs[0].fields.contains_key("qty"));
    }

    /// Test: duplicate inserts fail with a coded (permanent) error
    #[tokio::test]
    async fn test_duplicate_insert() {
        let store = MemoryStore::new();
        store.insert_one("fruit", &doc("a", json!({}))).await.unwrap();
        let err = store.insert_one("fruit", &doc("a", json!({}))).await.unwrap_err();
        assert!(err.is_permanent());
    }

    /// Test: the trivial matcher agrees with the store and rejects
    /// operator selectors
    #[test]
    fn test_trivial_matcher() {
        let factory = TrivialMatcherFactory;
        let matcher = factory.compile(&json!({"kind": "apple"})).unwrap();
        assert!(matcher.document_matches(&doc("a", json!({"kind": "apple"}))).result);
        assert!(!matcher.document_matches(&doc("b", json!({"kind": "pear"}))).result);
        assert!(matcher.is_simple());

        assert!(
            factory.compile(&json!({"qty": {"$gt": 1}})).is_err(),
            "operator selectors are beyond the trivial matcher"
        );
    }
}
