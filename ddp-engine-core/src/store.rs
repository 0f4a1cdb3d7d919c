//! External collaborator seams: the document store, the selector
//! matcher and sorter, and the oplog tailer.
//!
//! The engine treats all of these as black boxes. The store speaks in
//! [`Document`]s and [`StoreError`]s (a numeric code marks a permanent
//! query error); the matcher is a predicate factory consulted only for
//! driver eligibility; the oplog is a mutation stream with a stop
//! handle.

use std::cmp::Ordering;

use async_trait::async_trait;
use ddp_engine_proto::Document;
use ddp_engine_proto::FieldPatch;
use serde_json::Value;

use crate::CursorDescription;
use crate::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Options passed through to the store's find.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Option<Value>,
    pub projection: Option<Value>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
    pub max_time_ms: Option<u64>,
}

impl FindOptions {
    pub fn from_cursor(cursor: &CursorDescription) -> Self {
        Self {
            sort: cursor.options.sort.clone(),
            projection: cursor.options.projection.clone(),
            limit: cursor.options.limit,
            skip: cursor.options.skip,
            max_time_ms: cursor.options.max_time_ms,
        }
    }
}

/// A MongoDB-compatible document store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Run a query; the result order honors `options.sort` when given.
    async fn find(
        &self,
        collection: &str,
        selector: &Value,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>>;

    async fn find_one(
        &self,
        collection: &str,
        id: &str,
    ) -> StoreResult<Option<Document>>;

    async fn insert_one(
        &self,
        collection: &str,
        doc: &Document,
    ) -> StoreResult<()>;

    /// Apply a field patch to one document; true when a document
    /// matched.
    async fn update_one(
        &self,
        collection: &str,
        id: &str,
        patch: &FieldPatch,
    ) -> StoreResult<bool>;

    async fn delete_one(
        &self,
        collection: &str,
        id: &str,
    ) -> StoreResult<bool>;
}

/// Result of matching one document against a compiled selector.
#[derive(Debug, Clone, Default)]
pub struct MatchResult {
    pub result: bool,
    pub array_indices: Option<Vec<usize>>,
    pub distance: Option<f64>,
}

/// A compiled selector predicate.
pub trait Matcher: Send + Sync {
    fn document_matches(
        &self,
        doc: &Document,
    ) -> MatchResult;
    fn is_simple(&self) -> bool;
    fn has_geo_query(&self) -> bool;
    fn can_become_true_by_modifier(
        &self,
        modifier: &Value,
    ) -> bool;
    fn affected_by_modifier(
        &self,
        modifier: &Value,
    ) -> bool;
    fn combine_into_projection(
        &self,
        projection: &Value,
    ) -> Value;
}

/// Compiles selectors; a compile failure means the selector is beyond
/// this matcher (the driver then falls back to polling).
pub trait MatcherFactory: Send + Sync {
    fn compile(
        &self,
        selector: &Value,
    ) -> Result<Box<dyn Matcher>, StoreError>;
}

/// A compiled sort specification.
pub trait Sorter: Send + Sync {
    fn compare(
        &self,
        a: &Document,
        b: &Document,
    ) -> Ordering;
}

pub trait SorterFactory: Send + Sync {
    fn compile(
        &self,
        spec: &Value,
    ) -> Result<Box<dyn Sorter>, StoreError>;
}

/// One mutation observed from the store's oplog.
#[derive(Debug, Clone)]
pub struct OplogEntry {
    pub collection: String,
    pub id: String,
    pub op: OplogOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OplogOp {
    Insert,
    Update,
    Remove,
}

/// A running oplog tail: callback-per-mutation plus a stop handle.
pub trait OplogHandle: Send + Sync {
    fn on_entry(
        &self,
        callback: Box<dyn Fn(&OplogEntry) + Send + Sync>,
    );
    fn stop(&self);
}
