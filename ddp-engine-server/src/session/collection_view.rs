//! The merge-box: per-session, per-collection materialized view of the
//! documents a client is subscribed to.
//!
//! Each field keeps an ordered precedence list of (subscription handle,
//! value); the head is what the client sees. Every operation batches its
//! per-field decisions into one collector and emits a single
//! added/changed/removed to the session's send path.

use std::collections::HashMap;
use std::collections::HashSet;

use ddp_engine_proto::FieldPatch;
use ddp_engine_proto::Fields;
use serde_json::Value;

use crate::session::ViewCallbacks;

#[derive(Debug, Clone)]
struct PrecedenceEntry {
    subscription_handle: String,
    value: Value,
}

/// One document as assembled from every subscription that reports it.
#[derive(Debug, Clone, Default)]
pub struct SessionDocumentView {
    exists_in: HashSet<String>,
    data_by_key: HashMap<String, Vec<PrecedenceEntry>>,
}

impl SessionDocumentView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.exists_in.is_empty()
    }

    /// The client-visible field image: the head of every precedence
    /// list.
    pub fn effective_fields(&self) -> Fields {
        self.data_by_key
            .iter()
            .filter_map(|(key, list)| list.first().map(|e| (key.clone(), e.value.clone())))
            .collect()
    }

    /// Record a field value contributed by one subscription.
    ///
    /// The collector receives the key only when the client-visible value
    /// actually changes. Values are cloned on insertion so callers
    /// cannot alias into the view.
    pub fn change_field(
        &mut self,
        subscription_handle: &str,
        key: &str,
        value: &Value,
        collector: &mut FieldPatch,
        is_add: bool,
    ) {
        if key == "_id" {
            return;
        }
        let Some(list) = self.data_by_key.get_mut(key) else {
            self.data_by_key.insert(
                key.to_string(),
                vec![PrecedenceEntry {
                    subscription_handle: subscription_handle.to_string(),
                    value: value.clone(),
                }],
            );
            collector.insert(key.to_string(), Some(value.clone()));
            return;
        };

        // A freshly added subscription cannot already hold an entry.
        let position = if is_add {
            None
        } else {
            list.iter().position(|e| e.subscription_handle == subscription_handle)
        };
        match position {
            Some(index) => {
                if index == 0 && list[0].value != *value {
                    collector.insert(key.to_string(), Some(value.clone()));
                }
                list[index].value = value.clone();
            }
            None => {
                list.push(PrecedenceEntry {
                    subscription_handle: subscription_handle.to_string(),
                    value: value.clone(),
                });
            }
        }
    }

    /// Drop one subscription's contribution to a field.
    pub fn clear_field(
        &mut self,
        subscription_handle: &str,
        key: &str,
        collector: &mut FieldPatch,
    ) {
        if key == "_id" {
            return;
        }
        let Some(list) = self.data_by_key.get_mut(key) else {
            return;
        };
        let Some(position) = list.iter().position(|e| e.subscription_handle == subscription_handle)
        else {
            return;
        };
        let removed_head_value = (position == 0).then(|| list[0].value.clone());
        list.remove(position);

        if list.is_empty() {
            self.data_by_key.remove(key);
            collector.insert(key.to_string(), None);
        } else if let Some(old_value) = removed_head_value {
            let new_head = &list[0].value;
            if *new_head != old_value {
                collector.insert(key.to_string(), Some(new_head.clone()));
            }
        }
    }

    fn add_subscription(
        &mut self,
        subscription_handle: &str,
    ) -> bool {
        self.exists_in.insert(subscription_handle.to_string())
    }

    fn remove_subscription(
        &mut self,
        subscription_handle: &str,
    ) {
        self.exists_in.remove(subscription_handle);
    }
}

/// All merged documents of one collection within one session.
pub struct SessionCollectionView {
    collection: String,
    documents: HashMap<String, SessionDocumentView>,
    callbacks: std::sync::Arc<dyn ViewCallbacks>,
}

impl SessionCollectionView {
    pub fn new(
        collection: impl Into<String>,
        callbacks: std::sync::Arc<dyn ViewCallbacks>,
    ) -> Self {
        Self {
            collection: collection.into(),
            documents: HashMap::new(),
            callbacks,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Snapshot of every document's client-visible field image.
    pub fn snapshot(&self) -> HashMap<String, Fields> {
        self.documents.iter().map(|(id, view)| (id.clone(), view.effective_fields())).collect()
    }

    pub fn added(
        &mut self,
        subscription_handle: &str,
        id: &str,
        fields: &Fields,
    ) {
        let added = !self.documents.contains_key(id);
        let doc_view = self.documents.entry(id.to_string()).or_default();
        doc_view.add_subscription(subscription_handle);

        let mut collector = FieldPatch::new();
        for (key, value) in fields {
            doc_view.change_field(subscription_handle, key, value, &mut collector, true);
        }

        if added {
            let image: Fields =
                collector.into_iter().filter_map(|(k, v)| v.map(|v| (k, v))).collect();
            self.callbacks.view_added(&self.collection, id, image);
        } else {
            self.callbacks.view_changed(&self.collection, id, collector);
        }
    }

    pub fn changed(
        &mut self,
        subscription_handle: &str,
        id: &str,
        patch: &FieldPatch,
    ) -> Result<(), UnknownDocument> {
        let doc_view = self.documents.get_mut(id).ok_or_else(|| UnknownDocument {
            id: id.to_string(),
        })?;
        let mut collector = FieldPatch::new();
        for (key, change) in patch {
            match change {
                Some(value) => {
                    doc_view.change_field(subscription_handle, key, value, &mut collector, false);
                }
                None => doc_view.clear_field(subscription_handle, key, &mut collector),
            }
        }
        self.callbacks.view_changed(&self.collection, id, collector);
        Ok(())
    }

    pub fn removed(
        &mut self,
        subscription_handle: &str,
        id: &str,
    ) -> Result<(), UnknownDocument> {
        let doc_view = self.documents.get_mut(id).ok_or_else(|| UnknownDocument {
            id: id.to_string(),
        })?;
        doc_view.remove_subscription(subscription_handle);

        if doc_view.is_empty() {
            self.documents.remove(id);
            self.callbacks.view_removed(&self.collection, id);
        } else {
            let mut collector = FieldPatch::new();
            let keys: Vec<String> = doc_view.data_by_key.keys().cloned().collect();
            for key in keys {
                doc_view.clear_field(subscription_handle, &key, &mut collector);
            }
            self.callbacks.view_changed(&self.collection, id, collector);
        }
        Ok(())
    }
}

/// `removed` of a document the view does not hold: the driver above us
/// broke its contract.
#[derive(Debug, thiserror::Error)]
#[error("collection view has no document '{id}'")]
pub struct UnknownDocument {
    pub id: String,
}
