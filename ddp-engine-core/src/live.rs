//! The live store connection: deduplicating observe registry plus write
//! helpers that fire the invalidation crossbar under the current fence.
//!
//! Read path: `observe_changes` canonicalizes the cursor description,
//! reuses or creates the multiplexer+driver pair, and attaches a handle.
//! Write path: `insert`/`update`/`remove` write through to the store,
//! then begin a write on the current fence, fire the crossbar, and
//! commit — so interested drivers capture their own fence writes while
//! the method's fence is still open.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use ddp_engine_proto::Document;
use ddp_engine_proto::FieldPatch;
use serde_json::json;
use tracing::debug;

use crate::Crossbar;
use crate::CursorDescription;
use crate::EngineConfig;
use crate::Result;
use crate::WriteFence;
use crate::observe::ObserveCallbacks;
use crate::observe::ObserveHandle;
use crate::observe::ObserveMultiplexer;
use crate::observe::PollingObserveDriver;
use crate::store::DocumentStore;
use crate::store::MatcherFactory;
use crate::store::OplogHandle;
use crate::store::SorterFactory;

pub struct LiveConnection {
    weak_self: Weak<LiveConnection>,
    store: Arc<dyn DocumentStore>,
    crossbar: Crossbar,
    config: EngineConfig,
    oplog: Option<Arc<dyn OplogHandle>>,
    matcher_factory: Option<Arc<dyn MatcherFactory>>,
    sorter_factory: Option<Arc<dyn SorterFactory>>,
    multiplexers: Mutex<HashMap<String, Arc<ObserveMultiplexer>>>,
}

impl LiveConnection {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            store,
            crossbar: Crossbar::new(),
            config,
            oplog: None,
            matcher_factory: None,
            sorter_factory: None,
            multiplexers: Mutex::new(HashMap::new()),
        })
    }

    /// Wire in the optional oplog tailer and selector/sort compilers
    /// used by driver selection.
    pub fn with_oplog(
        store: Arc<dyn DocumentStore>,
        config: EngineConfig,
        oplog: Arc<dyn OplogHandle>,
        matcher_factory: Arc<dyn MatcherFactory>,
        sorter_factory: Arc<dyn SorterFactory>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            store,
            crossbar: Crossbar::new(),
            config,
            oplog: Some(oplog),
            matcher_factory: Some(matcher_factory),
            sorter_factory: Some(sorter_factory),
            multiplexers: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn crossbar(&self) -> &Crossbar {
        &self.crossbar
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe callbacks to a query. Equivalent descriptions share one
    /// multiplexer (and one polling driver). The returned handle must be
    /// stopped by the caller; the shared driver dies with its last
    /// handle.
    pub async fn observe_changes(
        &self,
        description: CursorDescription,
        ordered: bool,
        callbacks: ObserveCallbacks,
        non_mutating_callbacks: bool,
    ) -> Result<Arc<ObserveHandle>> {
        let key = description.canonical_key(ordered);
        let multiplexer = {
            let mut multiplexers = self.multiplexers.lock().expect("registry poisoned");
            match multiplexers.get(&key) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let multiplexer = self.build_multiplexer(&key, description, ordered);
                    multiplexers.insert(key.clone(), Arc::clone(&multiplexer));
                    multiplexer
                }
            }
        };

        let handle = multiplexer.new_handle(callbacks, non_mutating_callbacks);
        multiplexer.add_handle_and_send_initial_adds(Arc::clone(&handle)).await?;
        Ok(handle)
    }

    fn build_multiplexer(
        &self,
        key: &str,
        description: CursorDescription,
        ordered: bool,
    ) -> Arc<ObserveMultiplexer> {
        if self.oplog_eligible(&description, ordered) {
            // The oplog tailing driver is not part of this engine; an
            // eligible query is served by polling all the same.
            debug!(
                collection = %description.collection,
                "[LiveConnection] oplog-eligible query served by the polling driver"
            );
        }

        let multiplexer = ObserveMultiplexer::new(ordered);
        let driver = PollingObserveDriver::new(
            description,
            ordered,
            Arc::clone(&self.store),
            Arc::clone(&multiplexer),
            &self.crossbar,
            &self.config,
        );

        let registry = self.weak_self.clone();
        let key = key.to_string();
        multiplexer.set_on_stop(move || {
            if let Some(registry) = registry.upgrade() {
                registry.multiplexers.lock().expect("registry poisoned").remove(&key);
            }
            driver.stop();
        });
        multiplexer
    }

    /// Oplog driver prerequisites: an oplog tail, an unordered query the
    /// matcher and sorter can compile, and no explicit opt-out.
    fn oplog_eligible(
        &self,
        description: &CursorDescription,
        ordered: bool,
    ) -> bool {
        let Some(_oplog) = &self.oplog else {
            return false;
        };
        if ordered || description.options.tailable || description.options.disable_oplog {
            return false;
        }
        let Some(matcher_factory) = &self.matcher_factory else {
            return false;
        };
        if matcher_factory.compile(&description.selector).is_err() {
            return false;
        }
        if let Some(sort) = &description.options.sort {
            let Some(sorter_factory) = &self.sorter_factory else {
                return false;
            };
            if sorter_factory.compile(sort).is_err() {
                return false;
            }
        }
        true
    }

    /// Insert a document, then invalidate interested observers.
    pub async fn insert(
        &self,
        collection: &str,
        doc: Document,
    ) -> Result<()> {
        self.store.insert_one(collection, &doc).await?;
        self.invalidate(collection, Some(&doc.id))
    }

    /// Patch one document by id; true when a document matched.
    pub async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: &FieldPatch,
    ) -> Result<bool> {
        let matched = self.store.update_one(collection, id, patch).await?;
        self.invalidate(collection, Some(id))?;
        Ok(matched)
    }

    /// Delete one document by id; true when a document matched.
    pub async fn remove(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<bool> {
        let matched = self.store.delete_one(collection, id).await?;
        self.invalidate(collection, Some(id))?;
        Ok(matched)
    }

    /// Fire the crossbar for a completed write. The write itself holds a
    /// fence write across the fire, so the fence cannot fire before
    /// every listener had its chance to capture its own write.
    fn invalidate(
        &self,
        collection: &str,
        id: Option<&str>,
    ) -> Result<()> {
        let own_write = match WriteFence::current() {
            Some(fence) => Some(fence.begin_write()?),
            None => None,
        };
        let mut notification = json!({ "collection": collection });
        if let Some(id) = id {
            notification["id"] = json!(id);
        }
        self.crossbar.fire(notification);
        if let Some(write) = own_write {
            write.committed();
        }
        Ok(())
    }

    /// Number of live multiplexers, for tests and diagnostics.
    pub fn multiplexer_count(&self) -> usize {
        self.multiplexers.lock().expect("registry poisoned").len()
    }
}
