//! Observe multiplexer: one driver feeding N observe handles with a
//! consistent view.
//!
//! All cache mutations and fan-outs run on the multiplexer's task queue,
//! so driver callbacks are serialized (single-writer). A readiness
//! barrier separates the initial query fill from live operation: before
//! ready, only adds may arrive; `query_error` may only arrive before
//! ready and tears the whole multiplexer down.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use ddp_engine_proto::Document;
use ddp_engine_proto::FieldPatch;
use ddp_engine_proto::Fields;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::trace;

use crate::Error;
use crate::ObserveError;
use crate::Result;
use crate::TaskQueue;
use crate::observe::CachingChangeObserver;
use crate::observe::ObserveEvent;

/// Callbacks a subscriber attaches to an observe handle. All optional;
/// payloads arrive as shared field bags (see
/// [`ObserveHandle::non_mutating`] for the clone policy).
#[derive(Default)]
pub struct ObserveCallbacks {
    pub added: Option<Box<dyn Fn(&str, Arc<Fields>) + Send + Sync>>,
    pub added_before: Option<Box<dyn Fn(&str, Arc<Fields>, Option<&str>) + Send + Sync>>,
    pub changed: Option<Box<dyn Fn(&str, Arc<FieldPatch>) + Send + Sync>>,
    pub moved_before: Option<Box<dyn Fn(&str, Option<&str>) + Send + Sync>>,
    pub removed: Option<Box<dyn Fn(&str) + Send + Sync>>,
    /// Batch delivery of the current cache at attach time. Handles
    /// without this callback get per-document adds instead.
    pub initial_adds: Option<Box<dyn Fn(&[Document]) + Send + Sync>>,
}

/// One subscriber's attachment to a multiplexer.
pub struct ObserveHandle {
    id: u64,
    multiplexer: Weak<ObserveMultiplexer>,
    callbacks: ObserveCallbacks,
    /// When set, all handles may receive the same shared payload; when
    /// clear, this handle gets its own deep copy so subscriber code
    /// cannot corrupt the cache or its peers.
    non_mutating: bool,
    stopped: AtomicBool,
}

impl ObserveHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Detach from the multiplexer. Synchronous and idempotent; no
    /// further callbacks will be delivered once this returns.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mux) = self.multiplexer.upgrade() {
            mux.remove_handle(self.id);
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for ObserveHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
enum ReadyState {
    Pending,
    Ready,
    Failed(Arc<Error>),
}

type StopCallback = Box<dyn FnOnce() + Send>;

pub struct ObserveMultiplexer {
    ordered: bool,
    queue: TaskQueue,
    state: Mutex<MuxState>,
    ready_tx: watch::Sender<ReadyState>,
    on_stop: Mutex<Option<StopCallback>>,
    weak_self: Weak<ObserveMultiplexer>,
}

struct MuxState {
    cache: CachingChangeObserver,
    handles: HashMap<u64, Arc<ObserveHandle>>,
    /// Handles attached before readiness: they receive nothing until the
    /// barrier, then the whole cache as their initial adds.
    parked: HashSet<u64>,
    next_handle_id: u64,
    ready: bool,
    stopped: bool,
    /// Handles whose initial-add task has not yet drained; the
    /// multiplexer must not stop out from under them.
    pending_add_tasks: usize,
}

impl ObserveMultiplexer {
    pub fn new(ordered: bool) -> Arc<Self> {
        let (ready_tx, _) = watch::channel(ReadyState::Pending);
        Arc::new_cyclic(|weak| Self {
            ordered,
            queue: TaskQueue::new(),
            state: Mutex::new(MuxState {
                cache: CachingChangeObserver::new(ordered),
                handles: HashMap::new(),
                parked: HashSet::new(),
                next_handle_id: 0,
                ready: false,
                stopped: false,
                pending_add_tasks: 0,
            }),
            ready_tx,
            on_stop: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    /// Install the teardown callback invoked exactly once when the last
    /// handle detaches (or on `query_error`).
    pub fn set_on_stop<F>(
        &self,
        callback: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        *self.on_stop.lock().expect("multiplexer poisoned") = Some(Box::new(callback));
    }

    pub fn ordered(&self) -> bool {
        self.ordered
    }

    /// The serialization queue; the polling driver runs its poll cycles
    /// here so they interleave correctly with fan-out.
    pub fn task_queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Create a handle bound to this multiplexer. The handle is inert
    /// until passed to [`ObserveMultiplexer::add_handle_and_send_initial_adds`].
    pub fn new_handle(
        &self,
        callbacks: ObserveCallbacks,
        non_mutating: bool,
    ) -> Arc<ObserveHandle> {
        let id = {
            let mut state = self.state.lock().expect("multiplexer poisoned");
            let id = state.next_handle_id;
            state.next_handle_id += 1;
            id
        };
        Arc::new(ObserveHandle {
            id,
            multiplexer: self.weak_self.clone(),
            callbacks,
            non_mutating,
            stopped: AtomicBool::new(false),
        })
    }

    /// Attach a handle: a queued task registers it and delivers the
    /// current cache contents, then the returned future waits on the
    /// readiness barrier. Rejects with the query error if the driver
    /// failed permanently.
    pub async fn add_handle_and_send_initial_adds(
        &self,
        handle: Arc<ObserveHandle>,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().expect("multiplexer poisoned");
            if state.stopped {
                return Err(ObserveError::Stopped.into());
            }
            state.pending_add_tasks += 1;
        }
        let mux = self.weak_self.clone();
        let task_handle = Arc::clone(&handle);
        self.queue
            .run_task(async move {
                if let Some(mux) = mux.upgrade() {
                    mux.register_and_send_adds(task_handle);
                }
                Ok(())
            })
            .await?;

        let mut ready_rx = self.ready_tx.subscribe();
        loop {
            let current = ready_rx.borrow_and_update().clone();
            match current {
                ReadyState::Ready => return Ok(()),
                ReadyState::Failed(err) => {
                    return Err(Error::Fatal(format!("observe query failed: {err}")));
                }
                ReadyState::Pending => {
                    if ready_rx.changed().await.is_err() {
                        return Err(ObserveError::Stopped.into());
                    }
                }
            }
        }
    }

    fn register_and_send_adds(
        &self,
        handle: Arc<ObserveHandle>,
    ) {
        let mut stop_now = false;
        let docs = {
            let mut state = self.state.lock().expect("multiplexer poisoned");
            state.pending_add_tasks -= 1;
            if state.stopped {
                return;
            }
            if handle.is_stopped() {
                // The handle died before its attach task ran; it may
                // have been the only reason this multiplexer existed.
                stop_now = state.handles.is_empty() && state.pending_add_tasks == 0;
                if stop_now {
                    state.stopped = true;
                }
                None
            } else {
                state.handles.insert(handle.id, Arc::clone(&handle));
                if !state.ready {
                    // Initial adds arrive at the readiness barrier, with
                    // the then-complete cache.
                    state.parked.insert(handle.id);
                    None
                } else {
                    Some(state.cache.docs())
                }
            }
        };
        if stop_now {
            self.run_on_stop();
            return;
        }
        if let Some(docs) = docs {
            self.send_adds(&handle, &docs);
        }
    }

    fn send_adds(
        &self,
        handle: &Arc<ObserveHandle>,
        docs: &[Document],
    ) {
        trace!(handle = handle.id, docs = docs.len(), "[Multiplexer] initial adds");
        if let Some(initial_adds) = &handle.callbacks.initial_adds {
            initial_adds(docs);
            return;
        }
        for doc in docs {
            let fields = Arc::new(doc.fields.clone());
            if self.ordered {
                if let Some(added_before) = &handle.callbacks.added_before {
                    // Cache replay in order: each doc lands at the end of
                    // what this handle has seen so far.
                    added_before(&doc.id, fields, None);
                }
            } else if let Some(added) = &handle.callbacks.added {
                added(&doc.id, fields);
            }
        }
    }

    /// Detach a handle. When the last handle goes and no attach tasks
    /// are pending, the teardown callback runs (exactly once).
    pub(crate) fn remove_handle(
        &self,
        id: u64,
    ) {
        let stop = {
            let mut state = self.state.lock().expect("multiplexer poisoned");
            state.handles.remove(&id);
            state.parked.remove(&id);
            if state.handles.is_empty() && state.pending_add_tasks == 0 && !state.stopped {
                state.stopped = true;
                true
            } else {
                false
            }
        };
        if stop {
            debug!("[Multiplexer] last handle removed; stopping");
            self.run_on_stop();
        }
    }

    fn run_on_stop(&self) {
        let callback = self.on_stop.lock().expect("multiplexer poisoned").take();
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn added(
        &self,
        id: String,
        fields: Fields,
    ) {
        self.enqueue_event(ObserveEvent::Added {
            id,
            fields,
        });
    }

    pub fn added_before(
        &self,
        id: String,
        fields: Fields,
        before: Option<String>,
    ) {
        self.enqueue_event(ObserveEvent::AddedBefore {
            id,
            fields,
            before,
        });
    }

    pub fn changed(
        &self,
        id: String,
        patch: FieldPatch,
    ) {
        self.enqueue_event(ObserveEvent::Changed {
            id,
            patch,
        });
    }

    pub fn moved_before(
        &self,
        id: String,
        before: Option<String>,
    ) {
        self.enqueue_event(ObserveEvent::MovedBefore {
            id,
            before,
        });
    }

    pub fn removed(
        &self,
        id: String,
    ) {
        self.enqueue_event(ObserveEvent::Removed {
            id,
        });
    }

    pub fn initial_adds(
        &self,
        docs: Vec<Document>,
    ) {
        self.enqueue_event(ObserveEvent::InitialAdds {
            docs,
        });
    }

    fn enqueue_event(
        &self,
        event: ObserveEvent,
    ) {
        let mux = self.weak_self.clone();
        self.queue.queue_task(async move {
            let Some(mux) = mux.upgrade() else {
                return;
            };
            if let Err(err) = mux.apply_event(event) {
                error!("[Multiplexer] driver bug: {err}");
            }
        });
    }

    /// Apply an event to the cache, then fan it out. Returns the
    /// contract violation when the driver misbehaves (non-add before
    /// ready, unknown document, wrong mode).
    pub(crate) fn apply_event(
        &self,
        event: ObserveEvent,
    ) -> Result<()> {
        let handles: Vec<Arc<ObserveHandle>> = {
            let mut state = self.state.lock().expect("multiplexer poisoned");
            if state.stopped {
                return Ok(());
            }
            if !state.ready && !event.is_add() {
                return Err(ObserveError::NotReady {
                    kind: event.kind(),
                }
                .into());
            }
            state.cache.apply(&event)?;
            // Parked handles get the cache at the barrier instead.
            state
                .handles
                .values()
                .filter(|h| !state.parked.contains(&h.id))
                .cloned()
                .collect()
        };
        self.fan_out(&handles, &event);
        Ok(())
    }

    fn fan_out(
        &self,
        handles: &[Arc<ObserveHandle>],
        event: &ObserveEvent,
    ) {
        // Shared payloads are built once; handles that may mutate their
        // arguments get a fresh deep copy instead.
        let shared_fields: Option<Arc<Fields>> = match event {
            ObserveEvent::Added { fields, .. } | ObserveEvent::AddedBefore { fields, .. } => {
                Some(Arc::new(fields.clone()))
            }
            _ => None,
        };
        let shared_patch: Option<Arc<FieldPatch>> = match event {
            ObserveEvent::Changed { patch, .. } => Some(Arc::new(patch.clone())),
            _ => None,
        };

        for handle in handles {
            if handle.is_stopped() {
                continue;
            }
            let fields_for = |shared: &Option<Arc<Fields>>| {
                let shared = shared.as_ref().expect("fields payload present");
                if handle.non_mutating {
                    Arc::clone(shared)
                } else {
                    Arc::new(shared.as_ref().clone())
                }
            };
            match event {
                ObserveEvent::Added { id, .. } => {
                    if let Some(added) = &handle.callbacks.added {
                        added(id, fields_for(&shared_fields));
                    }
                }
                ObserveEvent::AddedBefore { id, before, .. } => {
                    if let Some(added_before) = &handle.callbacks.added_before {
                        added_before(id, fields_for(&shared_fields), before.as_deref());
                    } else if let Some(added) = &handle.callbacks.added {
                        added(id, fields_for(&shared_fields));
                    }
                }
                ObserveEvent::Changed { id, .. } => {
                    if let Some(changed) = &handle.callbacks.changed {
                        let shared = shared_patch.as_ref().expect("patch payload present");
                        let payload = if handle.non_mutating {
                            Arc::clone(shared)
                        } else {
                            Arc::new(shared.as_ref().clone())
                        };
                        changed(id, payload);
                    }
                }
                ObserveEvent::MovedBefore { id, before } => {
                    if let Some(moved_before) = &handle.callbacks.moved_before {
                        moved_before(id, before.as_deref());
                    }
                }
                ObserveEvent::Removed { id } => {
                    if let Some(removed) = &handle.callbacks.removed {
                        removed(id);
                    }
                }
                ObserveEvent::InitialAdds { .. } => {
                    // A cache replacement is not an incremental event;
                    // only drivers that own the full result set use it,
                    // and they do so before any handle attaches.
                }
            }
        }
    }

    /// Queued readiness barrier: resolves every pending attach. Calling
    /// it twice is a driver bug, detected in the queue.
    pub fn ready(&self) {
        let mux = self.weak_self.clone();
        self.queue.queue_task(async move {
            let Some(mux) = mux.upgrade() else {
                return;
            };
            if let Err(err) = mux.apply_ready() {
                error!("[Multiplexer] driver bug: {err}");
            }
        });
    }

    pub(crate) fn apply_ready(&self) -> Result<()> {
        let (waiting, docs) = {
            let mut state = self.state.lock().expect("multiplexer poisoned");
            if state.ready {
                return Err(ObserveError::AlreadyReady.into());
            }
            state.ready = true;
            let parked = std::mem::take(&mut state.parked);
            let waiting: Vec<Arc<ObserveHandle>> = parked
                .into_iter()
                .filter_map(|id| state.handles.get(&id).cloned())
                .collect();
            (waiting, state.cache.docs())
        };
        for handle in &waiting {
            if !handle.is_stopped() {
                self.send_adds(handle, &docs);
            }
        }
        let _ = self.ready_tx.send(ReadyState::Ready);
        Ok(())
    }

    /// Queued permanent-failure signal: stops the multiplexer and
    /// rejects every pending attach. Only legal before ready.
    pub fn query_error(
        &self,
        error: Error,
    ) {
        let mux = self.weak_self.clone();
        self.queue.queue_task(async move {
            let Some(mux) = mux.upgrade() else {
                return;
            };
            if let Err(err) = mux.apply_query_error(error) {
                error!("[Multiplexer] driver bug: {err}");
            }
        });
    }

    pub(crate) fn apply_query_error(
        &self,
        error: Error,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().expect("multiplexer poisoned");
            if state.ready {
                return Err(ObserveError::QueryErrorAfterReady.into());
            }
            if state.stopped {
                return Ok(());
            }
            state.stopped = true;
            state.handles.clear();
            state.parked.clear();
        }
        let _ = self.ready_tx.send(ReadyState::Failed(Arc::new(error)));
        self.run_on_stop();
        Ok(())
    }

    /// Run `callback` after everything already enqueued has been
    /// delivered to every handle.
    pub fn on_flush<F>(
        &self,
        callback: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        self.queue.queue_task(async move {
            callback();
        });
    }

    /// True once the readiness barrier has passed.
    pub fn is_ready(&self) -> bool {
        self.state.lock().expect("multiplexer poisoned").ready
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().expect("multiplexer poisoned").stopped
    }

    /// Number of attached handles, for tests and diagnostics.
    pub fn handle_count(&self) -> usize {
        self.state.lock().expect("multiplexer poisoned").handles.len()
    }
}
