//! Polling observe driver: re-runs its query on every invalidation
//! signal (throttled) and on a forced interval, diffs against the
//! previous results, and feeds the multiplexer.
//!
//! Write-fence integration: every invalidation received while a fence is
//! current captures a write on that fence; the captures commit only
//! after the poll cycle that absorbed them has flushed through the
//! multiplexer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use ddp_engine_proto::Document;
use ddp_engine_proto::FieldPatch;
use serde_json::json;
use tokio::sync::watch;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::Crossbar;
use crate::CursorDescription;
use crate::FenceWrite;
use crate::ListenHandle;
use crate::PollingConfig;
use crate::WriteFence;
use crate::config::EngineConfig;
use crate::diff::OrderedDiffObserver;
use crate::diff::UnorderedDiffObserver;
use crate::diff::diff_ordered;
use crate::diff::diff_unordered;
use crate::observe::ObserveMultiplexer;
use crate::observe::Throttle;
use crate::store::DocumentStore;
use crate::store::FindOptions;

enum PreviousResults {
    Ordered(Vec<Document>),
    Unordered(HashMap<String, Document>),
}

struct DriverState {
    previous: PreviousResults,
    /// Fence writes captured from invalidations since the last
    /// successful poll.
    pending_writes: Vec<FenceWrite>,
    /// 0, 1 or 2: polls scheduled on the queue but not yet started.
    polls_scheduled: u8,
    polled_once: bool,
    stopped: bool,
}

pub struct PollingObserveDriver {
    cursor: CursorDescription,
    ordered: bool,
    store: Arc<dyn DocumentStore>,
    multiplexer: Arc<ObserveMultiplexer>,
    state: Mutex<DriverState>,
    throttle: Throttle,
    shutdown_tx: watch::Sender<bool>,
    crossbar_handle: ListenHandle,
    weak_self: std::sync::Weak<PollingObserveDriver>,
}

impl PollingObserveDriver {
    /// Wire up a driver: crossbar listener, forced-interval timer, and
    /// the unthrottled first poll.
    pub fn new(
        cursor: CursorDescription,
        ordered: bool,
        store: Arc<dyn DocumentStore>,
        multiplexer: Arc<ObserveMultiplexer>,
        crossbar: &Crossbar,
        config: &EngineConfig,
    ) -> Arc<Self> {
        let polling = effective_polling(&cursor, &config.polling);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = Arc::new_cyclic(|weak: &std::sync::Weak<PollingObserveDriver>| {
            let throttle_driver = weak.clone();
            let throttle = Throttle::new(polling.throttle_ms, move || {
                if let Some(driver) = throttle_driver.upgrade() {
                    driver.schedule_poll();
                }
            });

            let listener_driver = weak.clone();
            let crossbar_handle = crossbar.listen(
                json!({ "collection": cursor.collection.clone() }),
                move |notification| {
                    if let Some(driver) = listener_driver.upgrade() {
                        driver.invalidated(notification);
                    }
                },
            );

            PollingObserveDriver {
                cursor,
                ordered,
                store,
                multiplexer,
                state: Mutex::new(DriverState {
                    previous: if ordered {
                        PreviousResults::Ordered(Vec::new())
                    } else {
                        PreviousResults::Unordered(HashMap::new())
                    },
                    pending_writes: Vec::new(),
                    polls_scheduled: 0,
                    polled_once: false,
                    stopped: false,
                }),
                throttle,
                shutdown_tx,
                crossbar_handle,
                weak_self: weak.clone(),
            }
        });

        driver.spawn_interval_timer(polling.interval_ms, shutdown_rx);
        driver.schedule_poll();
        driver
    }

    /// Crossbar callback. Runs synchronously at the write site, where
    /// the current fence (if any) is still in scope.
    fn invalidated(
        &self,
        _notification: &serde_json::Value,
    ) {
        let mut state = self.state.lock().expect("driver poisoned");
        if state.stopped {
            return;
        }
        if let Some(fence) = WriteFence::current() {
            match fence.begin_write() {
                Ok(write) => state.pending_writes.push(write),
                Err(err) => warn!("[PollingDriver] fence rejected a write capture: {err}"),
            }
        }
        let quiet = state.polls_scheduled == 0;
        drop(state);
        if quiet {
            self.throttle.call();
        }
    }

    /// Put one poll cycle on the multiplexer's queue, unless one is
    /// already waiting to start.
    fn schedule_poll(&self) {
        {
            let mut state = self.state.lock().expect("driver poisoned");
            if state.stopped || state.polls_scheduled > 0 {
                return;
            }
            state.polls_scheduled += 1;
        }
        let driver = self.weak_self.clone();
        self.multiplexer.task_queue().queue_task(async move {
            if let Some(driver) = driver.upgrade() {
                driver.poll_cycle().await;
            }
        });
    }

    async fn poll_cycle(&self) {
        let writes_for_cycle = {
            let mut state = self.state.lock().expect("driver poisoned");
            state.polls_scheduled = state.polls_scheduled.saturating_sub(1);
            if state.stopped {
                return;
            }
            std::mem::take(&mut state.pending_writes)
        };

        let options = FindOptions::from_cursor(&self.cursor);
        let result = self
            .store
            .find(&self.cursor.collection, &self.cursor.selector, &options)
            .await;

        let new_docs = match result {
            Ok(docs) => docs,
            Err(err) => {
                let first = !self.state.lock().expect("driver poisoned").polled_once;
                if first && err.is_permanent() {
                    debug!(
                        collection = %self.cursor.collection,
                        "[PollingDriver] permanent query error on first poll: {err}"
                    );
                    self.multiplexer.query_error(err.into());
                    return;
                }
                warn!(
                    collection = %self.cursor.collection,
                    "[PollingDriver] transient poll failure, will retry: {err}"
                );
                let mut state = self.state.lock().expect("driver poisoned");
                if state.stopped {
                    commit_all(writes_for_cycle);
                    return;
                }
                // Restore in capture order so the retrying cycle still
                // covers every invalidation seen so far.
                let later = std::mem::take(&mut state.pending_writes);
                state.pending_writes = writes_for_cycle;
                state.pending_writes.extend(later);
                return;
            }
        };

        let first_poll = {
            let mut state = self.state.lock().expect("driver poisoned");
            if state.stopped {
                commit_all(writes_for_cycle);
                return;
            }
            let first_poll = !state.polled_once;
            state.polled_once = true;

            match (&mut state.previous, self.ordered) {
                (PreviousResults::Ordered(previous), true) => {
                    let mut emitter = OrderedEmitter {
                        multiplexer: &self.multiplexer,
                    };
                    diff_ordered(previous, &new_docs, &mut emitter);
                    *previous = new_docs;
                }
                (PreviousResults::Unordered(previous), false) => {
                    let new_map: HashMap<String, Document> =
                        new_docs.into_iter().map(|d| (d.id.clone(), d)).collect();
                    let mut emitter = UnorderedEmitter {
                        multiplexer: &self.multiplexer,
                    };
                    diff_unordered(previous, &new_map, &mut emitter);
                    *previous = new_map;
                }
                _ => unreachable!("driver mode fixed at construction"),
            }
            first_poll
        };

        if first_poll {
            self.multiplexer.ready();
        }

        // Fence writes commit only once every event from this cycle has
        // reached every handle.
        if !writes_for_cycle.is_empty() {
            trace!(
                writes = writes_for_cycle.len(),
                "[PollingDriver] scheduling fence commits behind flush"
            );
            self.multiplexer.on_flush(move || {
                commit_all(writes_for_cycle);
            });
        }
    }

    fn spawn_interval_timer(
        &self,
        interval_ms: u64,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let driver = self.weak_self.clone();
        let interval = std::time::Duration::from_millis(interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                match driver.upgrade() {
                    Some(driver) => driver.throttle.call(),
                    None => return,
                }
            }
        });
    }

    /// Stop polling: cancel the timer, throttle and crossbar listener,
    /// and commit every captured write so no fence waits forever.
    pub fn stop(&self) {
        let pending = {
            let mut state = self.state.lock().expect("driver poisoned");
            if state.stopped {
                return;
            }
            state.stopped = true;
            std::mem::take(&mut state.pending_writes)
        };
        let _ = self.shutdown_tx.send(true);
        self.throttle.cancel();
        self.crossbar_handle.stop();
        commit_all(pending);
        debug!(collection = %self.cursor.collection, "[PollingDriver] stopped");
    }
}

fn commit_all(writes: Vec<FenceWrite>) {
    for write in writes {
        write.committed();
    }
}

/// Per-cursor polling overrides on top of the engine defaults.
fn effective_polling(
    cursor: &CursorDescription,
    defaults: &PollingConfig,
) -> PollingConfig {
    PollingConfig {
        throttle_ms: cursor.options.polling_throttle_ms.unwrap_or(defaults.throttle_ms),
        interval_ms: cursor.options.polling_interval_ms.unwrap_or(defaults.interval_ms),
    }
}

struct OrderedEmitter<'a> {
    multiplexer: &'a Arc<ObserveMultiplexer>,
}

impl OrderedDiffObserver for OrderedEmitter<'_> {
    fn added_before(
        &mut self,
        doc: &Document,
        before: Option<&str>,
    ) {
        self.multiplexer.added_before(
            doc.id.clone(),
            doc.fields.clone(),
            before.map(str::to_string),
        );
    }

    fn moved_before(
        &mut self,
        id: &str,
        before: Option<&str>,
    ) {
        self.multiplexer.moved_before(id.to_string(), before.map(str::to_string));
    }

    fn removed(
        &mut self,
        id: &str,
    ) {
        self.multiplexer.removed(id.to_string());
    }

    fn changed(
        &mut self,
        id: &str,
        patch: &FieldPatch,
    ) {
        self.multiplexer.changed(id.to_string(), patch.clone());
    }
}

struct UnorderedEmitter<'a> {
    multiplexer: &'a Arc<ObserveMultiplexer>,
}

impl UnorderedDiffObserver for UnorderedEmitter<'_> {
    fn added(
        &mut self,
        doc: &Document,
    ) {
        self.multiplexer.added(doc.id.clone(), doc.fields.clone());
    }

    fn removed(
        &mut self,
        id: &str,
    ) {
        self.multiplexer.removed(id.to_string());
    }

    fn changed(
        &mut self,
        id: &str,
        patch: &FieldPatch,
    ) {
        self.multiplexer.changed(id.to_string(), patch.clone());
    }
}
