//! Invalidation crossbar: pattern-matched notification bus between write
//! sites and observe drivers.
//!
//! Listeners register a trigger pattern; a notification matches when
//! every key present in the trigger exists in the notification with a
//! deep-equal value. Listeners are bucketed by the trigger's
//! `collection` key (empty string means "any collection") so a fire only
//! scans plausible candidates.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use serde_json::Value;
use tracing::trace;

type ListenerCallback = Arc<dyn Fn(&Value) + Send + Sync>;

struct Listener {
    trigger: Value,
    callback: ListenerCallback,
}

#[derive(Clone, Default)]
pub struct Crossbar {
    inner: Arc<CrossbarInner>,
}

#[derive(Default)]
struct CrossbarInner {
    next_id: AtomicU64,
    /// collection name → listener id → listener. `""` holds listeners
    /// whose trigger names no collection.
    buckets: DashMap<String, HashMap<u64, Listener>>,
}

/// Stop handle for a registered listener. Stopping is idempotent; the
/// listener is also deregistered when the handle is dropped.
pub struct ListenHandle {
    bar: Weak<CrossbarInner>,
    collection: String,
    id: u64,
    stopped: AtomicBool,
}

impl ListenHandle {
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(bar) = self.bar.upgrade() {
            if let Some(mut bucket) = bar.buckets.get_mut(&self.collection) {
                bucket.remove(&self.id);
            }
            bar.buckets.remove_if(&self.collection, |_, bucket| bucket.is_empty());
        }
    }
}

impl Drop for ListenHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn collection_of(message: &Value) -> String {
    message
        .get("collection")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

/// Subset match: every trigger key must exist in the notification with a
/// deep-equal value. A string-vs-string `id` comparison is checked first
/// since it decides most real fires.
fn matches(
    trigger: &Value,
    notification: &Value,
) -> bool {
    let Some(trigger_map) = trigger.as_object() else {
        return true;
    };
    if let (Some(Value::String(want)), Some(Value::String(got))) =
        (trigger_map.get("id"), notification.get("id"))
    {
        if want != got {
            return false;
        }
    }
    trigger_map.iter().all(|(key, want)| notification.get(key) == Some(want))
}

impl Crossbar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for notifications matching `trigger`.
    ///
    /// The callback runs synchronously inside [`Crossbar::fire`], on the
    /// firing task; it may capture the current write fence but must not
    /// block.
    pub fn listen<F>(
        &self,
        trigger: Value,
        callback: F,
    ) -> ListenHandle
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let collection = collection_of(&trigger);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.buckets.entry(collection.clone()).or_default().insert(
            id,
            Listener {
                trigger,
                callback: Arc::new(callback),
            },
        );
        ListenHandle {
            bar: Arc::downgrade(&self.inner),
            collection,
            id,
            stopped: AtomicBool::new(false),
        }
    }

    /// Deliver a notification to every matching listener.
    ///
    /// Matching callbacks are snapshotted before dispatch, so listeners
    /// may listen or stop on this same crossbar from inside a callback.
    /// The fire loop does not wait for any work a listener schedules.
    pub fn fire(
        &self,
        notification: Value,
    ) {
        let collection = collection_of(&notification);
        let callbacks: Vec<ListenerCallback> = {
            let mut matched = Vec::new();
            let mut scan = |bucket_key: &str| {
                if let Some(bucket) = self.inner.buckets.get(bucket_key) {
                    for listener in bucket.values() {
                        if matches(&listener.trigger, &notification) {
                            matched.push(Arc::clone(&listener.callback));
                        }
                    }
                }
            };
            scan(&collection);
            if !collection.is_empty() {
                scan("");
            }
            matched
        };
        trace!(
            collection = %collection,
            listeners = callbacks.len(),
            "[Crossbar] fire"
        );
        for callback in callbacks {
            callback(&notification);
        }
    }

    /// Number of registered listeners, for tests and diagnostics.
    pub fn listener_count(&self) -> usize {
        self.inner.buckets.iter().map(|bucket| bucket.len()).sum()
    }
}
