//! Unit tests for the observe multiplexer.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use serde_json::json;

use super::ObserveEvent;
use super::multiplexer::ObserveCallbacks;
use super::multiplexer::ObserveMultiplexer;
use crate::Error;
use crate::ObserveError;
use ddp_engine_proto::Document;

type EventLog = Arc<Mutex<Vec<String>>>;

fn logging_callbacks(log: EventLog) -> ObserveCallbacks {
    let added_log = Arc::clone(&log);
    let changed_log = Arc::clone(&log);
    let removed_log = Arc::clone(&log);
    ObserveCallbacks {
        added: Some(Box::new(move |id, fields| {
            added_log.lock().unwrap().push(format!("added:{id}:{}", fields.len()));
        })),
        changed: Some(Box::new(move |id, patch| {
            changed_log.lock().unwrap().push(format!("changed:{id}:{}", patch.len()));
        })),
        removed: Some(Box::new(move |id| {
            removed_log.lock().unwrap().push(format!("removed:{id}"));
        })),
        ..Default::default()
    }
}

fn fields(value: serde_json::Value) -> ddp_engine_proto::Fields {
    serde_json::from_value(value).unwrap()
}

/// Test: events apply to the cache before fanning out, in order
#[tokio::test]
async fn test_event_flow_and_order() {
    let mux = ObserveMultiplexer::new(false);
    let log: EventLog = Default::default();
    let handle = mux.new_handle(logging_callbacks(Arc::clone(&log)), true);
    let attach = {
        let mux = Arc::clone(&mux);
        let handle = Arc::clone(&handle);
        tokio::spawn(async move { mux.add_handle_and_send_initial_adds(handle).await })
    };

    mux.added("a".to_string(), fields(json!({"v": 1})));
    mux.ready();
    attach.await.unwrap().unwrap();

    let mut patch = ddp_engine_proto::FieldPatch::new();
    patch.insert("v".to_string(), Some(json!(2)));
    mux.changed("a".to_string(), patch);
    mux.removed("a".to_string());
    mux.task_queue().drain().await;

    assert_eq!(
        *log.lock().unwrap(),
        vec!["added:a:1", "changed:a:1", "removed:a"],
        "handle sees adds, then changes, then removes, in order"
    );
    assert!(mux.is_ready());
}

/// Test: a handle attached after ready receives the cache as initial adds
#[tokio::test]
async fn test_late_handle_gets_initial_adds() {
    let mux = ObserveMultiplexer::new(false);
    let first = mux.new_handle(ObserveCallbacks::default(), true);
    let attach = {
        let mux = Arc::clone(&mux);
        let first = Arc::clone(&first);
        tokio::spawn(async move { mux.add_handle_and_send_initial_adds(first).await })
    };
    mux.added("a".to_string(), fields(json!({"v": 1})));
    mux.added("b".to_string(), fields(json!({"v": 2})));
    mux.ready();
    attach.await.unwrap().unwrap();

    // Batch delivery through the initial_adds callback.
    let batch: Arc<Mutex<Vec<String>>> = Default::default();
    let batch_sink = Arc::clone(&batch);
    let late = mux.new_handle(
        ObserveCallbacks {
            initial_adds: Some(Box::new(move |docs: &[Document]| {
                let mut ids: Vec<String> = docs.iter().map(|d| d.id.clone()).collect();
                ids.sort();
                batch_sink.lock().unwrap().extend(ids);
            })),
            ..Default::default()
        },
        true,
    );
    mux.add_handle_and_send_initial_adds(late).await.unwrap();

    assert_eq!(*batch.lock().unwrap(), vec!["a", "b"]);
}

/// Test: non-add events before ready are a detected driver bug
#[tokio::test]
async fn test_non_add_before_ready_rejected() {
    let mux = ObserveMultiplexer::new(false);
    let err = mux
        .apply_event(ObserveEvent::Removed {
            id: "a".to_string(),
        })
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Observe(ObserveError::NotReady { kind: "removed" })
    ));
}

/// Test: ready is single-shot; the second call errors in the queue
#[tokio::test]
async fn test_ready_idempotence_error() {
    let mux = ObserveMultiplexer::new(false);
    mux.apply_ready().unwrap();
    assert!(matches!(
        mux.apply_ready(),
        Err(Error::Observe(ObserveError::AlreadyReady))
    ));
}

/// Test: query_error before ready rejects pending attaches and stops
///
/// Scenario:
/// - A handle is waiting on the readiness barrier
/// - The driver reports a permanent query error
/// - The attach future must reject and on_stop must run
#[tokio::test]
async fn test_query_error_rejects_attach() {
    let mux = ObserveMultiplexer::new(false);
    let stopped = Arc::new(AtomicUsize::new(0));
    let stop_count = Arc::clone(&stopped);
    mux.set_on_stop(move || {
        stop_count.fetch_add(1, Ordering::SeqCst);
    });

    let handle = mux.new_handle(ObserveCallbacks::default(), true);
    let attach = {
        let mux = Arc::clone(&mux);
        tokio::spawn(async move { mux.add_handle_and_send_initial_adds(handle).await })
    };
    tokio::task::yield_now().await;

    mux.query_error(Error::Fatal("bad selector".to_string()));
    let result = attach.await.unwrap();
    assert!(result.is_err(), "attach must reject with the query error");
    assert!(mux.is_stopped());
    assert_eq!(stopped.load(Ordering::SeqCst), 1);

    // After the failure the multiplexer accepts no new handles.
    let rejected = mux.new_handle(ObserveCallbacks::default(), true);
    assert!(mux.add_handle_and_send_initial_adds(rejected).await.is_err());
}

/// Test: query_error after ready is itself the error
#[tokio::test]
async fn test_query_error_after_ready_rejected() {
    let mux = ObserveMultiplexer::new(false);
    mux.apply_ready().unwrap();
    assert!(matches!(
        mux.apply_query_error(Error::Fatal("late".to_string())),
        Err(Error::Observe(ObserveError::QueryErrorAfterReady))
    ));
}

/// Test: on_stop runs exactly once, when the last handle detaches
#[tokio::test]
async fn test_on_stop_last_handle() {
    let mux = ObserveMultiplexer::new(false);
    let stopped = Arc::new(AtomicUsize::new(0));
    let stop_count = Arc::clone(&stopped);
    mux.set_on_stop(move || {
        stop_count.fetch_add(1, Ordering::SeqCst);
    });

    let first = mux.new_handle(ObserveCallbacks::default(), true);
    let second = mux.new_handle(ObserveCallbacks::default(), true);
    let attach_first = {
        let mux = Arc::clone(&mux);
        let h = Arc::clone(&first);
        tokio::spawn(async move { mux.add_handle_and_send_initial_adds(h).await })
    };
    let attach_second = {
        let mux = Arc::clone(&mux);
        let h = Arc::clone(&second);
        tokio::spawn(async move { mux.add_handle_and_send_initial_adds(h).await })
    };
    mux.ready();
    attach_first.await.unwrap().unwrap();
    attach_second.await.unwrap().unwrap();
    assert_eq!(mux.handle_count(), 2);

    first.stop();
    first.stop();
    assert_eq!(stopped.load(Ordering::SeqCst), 0, "one handle still attached");

    second.stop();
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
    assert!(mux.is_stopped());
}

/// Test: a stopped handle sees no further events
#[tokio::test]
async fn test_stopped_handle_skipped() {
    let mux = ObserveMultiplexer::new(false);
    let log: EventLog = Default::default();
    let keeper = mux.new_handle(logging_callbacks(Arc::clone(&log)), true);
    let leaver_log: EventLog = Default::default();
    let leaver = mux.new_handle(logging_callbacks(Arc::clone(&leaver_log)), true);

    let attach = {
        let mux = Arc::clone(&mux);
        let keeper = Arc::clone(&keeper);
        tokio::spawn(async move { mux.add_handle_and_send_initial_adds(keeper).await })
    };
    tokio::task::yield_now().await;
    mux.ready();
    attach.await.unwrap().unwrap();
    mux.add_handle_and_send_initial_adds(Arc::clone(&leaver)).await.unwrap();

    leaver.stop();
    mux.added("a".to_string(), fields(json!({})));
    mux.task_queue().drain().await;

    assert_eq!(*log.lock().unwrap(), vec!["added:a:0"]);
    assert!(leaver_log.lock().unwrap().is_empty(), "no events after stop");
}

/// Test: on_flush runs after every already-enqueued event delivers
#[tokio::test]
async fn test_on_flush_ordering() {
    let mux = ObserveMultiplexer::new(false);
    let log: EventLog = Default::default();
    let handle = mux.new_handle(logging_callbacks(Arc::clone(&log)), true);
    let attach = {
        let mux = Arc::clone(&mux);
        tokio::spawn(async move { mux.add_handle_and_send_initial_adds(handle).await })
    };
    tokio::task::yield_now().await;
    mux.ready();
    attach.await.unwrap().unwrap();

    mux.added("a".to_string(), fields(json!({})));
    mux.added("b".to_string(), fields(json!({})));
    let flush_log = Arc::clone(&log);
    mux.on_flush(move || {
        flush_log.lock().unwrap().push("flush".to_string());
    });
    mux.task_queue().drain().await;

    assert_eq!(*log.lock().unwrap(), vec!["added:a:0", "added:b:0", "flush"]);
}
