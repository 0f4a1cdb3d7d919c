//! End-to-end protocol scenarios against an in-memory store and
//! transport: negotiation, subscription snapshots and deltas, the
//! method write fence, merge-box precedence on the wire, and the
//! user-id rebind diff.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use ddp_engine_core::CursorDescription;
use ddp_engine_core::CursorOptions;
use ddp_engine_core::store::DocumentStore;
use ddp_engine_server::LiveCursor;
use ddp_engine_server::PublicationStrategy;
use ddp_engine_server::PublishOutcome;
use ddp_engine_server::test_utils::TestRig;
use ddp_engine_server::test_utils::connected_client;
use ddp_engine_server::test_utils::connection_pair;
use ddp_engine_server::test_utils::rig;
use ddp_engine_server::test_utils::rig_with_config;
use ddp_engine_server::test_utils::test_config;
use ddp_engine_proto::ClientMessage;
use ddp_engine_proto::Document;
use ddp_engine_proto::ServerMessage;
use serde_json::Value;
use serde_json::json;

fn doc(
    id: &str,
    fields: Value,
) -> Document {
    let mut object = fields;
    object["_id"] = json!(id);
    Document::from_object(object).unwrap()
}

fn fields(value: Value) -> ddp_engine_proto::Fields {
    serde_json::from_value(value).unwrap()
}

/// Publish a live cursor over `collection` with the given selector.
fn publish_cursor(
    rig: &TestRig,
    name: &str,
    collection: &'static str,
    selector: Value,
    options: CursorOptions,
) {
    let live = rig.server.live();
    rig.server.publish(Some(name), move |_sub, _params| {
        let live = Arc::clone(&live);
        let selector = selector.clone();
        let options = options.clone();
        async move {
            let description = CursorDescription::new(collection, selector, options)?;
            Ok(PublishOutcome::Cursor(Box::new(LiveCursor {
                connection: live,
                description,
            })))
        }
    });
}

fn sub(
    client: &ddp_engine_server::test_utils::TestClient,
    id: &str,
    name: &str,
) {
    client.send(&ClientMessage::Sub {
        id: id.to_string(),
        name: name.to_string(),
        params: None,
    });
}

/// The server prefers its own version ordering over the proposal.
#[tokio::test]
async fn test_version_negotiation_failed() {
    let rig = rig();
    let (raw, mut client) = connection_pair();
    rig.server.handle_connection(raw);

    client.send_raw(r#"{"msg":"connect","version":"1","support":["1","1a"]}"#);
    match client.recv().await {
        ServerMessage::Failed {
            version,
        } => assert_eq!(version, "1a"),
        other => panic!("expected failed, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(client.is_closed(), "failed negotiation closes the socket");
}

/// A matching proposal connects.
#[tokio::test]
async fn test_version_negotiation_accepted() {
    let rig = rig();
    let (raw, mut client) = connection_pair();
    rig.server.handle_connection(raw);

    client.send_raw(r#"{"msg":"connect","version":"1a","support":["1a","1"]}"#);
    match client.recv().await {
        ServerMessage::Connected {
            session,
        } => assert!(!session.is_empty()),
        other => panic!("expected connected, got {other:?}"),
    }
    assert_eq!(rig.server.session_count(), 1);
}

/// A subscription delivers the matching snapshot, then ready, and
/// nothing for non-matching documents.
#[tokio::test]
async fn test_basic_sub() {
    let rig = rig();
    rig.store
        .insert_one("fruit", &doc("a", json!({"category": "apples", "qty": 3})))
        .await
        .unwrap();
    rig.store
        .insert_one("fruit", &doc("b", json!({"category": "pears", "qty": 4})))
        .await
        .unwrap();
    publish_cursor(
        &rig,
        "apples",
        "fruit",
        json!({"category": "apples"}),
        CursorOptions::default(),
    );

    let mut client = connected_client(&rig, "1").await;
    sub(&client, "s1", "apples");

    match client.recv().await {
        ServerMessage::Added {
            collection,
            id,
            fields,
        } => {
            assert_eq!(collection, "fruit");
            assert_eq!(id, "a");
            assert_eq!(fields.get("category"), Some(&json!("apples")));
            assert_eq!(fields.get("qty"), Some(&json!(3)));
        }
        other => panic!("expected added, got {other:?}"),
    }
    match client.recv().await {
        ServerMessage::Ready {
            subs,
        } => assert_eq!(subs, vec!["s1"]),
        other => panic!("expected ready, got {other:?}"),
    }
    assert!(client.try_recv().await.is_none(), "no message for the pear");
}

/// A method's `updated` ack follows every delta it caused.
#[tokio::test]
async fn test_method_write_fence() {
    let rig = rig();
    publish_cursor(
        &rig,
        "apples",
        "fruit",
        json!({"category": "apples"}),
        CursorOptions::default(),
    );
    let live = rig.server.live();
    rig.server.method("test-add", move |_ctx, params| {
        let live = Arc::clone(&live);
        async move {
            let category = params[0].as_str().unwrap_or_default().to_string();
            let value = params[1].clone();
            live.insert("fruit", doc("c", json!({"category": category, "value": value})))
                .await?;
            Ok(None)
        }
    });

    let mut client = connected_client(&rig, "1").await;
    sub(&client, "s1", "apples");
    let (_, _ready) = client.recv_until(|m| matches!(m, ServerMessage::Ready { .. })).await;

    client.send(&ClientMessage::Method {
        id: "m1".to_string(),
        method: "test-add".to_string(),
        params: Some(vec![json!("apples"), json!(7)]),
        random_seed: None,
    });

    let first = client.recv().await;
    assert_eq!(
        first,
        ServerMessage::Result {
            id: "m1".to_string(),
            result: None,
            error: None
        },
        "result precedes the data"
    );
    let second = client.recv().await;
    match &second {
        ServerMessage::Added {
            collection,
            id,
            fields,
        } => {
            assert_eq!(collection, "fruit");
            assert_eq!(id, "c");
            assert_eq!(fields.get("value"), Some(&json!(7)));
        }
        other => panic!("expected added before updated, got {other:?}"),
    }
    let third = client.recv().await;
    assert_eq!(
        third,
        ServerMessage::Updated {
            methods: vec!["m1".to_string()]
        },
        "updated must not precede the added it fenced"
    );
}

/// Overlapping subscriptions merge; the client sees one coherent
/// document image.
#[tokio::test]
async fn test_merge_box_precedence_on_wire() {
    let rig = rig();
    rig.store.insert_one("fruit", &doc("x", json!({"q": 5, "r": 6}))).await.unwrap();
    publish_cursor(&rig, "whole", "fruit", json!({"_id": "x"}), CursorOptions::default());
    publish_cursor(
        &rig,
        "partial",
        "fruit",
        json!({"_id": "x"}),
        CursorOptions {
            projection: Some(json!({"q": 0})),
            ..Default::default()
        },
    );

    let mut client = connected_client(&rig, "1").await;
    sub(&client, "s1", "whole");
    let (before, _) = client.recv_until(|m| matches!(m, ServerMessage::Ready { .. })).await;
    assert_eq!(
        before,
        vec![ServerMessage::Added {
            collection: "fruit".to_string(),
            id: "x".to_string(),
            fields: fields(json!({"q": 5, "r": 6})),
        }]
    );

    sub(&client, "s2", "partial");
    let (before, ready) = client.recv_until(|m| matches!(m, ServerMessage::Ready { .. })).await;
    assert_eq!(
        ready,
        ServerMessage::Ready {
            subs: vec!["s2".to_string()]
        }
    );
    assert!(
        before.is_empty(),
        "the second sub contributes no new visible fields, got {before:?}"
    );
}

/// The client-visible half of a transient store failure: the hiccup
/// delays the stream but does not corrupt it (the driver-level retry
/// accounting lives in `observe::driver_test`).
#[tokio::test]
async fn test_transient_store_error_client_view() {
    let rig = rig();
    publish_cursor(&rig, "all", "fruit", json!({"kind": "fruit"}), CursorOptions::default());
    let mut client = connected_client(&rig, "1").await;
    sub(&client, "s1", "all");
    client.recv_until(|m| matches!(m, ServerMessage::Ready { .. })).await;

    rig.store.inject_find_error(ddp_engine_core::StoreError::transient("blip"));
    rig.store.insert_one("fruit", &doc("late", json!({"kind": "fruit"}))).await.unwrap();
    rig.live.crossbar().fire(json!({"collection": "fruit", "id": "late"}));

    // The failing poll emits nothing; the forced interval retry (50ms)
    // delivers the document.
    match client.recv().await {
        ServerMessage::Added {
            id,
            ..
        } => assert_eq!(id, "late"),
        other => panic!("expected added after retry, got {other:?}"),
    }
}

/// setUserId deactivates every subscription, reruns them under the
/// new identity, and sends the client the minimal diff.
#[tokio::test]
async fn test_set_user_id_rerun() {
    let rig = rig();
    rig.store
        .insert_one("notes", &doc("n1", json!({"ownerId": "u1", "text": "mine"})))
        .await
        .unwrap();
    rig.store
        .insert_one("notes", &doc("n2", json!({"ownerId": "u2", "text": "theirs"})))
        .await
        .unwrap();

    let live = rig.server.live();
    rig.server.publish(Some("my-notes"), move |sub, _params| {
        let live = Arc::clone(&live);
        let owner = sub.user_id().unwrap_or("nobody").to_string();
        async move {
            let description = CursorDescription::new(
                "notes",
                json!({"ownerId": owner}),
                CursorOptions::default(),
            )?;
            Ok(PublishOutcome::Cursor(Box::new(LiveCursor {
                connection: live,
                description,
            })))
        }
    });
    rig.server.method("login", |ctx, params| async move {
        let user = params[0].as_str().map(str::to_string);
        ctx.set_user_id(user).await?;
        Ok(None)
    });

    let mut client = connected_client(&rig, "1").await;

    // Bind to u1 first, then subscribe.
    client.send(&ClientMessage::Method {
        id: "m1".to_string(),
        method: "login".to_string(),
        params: Some(vec![json!("u1")]),
        random_seed: None,
    });
    client.recv_until(|m| matches!(m, ServerMessage::Updated { .. })).await;

    sub(&client, "s1", "my-notes");
    let (before, _) = client.recv_until(|m| matches!(m, ServerMessage::Ready { .. })).await;
    assert_eq!(
        before,
        vec![ServerMessage::Added {
            collection: "notes".to_string(),
            id: "n1".to_string(),
            fields: fields(json!({"ownerId": "u1", "text": "mine"})),
        }]
    );

    // Switch to u2: the client's view flips from n1 to n2.
    client.send(&ClientMessage::Method {
        id: "m2".to_string(),
        method: "login".to_string(),
        params: Some(vec![json!("u2")]),
        random_seed: None,
    });

    let (messages, _) = client.recv_until(|m| matches!(m, ServerMessage::Updated { .. })).await;
    let removed: Vec<&ServerMessage> =
        messages.iter().filter(|m| matches!(m, ServerMessage::Removed { .. })).collect();
    let added: Vec<&ServerMessage> =
        messages.iter().filter(|m| matches!(m, ServerMessage::Added { .. })).collect();
    assert_eq!(
        removed,
        vec![&ServerMessage::Removed {
            collection: "notes".to_string(),
            id: "n1".to_string(),
        }]
    );
    assert_eq!(
        added,
        vec![&ServerMessage::Added {
            collection: "notes".to_string(),
            id: "n2".to_string(),
            fields: fields(json!({"ownerId": "u2", "text": "theirs"})),
        }]
    );
    assert!(
        messages.iter().any(|m| matches!(m, ServerMessage::Ready { .. })),
        "the rerun subscription re-reports ready, got {messages:?}"
    );
}

/// unsub of a missing id answers nosub without an error, repeatedly.
#[tokio::test]
async fn test_unsub_idempotent() {
    let rig = rig();
    let mut client = connected_client(&rig, "1").await;

    for _ in 0..2 {
        client.send(&ClientMessage::Unsub {
            id: "nope".to_string(),
        });
        assert_eq!(
            client.recv().await,
            ServerMessage::Nosub {
                id: "nope".to_string(),
                error: None
            }
        );
    }
}

/// A duplicate sub id on the same session is a silent no-op.
#[tokio::test]
async fn test_duplicate_sub_silent() {
    let rig = rig();
    rig.store.insert_one("fruit", &doc("a", json!({"category": "apples"}))).await.unwrap();
    publish_cursor(
        &rig,
        "apples",
        "fruit",
        json!({"category": "apples"}),
        CursorOptions::default(),
    );
    let mut client = connected_client(&rig, "1").await;

    sub(&client, "s1", "apples");
    client.recv_until(|m| matches!(m, ServerMessage::Ready { .. })).await;

    sub(&client, "s1", "apples");
    assert!(client.try_recv().await.is_none(), "duplicate sub produced output");
}

/// Subscribing to an unknown publication answers nosub 404.
#[tokio::test]
async fn test_unknown_publication() {
    let rig = rig();
    let mut client = connected_client(&rig, "1").await;
    sub(&client, "s1", "missing");

    match client.recv().await {
        ServerMessage::Nosub {
            id,
            error,
        } => {
            assert_eq!(id, "s1");
            assert_eq!(error.expect("carries an error").error, json!(404));
        }
        other => panic!("expected nosub, got {other:?}"),
    }
}

/// An unknown method answers an error result plus updated.
#[tokio::test]
async fn test_unknown_method() {
    let rig = rig();
    let mut client = connected_client(&rig, "1").await;
    client.send(&ClientMessage::Method {
        id: "m1".to_string(),
        method: "missing".to_string(),
        params: None,
        random_seed: None,
    });

    match client.recv().await {
        ServerMessage::Result {
            id,
            error,
            ..
        } => {
            assert_eq!(id, "m1");
            assert_eq!(error.expect("carries an error").error, json!(404));
        }
        other => panic!("expected result, got {other:?}"),
    }
    assert_eq!(
        client.recv().await,
        ServerMessage::Updated {
            methods: vec!["m1".to_string()]
        }
    );
}

/// A client-safe method error travels verbatim; an internal error is
/// sanitized to 500.
#[tracing_test::traced_test]
#[tokio::test]
async fn test_method_error_sanitization() {
    let rig = rig();
    rig.server.method("forbidden", |_ctx, _params| async move {
        Err(ddp_engine_server::HandlerError::Client(
            ddp_engine_proto::ClientError::with_reason("not-allowed", "No."),
        ))
    });
    rig.server.method("broken", |_ctx, _params| async move {
        Err(ddp_engine_server::HandlerError::Internal("db password is hunter2".to_string()))
    });

    let mut client = connected_client(&rig, "1").await;
    client.send(&ClientMessage::Method {
        id: "m1".to_string(),
        method: "forbidden".to_string(),
        params: None,
        random_seed: None,
    });
    match client.recv().await {
        ServerMessage::Result {
            error: Some(error),
            ..
        } => {
            assert_eq!(error.error, json!("not-allowed"));
            assert_eq!(error.reason.as_deref(), Some("No."));
        }
        other => panic!("expected error result, got {other:?}"),
    }
    client.recv_until(|m| matches!(m, ServerMessage::Updated { .. })).await;

    client.send(&ClientMessage::Method {
        id: "m2".to_string(),
        method: "broken".to_string(),
        params: None,
        random_seed: None,
    });
    match client.recv().await {
        ServerMessage::Result {
            error: Some(error),
            ..
        } => {
            assert_eq!(error.error, json!(500));
            assert_eq!(error.reason.as_deref(), Some("Internal server error"));
        }
        other => panic!("expected sanitized result, got {other:?}"),
    }
    assert!(logs_contain("sanitized for the wire"), "the original error is logged in full");
}

/// ping answers pong (echoing the id) on non-pre1 protocols.
#[tokio::test]
async fn test_ping_pong() {
    let rig = rig();
    let mut client = connected_client(&rig, "1").await;

    client.send(&ClientMessage::Ping {
        id: Some("p1".to_string()),
    });
    assert_eq!(
        client.recv().await,
        ServerMessage::Pong {
            id: Some("p1".to_string())
        }
    );

    client.send(&ClientMessage::Pong {
        id: None,
    });
    assert!(client.try_recv().await.is_none(), "pong is ignored");
}

/// Malformed messages earn an error frame with the offending message,
/// not a disconnect.
#[tokio::test]
async fn test_protocol_errors() {
    let rig = rig();
    let mut client = connected_client(&rig, "1").await;

    client.send_raw(r#"{"msg":"launch","id":9}"#);
    match client.recv().await {
        ServerMessage::Error {
            offending_message,
            ..
        } => {
            assert_eq!(offending_message.expect("echoes the frame")["msg"], json!("launch"));
        }
        other => panic!("expected error, got {other:?}"),
    }

    client.send_raw("not json at all");
    match client.recv().await {
        ServerMessage::Error {
            offending_message,
            ..
        } => assert!(offending_message.is_none()),
        other => panic!("expected error, got {other:?}"),
    }

    // The session survived both.
    client.send(&ClientMessage::Ping {
        id: None,
    });
    assert_eq!(
        client.recv().await,
        ServerMessage::Pong {
            id: None
        }
    );
}

/// Pre-connect traffic that is not connect is rejected.
#[tokio::test]
async fn test_must_connect_first() {
    let rig = rig();
    let (raw, mut client) = connection_pair();
    rig.server.handle_connection(raw);

    client.send_raw(r#"{"msg":"ping"}"#);
    match client.recv().await {
        ServerMessage::Error {
            reason,
            ..
        } => assert_eq!(reason, "Must connect first"),
        other => panic!("expected error, got {other:?}"),
    }
}

/// NO_MERGE_NO_HISTORY skips removed on stop; NO_MERGE sends it.
#[tokio::test]
async fn test_publication_strategies_on_stop() {
    let rig = rig();
    rig.store.insert_one("logs", &doc("l1", json!({"topic": "all"}))).await.unwrap();
    publish_cursor(&rig, "history", "logs", json!({"topic": "all"}), CursorOptions::default());
    publish_cursor(&rig, "firehose", "logs", json!({"topic": "all"}), CursorOptions::default());
    rig.server.set_publication_strategy("history", PublicationStrategy::NoMerge);
    rig.server
        .set_publication_strategy("firehose", PublicationStrategy::NoMergeNoHistory);

    let mut client = connected_client(&rig, "1").await;

    sub(&client, "s1", "firehose");
    client.recv_until(|m| matches!(m, ServerMessage::Ready { .. })).await;
    client.send(&ClientMessage::Unsub {
        id: "s1".to_string(),
    });
    let (before, _) = client.recv_until(|m| matches!(m, ServerMessage::Nosub { .. })).await;
    assert!(before.is_empty(), "no-history stop sends no removed, got {before:?}");

    sub(&client, "s2", "history");
    client.recv_until(|m| matches!(m, ServerMessage::Ready { .. })).await;
    client.send(&ClientMessage::Unsub {
        id: "s2".to_string(),
    });
    let (before, _) = client.recv_until(|m| matches!(m, ServerMessage::Nosub { .. })).await;
    assert_eq!(
        before,
        vec![ServerMessage::Removed {
            collection: "logs".to_string(),
            id: "l1".to_string(),
        }],
        "accounting strategy sends removed at stop"
    );
}

/// Version 1a: the initial burst arrives as one init message, and a
/// stopped subscription's documents are cleaned up client-side.
#[tokio::test]
async fn test_version_1a_init_and_cleanup() {
    let rig = rig();
    for id in ["a", "b", "c"] {
        rig.store.insert_one("fruit", &doc(id, json!({"category": "apples"}))).await.unwrap();
    }
    publish_cursor(
        &rig,
        "apples",
        "fruit",
        json!({"category": "apples"}),
        CursorOptions::default(),
    );

    let mut client = connected_client(&rig, "1a").await;
    sub(&client, "s1", "apples");

    match client.recv().await {
        ServerMessage::Init {
            collection,
            items,
        } => {
            assert_eq!(collection, "fruit");
            let mut ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
            ids.sort();
            assert_eq!(ids, vec!["a", "b", "c"]);
        }
        other => panic!("expected init batch, got {other:?}"),
    }
    client.recv_until(|m| matches!(m, ServerMessage::Ready { .. })).await;

    client.send(&ClientMessage::Unsub {
        id: "s1".to_string(),
    });
    let (before, _) = client.recv_until(|m| matches!(m, ServerMessage::Nosub { .. })).await;
    assert!(before.is_empty(), "1a clients clean up stopped subs themselves, got {before:?}");
}

/// A method that unblocks lets later messages run while it finishes.
#[tokio::test]
async fn test_method_unblock() {
    let rig = rig();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let release_rx = Arc::new(Mutex::new(Some(release_rx)));
    rig.server.method("slow", move |ctx, _params| {
        let release_rx = Arc::clone(&release_rx);
        async move {
            ctx.unblock();
            let rx = release_rx.lock().unwrap().take();
            if let Some(rx) = rx {
                let _ = rx.await;
            }
            Ok(Some(json!("slow-done")))
        }
    });
    rig.server.method("fast", |_ctx, _params| async move { Ok(Some(json!("fast-done"))) });

    let mut client = connected_client(&rig, "1").await;
    client.send(&ClientMessage::Method {
        id: "m-slow".to_string(),
        method: "slow".to_string(),
        params: None,
        random_seed: None,
    });
    client.send(&ClientMessage::Method {
        id: "m-fast".to_string(),
        method: "fast".to_string(),
        params: None,
        random_seed: None,
    });

    // The fast method finishes while the slow one is parked.
    let (_, fast) = client
        .recv_until(|m| matches!(m, ServerMessage::Result { id, .. } if id == "m-fast"))
        .await;
    match fast {
        ServerMessage::Result {
            result,
            ..
        } => assert_eq!(result, Some(json!("fast-done"))),
        _ => unreachable!(),
    }

    release_tx.send(()).unwrap();
    let (_, slow) = client
        .recv_until(|m| matches!(m, ServerMessage::Result { id, .. } if id == "m-slow"))
        .await;
    match slow {
        ServerMessage::Result {
            result,
            ..
        } => assert_eq!(result, Some(json!("slow-done"))),
        _ => unreachable!(),
    }
}

/// Universal publications start on connect and on late registration.
#[tokio::test]
async fn test_universal_subscriptions() {
    let rig = rig();
    rig.server.publish(None, |sub, _params| async move {
        sub.added("motd", "today", fields(json!({"text": "welcome"})));
        Ok(PublishOutcome::Handled)
    });

    let mut client = connected_client(&rig, "1").await;
    match client.recv().await {
        ServerMessage::Added {
            collection,
            id,
            fields,
        } => {
            assert_eq!(collection, "motd");
            assert_eq!(id, "today");
            assert_eq!(fields.get("text"), Some(&json!("welcome")));
        }
        other => panic!("expected universal added, got {other:?}"),
    }

    // Late registration reaches the already-open session.
    rig.server.publish(None, |sub, _params| async move {
        sub.added("motd", "later", Default::default());
        Ok(PublishOutcome::Handled)
    });
    match client.recv().await {
        ServerMessage::Added {
            id,
            ..
        } => assert_eq!(id, "later"),
        other => panic!("expected late universal added, got {other:?}"),
    }
}

/// Connection hooks observe the session; close hooks run on disconnect.
#[tokio::test]
async fn test_connection_hooks() {
    let rig = rig();
    let seen: Arc<Mutex<Vec<String>>> = Default::default();
    let closed: Arc<Mutex<Vec<String>>> = Default::default();
    {
        let seen = Arc::clone(&seen);
        let closed = Arc::clone(&closed);
        rig.server.on_connection(move |handle| {
            seen.lock().unwrap().push(handle.id().to_string());
            let closed = Arc::clone(&closed);
            let id = handle.id().to_string();
            handle.on_close(move || {
                closed.lock().unwrap().push(id);
            });
        });
    }
    let frames: Arc<Mutex<usize>> = Default::default();
    {
        let frames = Arc::clone(&frames);
        rig.server.on_message(move |_frame| {
            *frames.lock().unwrap() += 1;
        });
    }

    let client = connected_client(&rig, "1").await;
    assert_eq!(seen.lock().unwrap().len(), 1, "connection hook ran");
    assert!(*frames.lock().unwrap() >= 1, "message hook saw the connect frame");

    client.disconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*closed.lock().unwrap(), *seen.lock().unwrap(), "close hook ran");
    assert_eq!(rig.server.session_count(), 0);
}

/// In-process method calls resolve after their fence commits.
#[tokio::test]
async fn test_call_method() {
    let rig = rig();
    let live = rig.server.live();
    rig.server.method("bump", move |_ctx, _params| {
        let live = Arc::clone(&live);
        async move {
            live.insert("fruit", doc("k", json!({"kind": "kiwi"}))).await?;
            Ok(Some(json!("ok")))
        }
    });

    let result = rig.server.call_method("bump", Vec::new()).await.unwrap();
    assert_eq!(result, Some(json!("ok")));
    assert_eq!(rig.store.doc_count("fruit"), 1);

    let missing = rig.server.call_method("absent", Vec::new()).await;
    assert!(missing.is_err());
}

/// The heartbeat closes a silent session.
#[tokio::test]
async fn test_heartbeat_timeout_closes() {
    let mut config = test_config();
    config.heartbeat.interval_ms = 40;
    config.heartbeat.timeout_ms = 40;
    let rig = rig_with_config(config);

    let mut client = connected_client(&rig, "1").await;
    match client.recv().await {
        ServerMessage::Ping {
            ..
        } => {}
        other => panic!("expected heartbeat ping, got {other:?}"),
    }
    // Stay silent past the timeout.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(client.is_closed(), "silent session must be closed");
    assert_eq!(rig.server.session_count(), 0);
}

/// Live updates flow as changed/removed after the snapshot.
#[tokio::test]
async fn test_live_changed_removed() {
    let rig = rig();
    rig.store.insert_one("fruit", &doc("a", json!({"category": "apples", "qty": 1}))).await.unwrap();
    publish_cursor(
        &rig,
        "apples",
        "fruit",
        json!({"category": "apples"}),
        CursorOptions::default(),
    );
    let live = rig.server.live();
    {
        let live = Arc::clone(&live);
        rig.server.method("set-qty", move |_ctx, params| {
            let live = Arc::clone(&live);
            async move {
                let qty = params[0].clone();
                let patch = [("qty".to_string(), Some(qty))].into();
                live.update("fruit", "a", &patch).await?;
                Ok(None)
            }
        });
    }
    {
        let live = Arc::clone(&live);
        rig.server.method("eat", move |_ctx, _params| {
            let live = Arc::clone(&live);
            async move {
                live.remove("fruit", "a").await?;
                Ok(None)
            }
        });
    }

    let mut client = connected_client(&rig, "1").await;
    sub(&client, "s1", "apples");
    client.recv_until(|m| matches!(m, ServerMessage::Ready { .. })).await;

    client.send(&ClientMessage::Method {
        id: "m1".to_string(),
        method: "set-qty".to_string(),
        params: Some(vec![json!(2)]),
        random_seed: None,
    });
    let (messages, _) = client.recv_until(|m| matches!(m, ServerMessage::Updated { .. })).await;
    assert!(
        messages.contains(&ServerMessage::Changed {
            collection: "fruit".to_string(),
            id: "a".to_string(),
            fields: fields(json!({"qty": 2})),
            cleared: Vec::new(),
        }),
        "expected a changed frame, got {messages:?}"
    );

    client.send(&ClientMessage::Method {
        id: "m2".to_string(),
        method: "eat".to_string(),
        params: None,
        random_seed: None,
    });
    let (messages, _) = client.recv_until(|m| matches!(m, ServerMessage::Updated { .. })).await;
    assert!(
        messages.contains(&ServerMessage::Removed {
            collection: "fruit".to_string(),
            id: "a".to_string(),
        }),
        "expected a removed frame, got {messages:?}"
    );
}
