//! Test harness: an in-memory transport pair and a server rig over the
//! in-memory document store.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use ddp_engine_core::EngineConfig;
use ddp_engine_core::LiveConnection;
use ddp_engine_core::test_utils::MemoryStore;
use ddp_engine_proto::ClientMessage;
use ddp_engine_proto::ServerMessage;
use ddp_engine_proto::stringify_client;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::Server;
use crate::transport::ConnectionSink;
use crate::transport::RawConnection;

/// Outbound sink backed by a channel the test reads from.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
    closed: AtomicBool,
}

impl ConnectionSink for ChannelSink {
    fn send_frame(
        &self,
        frame: String,
    ) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.tx.send(frame);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// The client half of an in-memory connection.
pub struct TestClient {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<String>,
    sink: Arc<ChannelSink>,
}

impl TestClient {
    pub fn send(
        &self,
        message: &ClientMessage,
    ) {
        self.send_raw(stringify_client(message));
    }

    pub fn send_raw(
        &self,
        frame: impl Into<String>,
    ) {
        let _ = self.to_server.send(frame.into());
    }

    /// Drop the client side of the socket.
    pub fn disconnect(self) {}

    pub fn is_closed(&self) -> bool {
        self.sink.closed.load(Ordering::SeqCst)
    }

    /// Next frame from the server, parsed; panics after two seconds of
    /// silence so a broken test fails instead of hanging.
    pub async fn recv(&mut self) -> ServerMessage {
        let frame = timeout(Duration::from_secs(2), self.from_server.recv())
            .await
            .expect("timed out waiting for a server frame")
            .expect("server hung up");
        serde_json::from_str(&frame).unwrap_or_else(|e| panic!("bad frame {frame}: {e}"))
    }

    /// Next frame, or `None` when the server stays silent briefly.
    pub async fn try_recv(&mut self) -> Option<ServerMessage> {
        match timeout(Duration::from_millis(200), self.from_server.recv()).await {
            Ok(Some(frame)) => {
                Some(serde_json::from_str(&frame).unwrap_or_else(|e| panic!("bad frame {frame}: {e}")))
            }
            _ => None,
        }
    }

    /// Receive until a predicate matches, collecting what came before.
    pub async fn recv_until(
        &mut self,
        mut predicate: impl FnMut(&ServerMessage) -> bool,
    ) -> (Vec<ServerMessage>, ServerMessage) {
        let mut before = Vec::new();
        loop {
            let message = self.recv().await;
            if predicate(&message) {
                return (before, message);
            }
            before.push(message);
        }
    }
}

/// Build one in-memory connection: the server half and the client half.
pub fn connection_pair() -> (RawConnection, TestClient) {
    connection_with_headers(None, HashMap::new())
}

pub fn connection_with_headers(
    remote_address: Option<String>,
    headers: HashMap<String, String>,
) -> (RawConnection, TestClient) {
    let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
    let (from_server_tx, from_server_rx) = mpsc::unbounded_channel();
    let sink = Arc::new(ChannelSink {
        tx: from_server_tx,
        closed: AtomicBool::new(false),
    });
    let raw = RawConnection {
        frames: to_server_rx,
        sink: Arc::clone(&sink) as Arc<dyn ConnectionSink>,
        remote_address,
        headers,
    };
    let client = TestClient {
        to_server: to_server_tx,
        from_server: from_server_rx,
        sink,
    };
    (raw, client)
}

/// A server over the in-memory store with test-friendly polling times.
pub struct TestRig {
    pub server: Server,
    pub store: Arc<MemoryStore>,
    pub live: Arc<LiveConnection>,
}

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.polling.throttle_ms = 1;
    config.polling.interval_ms = 50;
    // Heartbeats stay quiet unless a test turns them on.
    config.heartbeat.interval_ms = 0;
    config
}

pub fn rig() -> TestRig {
    rig_with_config(test_config())
}

pub fn rig_with_config(config: EngineConfig) -> TestRig {
    let store = Arc::new(MemoryStore::new());
    let live = LiveConnection::new(Arc::clone(&store) as Arc<_>, config.clone());
    let server = Server::new(Arc::clone(&live), config);
    TestRig {
        server,
        store,
        live,
    }
}

/// Connect a fresh client at the given protocol version and consume the
/// `connected` reply.
pub async fn connected_client(
    rig: &TestRig,
    version: &str,
) -> TestClient {
    let (raw, mut client) = connection_pair();
    rig.server.handle_connection(raw);
    client.send(&ClientMessage::Connect {
        version: version.to_string(),
        support: vec![version.to_string()],
    });
    match client.recv().await {
        ServerMessage::Connected {
            ..
        } => client,
        other => panic!("expected connected, got {other:?}"),
    }
}
