//! Session heartbeat: ping after an interval of client silence, close
//! after a further timeout with no traffic at all.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio::time::sleep_until;
use tracing::debug;

pub(crate) struct Heartbeat {
    traffic_tx: watch::Sender<Instant>,
    shutdown_tx: watch::Sender<bool>,
}

impl Heartbeat {
    /// Spawn the heartbeat loop. `on_ping` is called after
    /// `interval_ms` of silence; `on_timeout` when a ping goes
    /// unanswered for `timeout_ms`.
    pub(crate) fn start(
        interval_ms: u64,
        timeout_ms: u64,
        on_ping: Arc<dyn Fn() + Send + Sync>,
        on_timeout: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        let (traffic_tx, mut traffic_rx) = watch::channel(Instant::now());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = Duration::from_millis(interval_ms);
        let timeout = Duration::from_millis(timeout_ms);

        tokio::spawn(async move {
            loop {
                let deadline = *traffic_rx.borrow_and_update() + interval;
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    changed = traffic_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                    _ = sleep_until(deadline) => {}
                }

                // Silence for a full interval: ping, then demand any
                // traffic within the timeout.
                on_ping();
                let timeout_deadline = Instant::now() + timeout;
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    changed = traffic_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = sleep_until(timeout_deadline) => {
                        debug!("[Heartbeat] no traffic within timeout; closing session");
                        on_timeout();
                        return;
                    }
                }
            }
        });

        Self {
            traffic_tx,
            shutdown_tx,
        }
    }

    /// Any inbound message counts as liveness.
    pub(crate) fn message_received(&self) {
        let _ = self.traffic_tx.send(Instant::now());
    }

    pub(crate) fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
