//! Leading + trailing throttle, modelled as a small state machine
//! (idle / cooling) rather than a chain of timers.
//!
//! A call in the idle state fires immediately and opens a cooldown
//! window; calls during the window arm a single trailing fire at the end
//! of it. The trailing fire opens a fresh window, so a sustained call
//! stream settles at one fire per window.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio::time::sleep_until;

type ThrottledFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
pub struct Throttle {
    inner: Arc<ThrottleInner>,
}

struct ThrottleInner {
    window: Duration,
    target: ThrottledFn,
    state: Mutex<ThrottleState>,
}

enum Phase {
    Idle,
    Cooling { until: Instant, trailing: bool },
}

struct ThrottleState {
    phase: Phase,
    cancelled: bool,
}

impl Throttle {
    pub fn new<F>(
        window_ms: u64,
        target: F,
    ) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ThrottleInner {
                window: Duration::from_millis(window_ms),
                target: Arc::new(target),
                state: Mutex::new(ThrottleState {
                    phase: Phase::Idle,
                    cancelled: false,
                }),
            }),
        }
    }

    /// Request a fire: immediate when idle, deferred to the end of the
    /// window when cooling.
    pub fn call(&self) {
        if self.inner.window.is_zero() {
            (self.inner.target)();
            return;
        }
        let fire_now = {
            let mut state = self.inner.state.lock().expect("throttle poisoned");
            if state.cancelled {
                return;
            }
            match &mut state.phase {
                Phase::Idle => {
                    state.phase = Phase::Cooling {
                        until: Instant::now() + self.inner.window,
                        trailing: false,
                    };
                    true
                }
                Phase::Cooling { trailing, .. } => {
                    *trailing = true;
                    false
                }
            }
        };
        if fire_now {
            self.spawn_cooldown();
            (self.inner.target)();
        }
    }

    /// Drop any armed trailing fire and ignore future calls.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock().expect("throttle poisoned");
        state.cancelled = true;
        state.phase = Phase::Idle;
    }

    fn spawn_cooldown(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let state = inner.state.lock().expect("throttle poisoned");
                    match state.phase {
                        Phase::Cooling { until, .. } => until,
                        Phase::Idle => return,
                    }
                };
                sleep_until(deadline).await;
                let fire = {
                    let mut state = inner.state.lock().expect("throttle poisoned");
                    if state.cancelled {
                        return;
                    }
                    match state.phase {
                        Phase::Cooling { trailing: true, .. } => {
                            state.phase = Phase::Cooling {
                                until: Instant::now() + inner.window,
                                trailing: false,
                            };
                            true
                        }
                        _ => {
                            state.phase = Phase::Idle;
                            return;
                        }
                    }
                };
                if fire {
                    (inner.target)();
                }
            }
        });
    }
}
