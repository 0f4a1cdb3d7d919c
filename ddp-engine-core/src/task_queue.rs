//! Strict FIFO, single-flight task executor.
//!
//! Every multiplexer and every session serializes its work through one of
//! these queues: tasks run one at a time in enqueue order, and a task
//! holds the queue across its own suspension points. The worker is a
//! tokio task spawned whenever the queue becomes non-empty and not
//! already scheduled; it parks itself by exiting when the queue drains.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::error;

use crate::QueueError;
use crate::Result;

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    state: Mutex<QueueState>,
}

struct QueueState {
    queue: VecDeque<BoxedTask>,
    /// True while a worker is scheduled or running.
    worker_scheduled: bool,
    /// True while a drain is in progress; a reentrant drain is a no-op.
    draining: bool,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    worker_scheduled: false,
                    draining: false,
                }),
            }),
        }
    }

    /// Enqueue a fire-and-forget task. Failures inside the task are the
    /// task's own business (log them); nothing is reported back.
    pub fn queue_task<F>(
        &self,
        task: F,
    ) where
        F: Future<Output = ()> + Send + 'static,
    {
        let spawn_worker = {
            let mut state = self.inner.state.lock().expect("task queue poisoned");
            state.queue.push_back(Box::pin(task));
            if state.worker_scheduled {
                false
            } else {
                state.worker_scheduled = true;
                true
            }
        };
        if spawn_worker {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                QueueInner::run_worker(inner).await;
            });
        }
    }

    /// Enqueue a task and wait for its result.
    ///
    /// The error of a failed task is handed back to the caller. Must not
    /// be awaited from inside a task of the same queue: the worker would
    /// be waiting on itself.
    pub async fn run_task<T, F>(
        &self,
        task: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.queue_task(async move {
            let _ = tx.send(task.await);
        });
        rx.await.map_err(|_| QueueError::Stopped)?
    }

    /// Wait until the queue is empty and idle. A reentrant call while a
    /// drain is already in progress returns immediately.
    pub async fn drain(&self) {
        {
            let mut state = self.inner.state.lock().expect("task queue poisoned");
            if state.draining {
                return;
            }
            state.draining = true;
        }
        loop {
            let idle = {
                let state = self.inner.state.lock().expect("task queue poisoned");
                state.queue.is_empty() && !state.worker_scheduled
            };
            if idle {
                break;
            }
            // A barrier task: everything enqueued before it has finished
            // by the time it runs. Loop again for tasks enqueued since.
            let (tx, rx) = oneshot::channel::<()>();
            self.queue_task(async move {
                let _ = tx.send(());
            });
            if rx.await.is_err() {
                error!("[TaskQueue] drain barrier lost; worker died");
                break;
            }
        }
        let mut state = self.inner.state.lock().expect("task queue poisoned");
        state.draining = false;
    }

    /// True when no task is queued or running.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock().expect("task queue poisoned");
        state.queue.is_empty() && !state.worker_scheduled
    }
}

impl QueueInner {
    async fn run_worker(inner: Arc<QueueInner>) {
        loop {
            let task = {
                let mut state = inner.state.lock().expect("task queue poisoned");
                match state.queue.pop_front() {
                    Some(task) => task,
                    None => {
                        state.worker_scheduled = false;
                        return;
                    }
                }
            };
            task.await;
        }
    }
}
