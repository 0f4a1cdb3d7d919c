//! Write fence: a barrier that delays a method's acknowledgment until
//! every observer affected by the method's writes has flushed.
//!
//! Lifecycle: created → `begin_write`* → `arm` → (outstanding hits zero)
//! before-fire callbacks run under a +1 shim → fired → completion
//! callbacks run → `retire`. A scoped "current fence" travels with the
//! task that runs a method handler; write sites and crossbar listeners
//! read it synchronously and must capture it locally before suspending.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::warn;

use crate::FenceError;
use crate::Result;

type FenceCallback = Box<dyn FnOnce(&WriteFence) + Send>;

tokio::task_local! {
    static CURRENT_FENCE: WriteFence;
}

#[derive(Clone)]
pub struct WriteFence {
    inner: Arc<FenceInner>,
}

struct FenceInner {
    state: Mutex<FenceState>,
}

struct FenceState {
    armed: bool,
    fired: bool,
    retired: bool,
    /// True while before-fire callbacks run; blocks reentrant firing.
    firing: bool,
    outstanding: usize,
    before_fire: Vec<FenceCallback>,
    on_committed: Vec<FenceCallback>,
}

/// One-shot commit capability returned by [`WriteFence::begin_write`].
///
/// Committing consumes the capability, so a double commit is
/// unrepresentable. Dropping without committing releases the write too,
/// with a warning: a lost write must not block the fence forever.
pub struct FenceWrite {
    fence: Option<WriteFence>,
}

impl FenceWrite {
    /// Mark this write committed.
    pub fn committed(mut self) {
        if let Some(fence) = self.fence.take() {
            fence.write_committed();
        }
    }

    /// A pre-committed shim, handed out by retired fences.
    fn committed_shim() -> Self {
        Self {
            fence: None,
        }
    }
}

impl Drop for FenceWrite {
    fn drop(&mut self) {
        if let Some(fence) = self.fence.take() {
            warn!("[WriteFence] write dropped without commit; releasing it");
            fence.write_committed();
        }
    }
}

impl Default for WriteFence {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteFence {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FenceInner {
                state: Mutex::new(FenceState {
                    armed: false,
                    fired: false,
                    retired: false,
                    firing: false,
                    outstanding: 0,
                    before_fire: Vec::new(),
                    on_committed: Vec::new(),
                }),
            }),
        }
    }

    /// The fence scoped to the current task, if any.
    pub fn current() -> Option<WriteFence> {
        CURRENT_FENCE.try_with(WriteFence::clone).ok()
    }

    /// Run `fut` with this fence as the scoped current fence. The
    /// previous scope (if the scopes nest) is restored on every exit
    /// path.
    pub async fn scope<F>(
        fence: WriteFence,
        fut: F,
    ) -> F::Output
    where
        F: Future,
    {
        CURRENT_FENCE.scope(fence, fut).await
    }

    fn same_fence(
        &self,
        other: &WriteFence,
    ) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register a write. The returned capability must be committed (or
    /// dropped) for the fence to ever fire.
    pub fn begin_write(&self) -> Result<FenceWrite> {
        let mut state = self.inner.state.lock().expect("fence poisoned");
        if state.retired {
            return Ok(FenceWrite::committed_shim());
        }
        if state.fired {
            return Err(FenceError::WriteAfterFire.into());
        }
        state.outstanding += 1;
        drop(state);
        Ok(FenceWrite {
            fence: Some(self.clone()),
        })
    }

    /// Register a callback to run after the fence becomes armed but
    /// before it fires; the callback may `begin_write` to delay firing.
    pub fn on_before_fire<F>(
        &self,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(&WriteFence) + Send + 'static,
    {
        let mut state = self.inner.state.lock().expect("fence poisoned");
        if state.fired {
            return Err(FenceError::CallbackAfterFire.into());
        }
        state.before_fire.push(Box::new(callback));
        Ok(())
    }

    /// Register a callback to run once every write has committed after
    /// arming.
    pub fn on_all_committed<F>(
        &self,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(&WriteFence) + Send + 'static,
    {
        let mut state = self.inner.state.lock().expect("fence poisoned");
        if state.fired && state.outstanding == 0 {
            return Err(FenceError::CallbackAfterFire.into());
        }
        state.on_committed.push(Box::new(callback));
        Ok(())
    }

    /// Arm the fence: it fires as soon as no writes are outstanding
    /// (immediately, when there are none).
    ///
    /// Arming the scoped current fence is illegal: the method that owns
    /// the scope is still running and may produce more writes.
    pub fn arm(&self) -> Result<()> {
        if let Some(current) = Self::current() {
            if self.same_fence(&current) {
                return Err(FenceError::ArmCurrentFence.into());
            }
        }
        {
            let mut state = self.inner.state.lock().expect("fence poisoned");
            state.armed = true;
        }
        self.maybe_fire();
        Ok(())
    }

    /// Arm and wait until all writes have committed.
    pub async fn arm_and_wait(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.on_all_committed(move |_| {
            let _ = tx.send(());
        })?;
        self.arm()?;
        let _ = rx.await;
        Ok(())
    }

    /// After firing, convert subsequent `begin_write` calls into
    /// committed no-ops. Legal only once fired.
    pub fn retire(&self) -> Result<()> {
        let mut state = self.inner.state.lock().expect("fence poisoned");
        if !state.fired {
            return Err(FenceError::RetireBeforeFire.into());
        }
        state.retired = true;
        Ok(())
    }

    pub fn has_fired(&self) -> bool {
        self.inner.state.lock().expect("fence poisoned").fired
    }

    pub fn outstanding_writes(&self) -> usize {
        self.inner.state.lock().expect("fence poisoned").outstanding
    }

    fn write_committed(&self) {
        let completions = {
            let mut state = self.inner.state.lock().expect("fence poisoned");
            debug_assert!(state.outstanding > 0, "commit without matching begin_write");
            state.outstanding = state.outstanding.saturating_sub(1);
            if state.fired && state.outstanding == 0 {
                Some(std::mem::take(&mut state.on_committed))
            } else {
                None
            }
        };
        match completions {
            Some(callbacks) => self.run_callbacks(callbacks),
            None => self.maybe_fire(),
        }
    }

    /// Fire if armed with nothing outstanding. Before-fire callbacks run
    /// under a +1 shim so their own `begin_write` calls cannot race a
    /// premature completion.
    fn maybe_fire(&self) {
        let before = {
            let mut state = self.inner.state.lock().expect("fence poisoned");
            if !state.armed || state.fired || state.firing || state.outstanding != 0 {
                return;
            }
            state.firing = true;
            state.outstanding += 1;
            std::mem::take(&mut state.before_fire)
        };
        self.run_callbacks(before);
        let completions = {
            let mut state = self.inner.state.lock().expect("fence poisoned");
            state.firing = false;
            state.fired = true;
            state.outstanding -= 1;
            if state.outstanding == 0 {
                Some(std::mem::take(&mut state.on_committed))
            } else {
                None
            }
        };
        if let Some(callbacks) = completions {
            self.run_callbacks(callbacks);
        }
    }

    fn run_callbacks(
        &self,
        callbacks: Vec<FenceCallback>,
    ) {
        for callback in callbacks {
            callback(self);
        }
    }
}

impl std::fmt::Debug for WriteFence {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let state = self.inner.state.lock().expect("fence poisoned");
        f.debug_struct("WriteFence")
            .field("armed", &state.armed)
            .field("fired", &state.fired)
            .field("retired", &state.retired)
            .field("outstanding", &state.outstanding)
            .finish()
    }
}
