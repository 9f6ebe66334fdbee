//! # Throttle primitives built on the scheduler.
//!
//! Two disciplines share one [`ThrottleLock`] shape:
//!
//! - **Lossy** ([`Scheduler::run_at_most_once`]): a call inside the window is
//!   dropped. Nothing guarantees the function ever runs again.
//! - **Coalescing** ([`Scheduler::run_if_not_scheduled`]): run now if the
//!   window has elapsed; otherwise schedule exactly one deferred run at the
//!   window boundary and fold every further call into it.
//!
//! ```text
//! coalescing, window = 100ms
//!   t=0    call ──► RanNow
//!   t=5    call ──► Scheduled (runs at t=100)
//!   t=10   call ──► Coalesced
//!   t=100  deferred run
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use super::handle::TaskHandle;
use super::scheduler::Scheduler;

/// Outcome of a throttled call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttled {
    /// The function ran synchronously.
    RanNow,
    /// A deferred run was scheduled at the window boundary.
    Scheduled,
    /// A deferred run was already pending; this call was folded into it.
    Coalesced,
    /// The call fell inside the window and was dropped: always for the lossy
    /// throttle, and for the coalescing one once the scheduler is shut down.
    Dropped,
}

#[derive(Default)]
struct ThrottleState {
    last_run: Option<Instant>,
    scheduled: Option<TaskHandle>,
}

/// Shared bookkeeping for one throttled function.
#[derive(Default)]
pub struct ThrottleLock {
    state: Mutex<ThrottleState>,
}

impl ThrottleLock {
    /// Creates an unused lock.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns when the function last ran through this lock.
    pub fn last_run(&self) -> Option<Instant> {
        self.lock().last_run
    }

    /// Returns `true` while a deferred run is pending.
    pub fn is_scheduled(&self) -> bool {
        self.lock().scheduled.as_ref().is_some_and(TaskHandle::is_pending)
    }

    /// Cancels a pending deferred run, if any.
    pub fn cancel(&self) -> bool {
        match self.lock().scheduled.take() {
            Some(handle) => handle.cancel(),
            None => false,
        }
    }
}

impl Scheduler {
    /// Runs `f` unless it already ran through `lock` within `window`.
    pub fn run_at_most_once<F>(&self, lock: &ThrottleLock, window: Duration, f: F) -> Throttled
    where
        F: FnOnce(),
    {
        let now = Instant::now();
        {
            let mut st = lock.lock();
            if let Some(last) = st.last_run {
                if now.duration_since(last) < window {
                    return Throttled::Dropped;
                }
            }
            st.last_run = Some(now);
        }
        f();
        Throttled::RanNow
    }

    /// Runs `f` now, or exactly once at the end of the current window.
    ///
    /// Calls made while a deferred run is pending are coalesced into it and
    /// `f` is dropped unrun.
    pub fn run_if_not_scheduled<F>(
        &self,
        lock: &Arc<ThrottleLock>,
        window: Duration,
        f: F,
    ) -> Throttled
    where
        F: FnOnce() + Send + 'static,
    {
        let now = Instant::now();
        let mut st = lock.lock();
        match st.scheduled.as_ref() {
            Some(handle) if handle.is_pending() => return Throttled::Coalesced,
            // Dropped by a scheduler shutdown.
            Some(_) => st.scheduled = None,
            None => {}
        }

        let elapsed = st.last_run.map(|last| now.duration_since(last));
        match elapsed {
            Some(elapsed) if elapsed < window => {
                let owner = Arc::clone(lock);
                let handle = self.schedule(window - elapsed, move || {
                    {
                        let mut st = owner.lock();
                        st.scheduled = None;
                        st.last_run = Some(Instant::now());
                    }
                    f();
                });
                if !handle.is_pending() {
                    return Throttled::Dropped;
                }
                st.scheduled = Some(handle);
                Throttled::Scheduled
            }
            _ => {
                st.last_run = Some(now);
                drop(st);
                f();
                Throttled::RanNow
            }
        }
    }
}
