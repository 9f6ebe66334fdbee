//! # Cooperative delay multiplexer.
//!
//! Every delayed callback in the engine is registered here as
//! `{id, due, callback}` instead of owning its own host timer. A single
//! polling loop, alive only while the pending list is non-empty, sweeps due
//! callbacks.
//!
//! ## Architecture
//! ```text
//! schedule(delay, f) ──► pending list ◄── cancel(handle)
//!        │                    │
//!        └─► (loop idle?) ──► spawn drive()
//!                             │
//!                    loop {   ▼
//!                      sleep(rate)           rate = base_rate, or
//!                      tick(now)             max(min_delay / 2, fastest_rate)
//!                        ├─► take due tasks, order by (due, id)
//!                        ├─► run each (panics caught, sweep continues)
//!                        └─► pending empty? → stop, reset rate
//!                    }
//! ```
//!
//! ## Rules
//! - Ties in due time run in registration order.
//! - Callbacks registered during a sweep run in a later sweep, never the current one.
//! - No lock is held while a callback runs; callbacks may schedule or cancel freely.
//! - Without a tokio runtime the loop is not spawned; drive with [`Scheduler::tick`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::SchedulerConfig;
use super::handle::{TaskHandle, TaskId};
use crate::error::panic_message;

/// Due-time stand-in for delays past what [`Instant`] can represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Boxed one-shot callback owned by the pending list.
pub(crate) type Callback = Box<dyn FnOnce() + Send + 'static>;

/// A callback waiting for its due time.
struct ScheduledTask {
    id: TaskId,
    due: Instant,
    callback: Callback,
}

struct State {
    pending: Vec<ScheduledTask>,
    next_id: u64,
    rate: Duration,
    loop_active: bool,
}

/// State shared between scheduler clones, handles and the polling loop.
pub(crate) struct Shared {
    cfg: SchedulerConfig,
    state: Mutex<State>,
    shutdown: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn cancel(&self, id: TaskId) -> bool {
        let mut st = self.lock();
        let before = st.pending.len();
        st.pending.retain(|t| t.id != id);
        st.pending.len() != before
    }

    pub(crate) fn is_pending(&self, id: TaskId) -> bool {
        self.lock().pending.iter().any(|t| t.id == id)
    }

    fn tick(&self, now: Instant) -> usize {
        let mut due: Vec<ScheduledTask> = {
            let mut st = self.lock();
            let (ready, rest) = std::mem::take(&mut st.pending)
                .into_iter()
                .partition(|t| t.due <= now);
            st.pending = rest;
            ready
        };
        due.sort_by_key(|t| (t.due, t.id));

        let ran = due.len();
        for task in due {
            let id = task.id;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(task.callback)) {
                warn!(task = %id, panic = %panic_message(&*panic), "scheduled callback panicked");
            }
        }
        ran
    }
}

/// Cooperative scheduler: one polling loop for every delayed callback.
///
/// Cheap to clone; clones share the pending list and the loop.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Creates a new scheduler. The polling loop starts lazily on the first
    /// [`schedule`](Self::schedule).
    pub fn new(cfg: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    pending: Vec::new(),
                    next_id: 1,
                    rate: cfg.base_rate_clamped(),
                    loop_active: false,
                }),
                cfg,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.cfg
    }

    /// Registers `f` to run once `delay` has elapsed.
    ///
    /// Returns a [`TaskHandle`] that can remove the callback before it runs.
    /// After [`shutdown`](Self::shutdown) the callback is dropped unrun.
    /// A delay too large for the clock is clamped to roughly thirty years.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let now = Instant::now();
        let due = now.checked_add(delay).unwrap_or(now + FAR_FUTURE);
        let (handle, start_loop) = {
            let mut st = self.shared.lock();
            let id = TaskId(st.next_id);
            st.next_id += 1;
            let handle = TaskHandle::new(id, Arc::downgrade(&self.shared));

            if self.shared.shutdown.is_cancelled() {
                return handle;
            }
            st.pending.push(ScheduledTask {
                id,
                due,
                callback: Box::new(f),
            });

            if self.shared.cfg.dynamic {
                let candidate = (delay / 2).max(self.shared.cfg.fastest_rate_clamped());
                if candidate < st.rate {
                    st.rate = candidate;
                }
            }

            let start_loop = !st.loop_active;
            st.loop_active = true;
            (handle, start_loop)
        };

        if start_loop {
            self.spawn_loop();
        }
        handle
    }

    /// Runs every pending callback whose due time has passed.
    ///
    /// Called by the polling loop on each wake. Hosts without a tokio runtime
    /// call it themselves. Returns the number of callbacks executed.
    pub fn tick(&self) -> usize {
        self.shared.tick(Instant::now())
    }

    /// Returns the current wake-up interval of the polling loop.
    pub fn current_rate(&self) -> Duration {
        self.shared.lock().rate
    }

    /// Returns the number of callbacks waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Returns `true` while the polling loop is alive.
    pub fn is_polling(&self) -> bool {
        self.shared.lock().loop_active
    }

    /// Stops the polling loop and drops every pending callback.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let dropped = std::mem::take(&mut self.shared.lock().pending);
        debug!(dropped = dropped.len(), "scheduler shut down");
    }

    fn spawn_loop(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(drive(Arc::clone(&self.shared)));
            }
            Err(_) => {
                self.shared.lock().loop_active = false;
                debug!("no tokio runtime; scheduler is driven by tick()");
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

/// The polling loop. Exits (releasing its timer) once nothing is pending.
async fn drive(shared: Arc<Shared>) {
    loop {
        let rate = {
            let mut st = shared.lock();
            if st.pending.is_empty() || shared.shutdown.is_cancelled() {
                st.loop_active = false;
                st.rate = shared.cfg.base_rate_clamped();
                return;
            }
            st.rate
        };

        tokio::select! {
            _ = time::sleep(rate) => {}
            _ = shared.shutdown.cancelled() => {
                shared.lock().loop_active = false;
                return;
            }
        }
        shared.tick(Instant::now());
    }
}
