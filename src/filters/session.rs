//! # Deferred session admission.
//!
//! A session-capable filter may carry a starter: user code that begins some
//! one-time external process (a consent prompt, a remote lookup) and fires a
//! [`SessionTrigger`] when it is done.
//!
//! ## Rules
//! - The starter runs at most once per filter instance until `reset()`.
//! - Loaders that hit the session while it is pending queue as waiters.
//! - Firing the trigger establishes the session and releases every waiter.
//! - A trigger from before a `reset()` is ignored.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::warn;

use crate::error::panic_message;

/// User code that begins a deferred session.
pub type SessionStarter = Arc<dyn Fn(SessionTrigger) + Send + Sync>;

type Waiter = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct SessionInner {
    started: bool,
    established: bool,
    generation: u64,
    waiters: Vec<Waiter>,
}

/// Session bookkeeping of one filter.
#[derive(Default)]
pub(crate) struct SessionCell {
    inner: Mutex<SessionInner>,
}

impl SessionCell {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Invokes `starter` unless the session was already started or established.
    ///
    /// Returns `true` when this call invoked the starter.
    pub(crate) fn start(self: &Arc<Self>, filter: &str, starter: &SessionStarter) -> bool {
        let generation = {
            let mut inner = self.lock();
            if inner.started || inner.established {
                return false;
            }
            inner.started = true;
            inner.generation
        };

        let trigger = SessionTrigger {
            cell: Arc::downgrade(self),
            generation,
        };
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| starter(trigger))) {
            warn!(filter, panic = %panic_message(&*panic), "session starter panicked");
        }
        true
    }

    /// Queues `waiter` until the session is established, or runs it now if
    /// it already is.
    pub(crate) fn wait(&self, waiter: Waiter) {
        let ready = {
            let mut inner = self.lock();
            if inner.established {
                Some(waiter)
            } else {
                inner.waiters.push(waiter);
                None
            }
        };
        if let Some(waiter) = ready {
            waiter();
        }
    }

    pub(crate) fn is_established(&self) -> bool {
        self.lock().established
    }

    pub(crate) fn is_started(&self) -> bool {
        self.lock().started
    }

    pub(crate) fn pending_waiters(&self) -> usize {
        self.lock().waiters.len()
    }

    pub(crate) fn reset(&self) {
        let mut inner = self.lock();
        inner.started = false;
        inner.established = false;
        inner.generation += 1;
        inner.waiters.clear();
    }

    fn establish(&self, generation: u64) {
        let waiters = {
            let mut inner = self.lock();
            if inner.generation != generation || inner.established {
                return;
            }
            inner.established = true;
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            waiter();
        }
    }
}

/// One-shot handle the starter fires once its session is established.
pub struct SessionTrigger {
    cell: Weak<SessionCell>,
    generation: u64,
}

impl SessionTrigger {
    /// Establishes the session and releases every queued loader.
    pub fn fire(self) {
        if let Some(cell) = self.cell.upgrade() {
            cell.establish(self.generation);
        }
    }
}

impl fmt::Debug for SessionTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTrigger")
            .field("generation", &self.generation)
            .finish()
    }
}
