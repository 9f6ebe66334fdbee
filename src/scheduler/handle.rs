//! # Cancellable handle to a scheduled callback.
//!
//! Every call to [`Scheduler::schedule`](crate::Scheduler::schedule) returns a
//! [`TaskHandle`]. Dropping the handle does **not** cancel the task; call
//! [`TaskHandle::cancel`] to remove it from the pending list.

use std::fmt;
use std::sync::Weak;

use super::scheduler::Shared;

/// Identifier of a scheduled task, unique within one [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Handle to a pending scheduled callback.
///
/// Holds a weak reference to the scheduler: a handle never keeps the
/// scheduler (and its pending callbacks) alive.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    shared: Weak<Shared>,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, shared: Weak<Shared>) -> Self {
        Self { id, shared }
    }

    /// Returns the task id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Removes the task from the pending list.
    ///
    /// Returns `true` if the task was still pending, `false` if it already ran,
    /// was cancelled before, or the scheduler is gone.
    pub fn cancel(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.cancel(self.id),
            None => false,
        }
    }

    /// Returns `true` while the task is waiting in the pending list.
    pub fn is_pending(&self) -> bool {
        self.shared
            .upgrade()
            .map(|shared| shared.is_pending(self.id))
            .unwrap_or(false)
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}
