//! # Output-stream lock.
//!
//! The surface's synchronous output channel is a single shared resource: two
//! loaders writing to it at once interleave their output. [`OutputLock`] is the
//! token that serializes it. It lives in the [`Context`](crate::Context), so
//! independent contexts never contend.
//!
//! ## Rules
//! - First claimant wins; there is no queue and no pre-emption.
//! - Only the holder can release.
//! - Re-acquiring while already holding is a no-op success.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::loader::LoaderId;

/// Result of [`OutputLock::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    /// The caller now holds the lock.
    Granted,
    /// The caller already held the lock.
    AlreadyHeld,
    /// Another loader holds the lock.
    Busy {
        /// Name of the current holder.
        holder: Arc<str>,
    },
}

#[derive(Default)]
struct Slot {
    holder: Option<(LoaderId, Arc<str>)>,
    grants: u64,
}

/// Mutual-exclusion token for the shared output channel.
#[derive(Default)]
pub struct OutputLock {
    slot: Mutex<Slot>,
}

impl OutputLock {
    /// Creates a free lock.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims the lock for `id` if it is free.
    pub fn try_acquire(&self, id: LoaderId, name: &Arc<str>) -> Acquire {
        let mut slot = self.lock();
        match &slot.holder {
            Some((holder, _)) if *holder == id => Acquire::AlreadyHeld,
            Some((_, holder)) => Acquire::Busy {
                holder: Arc::clone(holder),
            },
            None => {
                slot.holder = Some((id, Arc::clone(name)));
                slot.grants += 1;
                Acquire::Granted
            }
        }
    }

    /// Releases the lock if `id` holds it. Returns `true` on release.
    pub fn release(&self, id: LoaderId) -> bool {
        let mut slot = self.lock();
        match slot.holder {
            Some((holder, _)) if holder == id => {
                slot.holder = None;
                true
            }
            _ => false,
        }
    }

    /// Returns the id of the current holder.
    pub fn holder(&self) -> Option<LoaderId> {
        self.lock().holder.as_ref().map(|(id, _)| *id)
    }

    /// Returns how many times the lock has been granted.
    pub fn grants(&self) -> u64 {
        self.lock().grants
    }
}
