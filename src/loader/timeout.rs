//! # Timeout budgets and their cascade.
//!
//! A loader waits for its dependencies within its *effective* timeout: its own
//! budget plus the largest effective timeout among its dependencies.
//!
//! ```text
//! effective(L) = own(L) + max(effective(D) for D in deps(L))
//! ```
//!
//! ## Rules
//! - `Infinite` anywhere on the way short-circuits to `Infinite`.
//! - A loader already on the current path contributes zero, so cycles terminate.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::loader::{Loader, LoaderId};

/// Timeout budget of a loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeout {
    /// Give up after the duration.
    Finite(Duration),
    /// Never time out.
    Infinite,
}

impl Timeout {
    /// Shorthand for a finite budget in milliseconds.
    pub const fn millis(ms: u64) -> Self {
        Timeout::Finite(Duration::from_millis(ms))
    }

    /// Returns `true` for [`Timeout::Infinite`].
    pub fn is_infinite(self) -> bool {
        matches!(self, Timeout::Infinite)
    }

    /// Returns the duration of a finite budget.
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            Timeout::Finite(d) => Some(d),
            Timeout::Infinite => None,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::Finite(d)
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeout::Finite(d) => write!(f, "{}ms", d.as_millis()),
            Timeout::Infinite => f.write_str("infinite"),
        }
    }
}

/// Computes the effective timeout of `loader`.
pub(crate) fn cascade(loader: &Loader) -> Timeout {
    let mut path = HashSet::new();
    walk(loader, &mut path)
}

fn walk(loader: &Loader, path: &mut HashSet<LoaderId>) -> Timeout {
    if !path.insert(loader.id()) {
        return Timeout::Finite(Duration::ZERO);
    }

    let own = match loader.own_timeout() {
        Timeout::Finite(d) => d,
        Timeout::Infinite => {
            path.remove(&loader.id());
            return Timeout::Infinite;
        }
    };

    let deps: Vec<Arc<Loader>> = loader.dependencies();
    let mut widest = Duration::ZERO;
    for dep in &deps {
        match walk(dep, path) {
            Timeout::Finite(d) => widest = widest.max(d),
            Timeout::Infinite => {
                path.remove(&loader.id());
                return Timeout::Infinite;
            }
        }
    }

    path.remove(&loader.id());
    Timeout::Finite(own.saturating_add(widest))
}
