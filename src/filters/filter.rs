//! # Admission filter.
//!
//! A [`Filter`] is one admission predicate: a match function deciding whether
//! it applies to a loader, and a state function answering with a
//! [`FilterState`]. Filters are built by value and shared as `Arc<Filter>`:
//!
//! ```rust
//! use std::sync::Arc;
//! use tagvisor::{Filter, FilterState};
//!
//! let only_checkout = Arc::new(
//!     Filter::new("checkout-only", |_| FilterState::Pass)
//!         .with_order(10)
//!         .matching(|loader| loader.starts_with("checkout")),
//! );
//!
//! assert!(only_checkout.matches("checkout-pixel"));
//! assert!(!only_checkout.matches("banner"));
//! assert_eq!(only_checkout.state("checkout-pixel"), FilterState::Pass);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::session::{SessionCell, SessionStarter, SessionTrigger};
use super::state::FilterState;

/// Predicate deciding whether a filter applies to a loader (by name).
pub type MatchFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Function answering the filter state for a loader (by name).
pub type StateFn = Arc<dyn Fn(&str) -> FilterState + Send + Sync>;

/// Whether a filter's answer is taken as is or inverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Polarity {
    /// The answer is the decision.
    #[default]
    Include,
    /// `Pass` and `Fail` swap; every other answer passes through.
    Exclude,
}

/// One admission predicate.
pub struct Filter {
    name: String,
    order: i32,
    polarity: Polarity,
    disabled: AtomicBool,
    matcher: MatchFn,
    state_fn: StateFn,
    session_capable: bool,
    starter: Option<SessionStarter>,
    session: Arc<SessionCell>,
    last_state: Mutex<Option<FilterState>>,
}

impl Filter {
    /// Creates an include filter with order 0 that matches every loader.
    pub fn new<F>(name: impl Into<String>, state: F) -> Self
    where
        F: Fn(&str) -> FilterState + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            order: 0,
            polarity: Polarity::Include,
            disabled: AtomicBool::new(false),
            matcher: Arc::new(|_| true),
            state_fn: Arc::new(state),
            session_capable: false,
            starter: None,
            session: Arc::new(SessionCell::default()),
            last_state: Mutex::new(None),
        }
    }

    /// Creates a filter that always answers `state`.
    pub fn constant(name: impl Into<String>, state: FilterState) -> Self {
        Self::new(name, move |_| state)
    }

    /// Sets the priority. Higher orders take effect first.
    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Inverts `Pass`/`Fail` answers.
    pub fn exclude(mut self) -> Self {
        self.polarity = Polarity::Exclude;
        self
    }

    /// Sets the polarity explicitly.
    pub fn with_polarity(mut self, polarity: Polarity) -> Self {
        self.polarity = polarity;
        self
    }

    /// Restricts the filter to loaders accepted by `f`.
    pub fn matching<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.matcher = Arc::new(f);
        self
    }

    /// Marks the filter as session-capable without a starter.
    pub fn session(mut self) -> Self {
        self.session_capable = true;
        self
    }

    /// Attaches a session starter; the filter becomes session-capable.
    ///
    /// The starter receives a [`SessionTrigger`] to fire once the session is
    /// established.
    pub fn with_session_starter<F>(mut self, starter: F) -> Self
    where
        F: Fn(SessionTrigger) + Send + Sync + 'static,
    {
        self.session_capable = true;
        self.starter = Some(Arc::new(starter));
        self
    }

    /// Starts the filter disabled.
    pub fn disabled(self) -> Self {
        self.disabled.store(true, Ordering::Relaxed);
        self
    }

    /// Returns the filter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the priority.
    pub fn order(&self) -> i32 {
        self.order
    }

    /// Returns the polarity.
    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    /// Returns `true` when the filter can defer admission to a session.
    pub fn is_session_capable(&self) -> bool {
        self.session_capable
    }

    /// Enables or disables the filter at runtime.
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    /// Returns `true` while the filter is disabled.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Returns `true` when the filter applies to `loader`.
    pub fn matches(&self, loader: &str) -> bool {
        (self.matcher)(loader)
    }

    /// Answers the filter state for `loader` and records it.
    ///
    /// A disabled filter answers `Disabled`. Once a session is established
    /// the filter answers `Pass` wherever its state function said `Session`.
    pub fn state(&self, loader: &str) -> FilterState {
        let state = if self.is_disabled() {
            FilterState::Disabled
        } else {
            match (self.state_fn)(loader) {
                FilterState::Session if self.session.is_established() => FilterState::Pass,
                other => other,
            }
        };
        *self
            .last_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(state);
        state
    }

    /// Returns the most recent answer, if any.
    pub fn last_state(&self) -> Option<FilterState> {
        *self.last_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clears the last answer and the session state.
    pub fn reset(&self) {
        *self
            .last_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.session.reset();
    }

    /// Invokes the session starter unless it already ran.
    ///
    /// Returns `true` when this call invoked the starter.
    pub fn start_session(&self) -> bool {
        match &self.starter {
            Some(starter) => self.session.start(&self.name, starter),
            None => false,
        }
    }

    /// Returns `true` once the starter has been invoked.
    pub fn is_session_started(&self) -> bool {
        self.session.is_started()
    }

    /// Returns `true` once the session trigger fired.
    pub fn is_session_established(&self) -> bool {
        self.session.is_established()
    }

    /// Runs `f` once the session is established (immediately if it already is).
    pub fn on_session<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.session.wait(Box::new(f));
    }

    /// Returns how many callbacks are queued on the session.
    pub fn session_waiters(&self) -> usize {
        self.session.pending_waiters()
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("name", &self.name)
            .field("order", &self.order)
            .field("polarity", &self.polarity)
            .field("disabled", &self.is_disabled())
            .field("session_capable", &self.session_capable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_disabled_filter_answers_disabled() {
        let f = Filter::constant("f", FilterState::Pass).disabled();
        assert_eq!(f.state("x"), FilterState::Disabled);
        f.set_disabled(false);
        assert_eq!(f.state("x"), FilterState::Pass);
        assert_eq!(f.last_state(), Some(FilterState::Pass));
    }

    #[test]
    fn test_established_session_reports_pass() {
        let trigger: Arc<Mutex<Option<SessionTrigger>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&trigger);
        let f = Filter::constant("consent", FilterState::Session)
            .with_session_starter(move |t| *slot.lock().unwrap() = Some(t));

        assert_eq!(f.state("x"), FilterState::Session);
        assert!(f.start_session());
        assert!(!f.start_session());

        let released = Arc::new(AtomicUsize::new(0));
        {
            let released = Arc::clone(&released);
            f.on_session(move || {
                released.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(f.session_waiters(), 1);

        trigger.lock().unwrap().take().unwrap().fire();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(f.state("x"), FilterState::Pass);
    }

    #[test]
    fn test_reset_ignores_stale_trigger() {
        let trigger: Arc<Mutex<Option<SessionTrigger>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&trigger);
        let f = Filter::constant("consent", FilterState::Session)
            .with_session_starter(move |t| *slot.lock().unwrap() = Some(t));

        f.start_session();
        f.reset();
        assert_eq!(f.last_state(), None);

        trigger.lock().unwrap().take().unwrap().fire();
        assert!(!f.is_session_established());
        assert!(f.start_session());
    }
}
