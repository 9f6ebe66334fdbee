//! # Loader states and their history.
//!
//! A loader never forgets a phase it entered: [`StateHistory`] is an
//! append-only log of `(run, state)` pairs. The "current" state is simply the
//! last entry. Only an explicit [`Loader::reset`](crate::Loader::reset)
//! clears it.

use std::fmt;

/// Phase of a loader run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LoaderState {
    Initial,
    Started,
    LoadingDependencies,
    LoadedDependencies,
    LoadingUrl,
    LoadedUrl,
    Executed,
    ExecutedWithErrors,
    FailedToLoadDependencies,
    FailedToLoadUrl,
    FailedToExecute,
    TimedOut,
    UnexpectedFail,
    Cancelled,
}

impl LoaderState {
    /// Every state, in bit order.
    pub const ALL: [LoaderState; 14] = [
        LoaderState::Initial,
        LoaderState::Started,
        LoaderState::LoadingDependencies,
        LoaderState::LoadedDependencies,
        LoaderState::LoadingUrl,
        LoaderState::LoadedUrl,
        LoaderState::Executed,
        LoaderState::ExecutedWithErrors,
        LoaderState::FailedToLoadDependencies,
        LoaderState::FailedToLoadUrl,
        LoaderState::FailedToExecute,
        LoaderState::TimedOut,
        LoaderState::UnexpectedFail,
        LoaderState::Cancelled,
    ];

    /// Stable bit value used when folding a history into a mask.
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Returns a short stable label (snake_case).
    pub fn as_label(self) -> &'static str {
        match self {
            LoaderState::Initial => "initial",
            LoaderState::Started => "started",
            LoaderState::LoadingDependencies => "loading_dependencies",
            LoaderState::LoadedDependencies => "loaded_dependencies",
            LoaderState::LoadingUrl => "loading_url",
            LoaderState::LoadedUrl => "loaded_url",
            LoaderState::Executed => "executed",
            LoaderState::ExecutedWithErrors => "executed_with_errors",
            LoaderState::FailedToLoadDependencies => "failed_to_load_dependencies",
            LoaderState::FailedToLoadUrl => "failed_to_load_url",
            LoaderState::FailedToExecute => "failed_to_execute",
            LoaderState::TimedOut => "timed_out",
            LoaderState::UnexpectedFail => "unexpected_fail",
            LoaderState::Cancelled => "cancelled",
        }
    }

    /// Returns `true` for states that mark a failed run.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            LoaderState::ExecutedWithErrors
                | LoaderState::FailedToLoadDependencies
                | LoaderState::FailedToLoadUrl
                | LoaderState::FailedToExecute
                | LoaderState::TimedOut
                | LoaderState::UnexpectedFail
        )
    }
}

impl fmt::Display for LoaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Append-only log of entered states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateHistory {
    entries: Vec<(u32, LoaderState)>,
}

impl StateHistory {
    /// Creates a history holding only `Initial` at run 0.
    pub fn new() -> Self {
        Self {
            entries: vec![(0, LoaderState::Initial)],
        }
    }

    /// Records `state` as entered during `run`.
    ///
    /// Entering the same state twice in one run is recorded once.
    pub fn enter(&mut self, run: u32, state: LoaderState) {
        if !self.has_in_run(state, run) {
            self.entries.push((run, state));
        }
    }

    /// Returns `true` if `state` was entered at any point.
    pub fn has(&self, state: LoaderState) -> bool {
        self.entries.iter().any(|(_, s)| *s == state)
    }

    /// Returns `true` if `state` was entered during `run`.
    pub fn has_in_run(&self, state: LoaderState, run: u32) -> bool {
        self.entries.iter().any(|(r, s)| *r == run && *s == state)
    }

    /// Returns the most recently entered state.
    pub fn current(&self) -> LoaderState {
        self.entries
            .last()
            .map(|(_, s)| *s)
            .unwrap_or(LoaderState::Initial)
    }

    /// Folds every entered state into a bitmask.
    pub fn bits(&self) -> u32 {
        self.entries.iter().fold(0, |acc, (_, s)| acc | s.bit())
    }

    /// Folds the states entered during `run` into a bitmask.
    pub fn bits_in_run(&self, run: u32) -> u32 {
        self.entries
            .iter()
            .filter(|(r, _)| *r == run)
            .fold(0, |acc, (_, s)| acc | s.bit())
    }

    /// Returns the raw `(run, state)` log.
    pub fn entries(&self) -> &[(u32, LoaderState)] {
        &self.entries
    }

    /// Forgets everything except a fresh `Initial` entry at `run`.
    pub fn clear(&mut self, run: u32) {
        self.entries.clear();
        self.entries.push((run, LoaderState::Initial));
    }
}

impl Default for StateHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_monotonic() {
        let mut h = StateHistory::new();
        h.enter(1, LoaderState::Started);
        h.enter(1, LoaderState::TimedOut);
        h.enter(1, LoaderState::Executed);
        h.enter(2, LoaderState::Started);

        assert!(h.has(LoaderState::TimedOut));
        assert!(h.has_in_run(LoaderState::Executed, 1));
        assert!(!h.has_in_run(LoaderState::Executed, 2));
        assert_eq!(h.current(), LoaderState::Started);
        assert_eq!(
            h.bits(),
            LoaderState::Initial.bit()
                | LoaderState::Started.bit()
                | LoaderState::TimedOut.bit()
                | LoaderState::Executed.bit()
        );
        assert_eq!(h.bits_in_run(2), LoaderState::Started.bit());
    }

    #[test]
    fn test_bits_are_distinct() {
        let mask = LoaderState::ALL.iter().fold(0u32, |acc, s| {
            assert_eq!(acc & s.bit(), 0, "{s} overlaps");
            acc | s.bit()
        });
        assert_eq!(mask.count_ones(), 14);
    }

    #[test]
    fn test_clear_keeps_fresh_initial() {
        let mut h = StateHistory::new();
        h.enter(1, LoaderState::Cancelled);
        h.clear(1);
        assert!(!h.has(LoaderState::Cancelled));
        assert_eq!(h.current(), LoaderState::Initial);
    }
}
