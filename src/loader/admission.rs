//! # Filtered runs.
//!
//! [`Loader::run_filtered`] asks the loader's filters before running:
//!
//! | decision   | effect                                                   |
//! |------------|----------------------------------------------------------|
//! | `Pass`     | [`Loader::run`]                                          |
//! | `Fail`     | admission `Failed`, loader finished (maybe dedupe signal)|
//! | `Session`  | admission `AwaitingSession`, re-checked when it fires    |
//! | `Retry(N)` | admission `AwaitingRetry`, re-checked after N            |
//!
//! Retries are bounded by the loader's filter-wait timeout; once it elapses
//! the admission is `TimedOut` and the loader finishes.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::EventKind;
use crate::filters::{FilterState, evaluate};

use super::loader::{Loader, Stage};
use super::state::LoaderState;
use super::timeout::Timeout;

/// Outcome of filter admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Admission {
    /// Filters were not consulted for the current cycle.
    #[default]
    NotChecked,
    /// Filters passed; the loader ran.
    Passed,
    /// Filters failed.
    Failed,
    /// Waiting for a session trigger.
    AwaitingSession,
    /// Waiting to ask the filters again.
    AwaitingRetry,
    /// Retries exceeded the filter-wait timeout.
    TimedOut,
}

impl Admission {
    /// Returns a short stable label (snake_case).
    pub fn as_label(self) -> &'static str {
        match self {
            Admission::NotChecked => "not_checked",
            Admission::Passed => "passed",
            Admission::Failed => "filters_failed",
            Admission::AwaitingSession => "awaiting_session",
            Admission::AwaitingRetry => "awaiting_retry",
            Admission::TimedOut => "filters_timed_out",
        }
    }

    /// Returns `true` while admission is still undecided.
    pub fn is_waiting(self) -> bool {
        matches!(self, Admission::AwaitingSession | Admission::AwaitingRetry)
    }
}

impl Loader {
    /// Evaluates the loader's filters and runs it if they pass.
    ///
    /// Returns `false` when the loader is already running or waiting on its
    /// filters, or is `no_multiple_load` and already ran.
    pub fn run_filtered(&self) -> bool {
        let (cycle, stale) = {
            let mut rt = self.lock();
            let stale = match rt.stage {
                Stage::Idle => Vec::new(),
                Stage::Finished if self.spec.no_multiple_load && rt.run > 0 => return false,
                Stage::Finished => rt.clear_transient(),
                _ => return false,
            };
            rt.stage = Stage::Admitting;
            rt.filter_started = Some(Instant::now());
            (rt.generation, stale)
        };
        for handle in stale {
            handle.cancel();
        }
        self.admit(cycle);
        true
    }

    fn admit(&self, cycle: u64) {
        let Some((cancelled, started, run)) = self
            .with_current(cycle, |rt| {
                (rt.stage == Stage::Admitting).then_some((rt.cancelled, rt.filter_started, rt.run))
            })
            .flatten()
        else {
            return;
        };
        if cancelled {
            self.finish_cancelled(cycle);
            return;
        }

        let decision = match self.guard("filters", || {
            evaluate(&self.spec.filters, &self.name, self.spec.dedupe)
        }) {
            Ok(decision) => decision,
            Err(err) => {
                self.fail(cycle, err, &[LoaderState::UnexpectedFail]);
                return;
            }
        };
        self.ctx.bus().publish(
            self.event(EventKind::FilterDecided, run)
                .with_decision(decision.state),
        );

        match decision.state {
            FilterState::Pass | FilterState::Disabled => {
                self.with_current(cycle, |rt| rt.admission = Admission::Passed);
                self.run();
            }
            FilterState::Fail => {
                let dedupe = decision.send_dedupe;
                self.with_current(cycle, |rt| {
                    rt.admission = Admission::Failed;
                    rt.dedupe_sent = dedupe;
                });
                if dedupe {
                    info!(loader = %self.name, "deduplicated signal replaces run");
                    self.ctx.bus().publish(self.event(EventKind::DedupeSignal, run));
                } else {
                    debug!(loader = %self.name, "filters failed");
                }
                self.finish(cycle, false);
            }
            FilterState::Session => {
                let subscribe = self
                    .with_current(cycle, |rt| {
                        rt.admission = Admission::AwaitingSession;
                        !std::mem::replace(&mut rt.session_waiting, true)
                    })
                    .unwrap_or(false);
                debug!(loader = %self.name, "awaiting session");
                if let (true, Some(filter)) = (subscribe, decision.session_filter) {
                    let me = self.me.clone();
                    filter.on_session(move || {
                        if let Some(loader) = me.upgrade() {
                            loader.schedule(cycle, Duration::ZERO, move |l| l.readmit(cycle));
                        }
                    });
                }
            }
            FilterState::Retry(delay) => {
                let elapsed = started.map(|t| t.elapsed()).unwrap_or_default();
                match self.spec.filter_timeout {
                    Timeout::Finite(limit) if elapsed >= limit => {
                        self.with_current(cycle, |rt| rt.admission = Admission::TimedOut);
                        warn!(loader = %self.name, timeout = %self.spec.filter_timeout, "filters kept retrying past the filter timeout");
                        self.ctx.bus().publish(
                            self.event(EventKind::FilterTimeout, run)
                                .with_timeout(limit),
                        );
                        self.finish(cycle, false);
                    }
                    limit => {
                        let wait = limit
                            .as_duration()
                            .map_or(delay, |limit| delay.min(limit.saturating_sub(elapsed)));
                        self.with_current(cycle, |rt| rt.admission = Admission::AwaitingRetry);
                        debug!(loader = %self.name, retry_ms = wait.as_millis() as u64, "filters asked to retry");
                        self.schedule(cycle, wait, move |l| l.admit(cycle));
                    }
                }
            }
        }
    }

    fn readmit(&self, cycle: u64) {
        if self
            .with_current(cycle, |rt| rt.session_waiting = false)
            .is_some()
        {
            self.admit(cycle);
        }
    }
}
