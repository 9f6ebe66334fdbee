//! Dependency phase: event-driven for loader dependencies, polled for the rest.
//!
//! ```text
//! step(cycle)
//!   ├─ cancelled?                ─► Cancelled
//!   ├─ loader deps unfinished    ─► one success listener per dep, re-armed after it fires
//!   ├─ readiness / predicates / tokens pending ─► step again after dependency_poll
//!   └─ nothing pending           ─► LoadedDependencies ─► output lock
//!
//! deadline(cycle)                   (armed once, at the effective timeout)
//!   ├─ TimedOut
//!   ├─ defaults substituted for unresolved tokens
//!   └─ still pending? ─► FailedToLoadDependencies : LoadedDependencies
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::LoaderError;
use crate::events::EventKind;

use super::loader::{Loader, Stage};
use super::state::LoaderState;
use super::timeout::Timeout;

impl Loader {
    pub(super) fn begin_waiting(&self, cycle: u64, effective: Timeout) {
        if self
            .with_current(cycle, |rt| rt.enter(LoaderState::LoadingDependencies))
            .is_none()
        {
            return;
        }
        if let Timeout::Finite(limit) = effective {
            self.schedule(cycle, limit, move |l| l.on_deadline(cycle));
        }
        self.step(cycle);
    }

    /// Re-evaluates every outstanding dependency of run `cycle`.
    pub(super) fn step(&self, cycle: u64) {
        let Some(cancelled) = self
            .with_current(cycle, |rt| (rt.stage == Stage::Waiting).then_some(rt.cancelled))
            .flatten()
        else {
            return;
        };
        if cancelled {
            self.finish_cancelled(cycle);
            return;
        }

        let unfinished: Vec<Arc<Loader>> = self
            .dependencies()
            .into_iter()
            .filter(|dep| !dep.succeeded())
            .collect();
        if !unfinished.is_empty() {
            // A success listener is one-shot: a dependency that succeeded and
            // then re-ran needs a fresh one.
            let fresh: Vec<Arc<Loader>> = self
                .with_current(cycle, |rt| {
                    unfinished
                        .into_iter()
                        .filter(|dep| rt.listening.insert(dep.id()))
                        .collect()
                })
                .unwrap_or_default();
            if !fresh.is_empty() {
                debug!(loader = %self.name, subscribed = fresh.len(), "waiting on loader dependencies");
            }
            for dep in fresh {
                let me = self.me.clone();
                let dep_id = dep.id();
                dep.on_success(move || {
                    if let Some(loader) = me.upgrade() {
                        loader.with_current(cycle, |rt| rt.listening.remove(&dep_id));
                        loader.schedule(cycle, Duration::ZERO, move |l| l.step(cycle));
                    }
                });
            }
            return;
        }

        match self.guard("readiness check", || self.pending_conditions(false)) {
            Ok(pending) if pending.is_empty() => self.dependencies_loaded(cycle),
            Ok(_) => {
                let poll = self.ctx.config().dependency_poll_clamped();
                self.schedule(cycle, poll, move |l| l.step(cycle));
            }
            Err(err) => self.fail(cycle, err, &[LoaderState::UnexpectedFail]),
        }
    }

    /// Lists every condition that still blocks execution.
    ///
    /// With `use_defaults`, a parameter with a default value never blocks.
    pub(super) fn pending_conditions(&self, use_defaults: bool) -> Vec<String> {
        let mut pending = Vec::new();

        for dep in self.dependencies() {
            if !dep.succeeded() {
                pending.push(format!("loader({})", dep.name()));
            }
        }
        if !self.ctx.surface().is_ready(&self.spec.location) {
            pending.push(format!("ready({})", self.spec.location));
        }
        for predicate in &self.spec.predicates {
            if !predicate.holds() {
                pending.push(format!("predicate({})", predicate.label()));
            }
        }
        let tokens = self.ctx.tokens();
        for param in &self.spec.parameters {
            let resolved = tokens.resolve(param.token()).is_some()
                || (use_defaults && param.default_value().is_some());
            if !resolved {
                pending.push(format!("token({})", param.token()));
            }
        }
        pending
    }

    fn on_deadline(&self, cycle: u64) {
        let Some(timeout) = self
            .with_current(cycle, |rt| {
                if rt.stage != Stage::Waiting {
                    return None;
                }
                rt.enter(LoaderState::TimedOut);
                rt.defaults_applied = true;
                Some(rt.effective)
            })
            .flatten()
        else {
            return;
        };

        match self.guard("readiness check", || self.pending_conditions(true)) {
            Ok(pending) if pending.is_empty() => {
                info!(loader = %self.name, "timed out; defaults satisfied the remaining parameters");
                self.dependencies_loaded(cycle);
            }
            Ok(pending) => {
                let err = LoaderError::DependencyTimeout {
                    timeout: timeout.as_duration().unwrap_or_default(),
                    pending,
                };
                self.fail(cycle, err, &[LoaderState::FailedToLoadDependencies]);
            }
            Err(err) => self.fail(cycle, err, &[LoaderState::UnexpectedFail]),
        }
    }

    fn dependencies_loaded(&self, cycle: u64) {
        let Some(run) = self
            .with_current(cycle, |rt| {
                if rt.stage != Stage::Waiting {
                    return None;
                }
                rt.enter(LoaderState::LoadedDependencies);
                rt.stage = Stage::Locking;
                Some(rt.run)
            })
            .flatten()
        else {
            return;
        };
        self.cancel_scheduled(cycle);

        debug!(loader = %self.name, run, "dependencies loaded");
        self.ctx
            .bus()
            .publish(self.event(EventKind::DependenciesLoaded, run));
        self.acquire_output(cycle);
    }
}
