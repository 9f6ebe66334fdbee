//! Execution phase: output lock, URLs, content, payload.

use std::panic::{AssertUnwindSafe, catch_unwind};

use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::Acquire;
use crate::error::{LoaderError, panic_message};
use crate::events::EventKind;
use crate::host::{Completion, OutputBuffer};

use super::loader::{Loader, Stage};
use super::spec::Parameters;
use super::state::LoaderState;
use super::timeout::Timeout;

impl Loader {
    /// Claims the output stream if the loader needs it, then executes.
    ///
    /// A busy lock is retried at the dependency poll cadence.
    pub(super) fn acquire_output(&self, cycle: u64) {
        let Some((cancelled, run)) = self
            .with_current(cycle, |rt| (rt.stage == Stage::Locking).then_some((rt.cancelled, rt.run)))
            .flatten()
        else {
            return;
        };
        if cancelled {
            self.finish_cancelled(cycle);
            return;
        }
        if !self.spec.uses_output_stream {
            self.execute(cycle);
            return;
        }

        match self.ctx.output_lock().try_acquire(self.id, &self.name) {
            Acquire::Granted => {
                let buffer = OutputBuffer::new();
                let owned = self
                    .with_current(cycle, |rt| {
                        rt.holds_output = true;
                        rt.output = Some(buffer.clone());
                    })
                    .is_some();
                if !owned {
                    self.ctx.output_lock().release(self.id);
                    return;
                }
                if let Err(err) = self.guard("redirect_output", || {
                    self.ctx.surface().redirect_output(buffer)
                }) {
                    self.fail(cycle, err, &[LoaderState::UnexpectedFail]);
                    return;
                }
                debug!(loader = %self.name, run, "output lock acquired");
                self.ctx
                    .bus()
                    .publish(self.event(EventKind::OutputLockAcquired, run));
                self.execute(cycle);
            }
            Acquire::AlreadyHeld => self.execute(cycle),
            Acquire::Busy { holder } => {
                debug!(loader = %self.name, holder = %holder, "output lock busy");
                let poll = self.ctx.config().dependency_poll_clamped();
                self.schedule(cycle, poll, move |l| l.acquire_output(cycle));
            }
        }
    }

    fn execute(&self, cycle: u64) {
        let Some(cancelled) = self
            .with_current(cycle, |rt| {
                if rt.stage != Stage::Locking {
                    return None;
                }
                rt.stage = Stage::Loading;
                rt.timestamps.load_start = Some(Instant::now());
                Some(rt.cancelled)
            })
            .flatten()
        else {
            return;
        };
        if cancelled {
            self.finish_cancelled(cycle);
            return;
        }

        if let Some(before) = self.spec.hooks.before.clone() {
            match self.guard("before hook", || before(self)) {
                Ok(true) => {}
                Ok(false) => {
                    info!(loader = %self.name, "run vetoed by before hook");
                    self.finish_cancelled(cycle);
                    return;
                }
                Err(err) => {
                    self.fail(cycle, err, &[LoaderState::UnexpectedFail]);
                    return;
                }
            }
        }

        if self.spec.urls.is_empty() {
            self.urls_loaded(cycle);
            return;
        }

        let Some((effective, started)) = self.with_current(cycle, |rt| {
            rt.enter(LoaderState::LoadingUrl);
            (rt.effective, rt.timestamps.before)
        }) else {
            return;
        };
        if let Timeout::Finite(limit) = effective {
            let elapsed = started.map(|t| t.elapsed()).unwrap_or_default();
            let remaining = limit.saturating_sub(elapsed);
            self.schedule(cycle, remaining, move |l| l.on_url_deadline(cycle, remaining));
        }
        self.load_url(cycle, 0);
    }

    fn load_url(&self, cycle: u64, index: usize) {
        let Some(url) = self.spec.urls.get(index) else {
            self.urls_loaded(cycle);
            return;
        };
        let current = self
            .with_current(cycle, |rt| {
                let loading = rt.stage == Stage::Loading;
                if loading {
                    rt.url_index = index;
                }
                loading
            })
            .unwrap_or(false);
        if !current {
            return;
        }

        debug!(loader = %self.name, url, index, "loading url");
        let me = self.me.clone();
        let done: Completion<bool> = Box::new(move |ok| {
            if let Some(loader) = me.upgrade() {
                loader.url_done(cycle, index, ok);
            }
        });
        if let Err(err) = self.guard("inject_script", || {
            self.ctx
                .surface()
                .inject_script(url, &self.spec.location, self.spec.is_async, done)
        }) {
            self.fail(cycle, err, &[LoaderState::UnexpectedFail]);
        }
    }

    fn url_done(&self, cycle: u64, index: usize, ok: bool) {
        if !self.is_stage(cycle, Stage::Loading) {
            return;
        }
        if ok {
            self.load_url(cycle, index + 1);
        } else {
            let url = self.spec.urls.get(index).cloned().unwrap_or_default();
            self.fail(cycle, LoaderError::UrlFailed { url }, &[LoaderState::FailedToLoadUrl]);
        }
    }

    fn on_url_deadline(&self, cycle: u64, budget: std::time::Duration) {
        let Some(index) = self
            .with_current(cycle, |rt| (rt.stage == Stage::Loading).then_some(rt.url_index))
            .flatten()
        else {
            return;
        };
        let url = self.spec.urls.get(index).cloned().unwrap_or_default();
        self.fail(
            cycle,
            LoaderError::UrlTimeout {
                url,
                timeout: budget,
            },
            &[LoaderState::TimedOut, LoaderState::FailedToLoadUrl],
        );
    }

    fn urls_loaded(&self, cycle: u64) {
        let loaded_any = !self.spec.urls.is_empty();
        let Some(run) = self
            .with_current(cycle, |rt| {
                if rt.stage != Stage::Loading {
                    return None;
                }
                if loaded_any {
                    rt.enter(LoaderState::LoadedUrl);
                }
                rt.stage = Stage::Injecting;
                Some(rt.run)
            })
            .flatten()
        else {
            return;
        };
        self.cancel_scheduled(cycle);

        if loaded_any {
            debug!(loader = %self.name, run, urls = self.spec.urls.len(), "urls loaded");
            self.ctx.bus().publish(self.event(EventKind::UrlsLoaded, run));
        }
        self.inject_content(cycle);
    }

    fn inject_content(&self, cycle: u64) {
        let Some(html) = &self.spec.content else {
            self.after_content(cycle);
            return;
        };
        let me = self.me.clone();
        let done: Completion<()> = Box::new(move |()| {
            if let Some(loader) = me.upgrade() {
                loader.after_content(cycle);
            }
        });
        if let Err(err) = self.guard("inject_content", || {
            self.ctx
                .surface()
                .inject_content(&self.spec.location, self.spec.at_start, html, done)
        }) {
            self.fail(cycle, err, &[LoaderState::UnexpectedFail]);
        }
    }

    fn after_content(&self, cycle: u64) {
        let Some((cancelled, run)) = self
            .with_current(cycle, |rt| (rt.stage == Stage::Injecting).then_some((rt.cancelled, rt.run)))
            .flatten()
        else {
            return;
        };
        if cancelled {
            self.finish_cancelled(cycle);
            return;
        }

        let buffer = self
            .with_current(cycle, |rt| {
                if std::mem::replace(&mut rt.holds_output, false) {
                    rt.output.take()
                } else {
                    None
                }
            })
            .flatten();
        if let Some(buffer) = buffer {
            if let Err(err) = self.flush_output(run, &buffer) {
                self.fail(cycle, err, &[LoaderState::UnexpectedFail]);
                return;
            }
        }
        self.run_payload(cycle);
    }

    /// Writes the buffered output as one injection, restores the channel and
    /// releases the lock.
    fn flush_output(&self, run: u32, buffer: &OutputBuffer) -> Result<(), LoaderError> {
        let html = buffer.take();
        let surface = self.ctx.surface();
        let flushed = self.guard("flush output", || {
            if !html.is_empty() {
                surface.inject_content(&self.spec.location, self.spec.at_start, &html, Box::new(|()| {}));
            }
            surface.restore_output();
        });
        self.ctx.output_lock().release(self.id);
        debug!(loader = %self.name, run, bytes = html.len(), "output flushed");
        self.ctx
            .bus()
            .publish(self.event(EventKind::OutputLockReleased, run));
        flushed
    }

    /// Restores the output channel and releases the lock without flushing.
    pub(super) fn release_output(&self, run: u32) {
        let _ = self.guard("restore_output", || self.ctx.surface().restore_output());
        if self.ctx.output_lock().release(self.id) {
            debug!(loader = %self.name, run, "output lock released unflushed");
            self.ctx
                .bus()
                .publish(self.event(EventKind::OutputLockReleased, run));
        }
    }

    fn resolve_parameters(&self) -> Parameters {
        let tokens = self.ctx.tokens();
        let mut params = Parameters::default();
        for param in &self.spec.parameters {
            let value = tokens
                .resolve(param.token())
                .or_else(|| param.default_value().map(str::to_string));
            if let Some(value) = value {
                params.push(param.name(), value);
            }
        }
        params
    }

    fn run_payload(&self, cycle: u64) {
        let params = match self.guard("resolve parameters", || self.resolve_parameters()) {
            Ok(params) => params,
            Err(err) => {
                self.fail(cycle, err, &[LoaderState::UnexpectedFail]);
                return;
            }
        };

        let outcome = match &self.spec.payload {
            None => Ok(()),
            Some(payload) => match catch_unwind(AssertUnwindSafe(|| payload(&params))) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(format!("{err:#}")),
                Err(panic) => Err(format!("panic: {}", panic_message(&*panic))),
            },
        };

        let Some(run) = self.with_current(cycle, |rt| {
            rt.timestamps.executed = Some(Instant::now());
            rt.run
        }) else {
            return;
        };
        let success = match outcome {
            Ok(()) => {
                self.with_current(cycle, |rt| rt.enter(LoaderState::Executed));
                debug!(loader = %self.name, run, "payload executed");
                self.ctx.bus().publish(self.event(EventKind::Executed, run));
                true
            }
            Err(error) => {
                self.record_error(
                    cycle,
                    LoaderError::Execution { error },
                    &[LoaderState::ExecutedWithErrors, LoaderState::FailedToExecute],
                );
                false
            }
        };

        if let Some(after) = self.spec.hooks.after.clone() {
            if let Err(err) = self.guard("after hook", || after(self)) {
                self.fail(cycle, err, &[LoaderState::UnexpectedFail]);
                return;
            }
        }
        self.finish(cycle, success);
    }
}
