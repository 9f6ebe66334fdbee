//! # Loader: the schedulable unit.
//!
//! A [`Loader`] waits for its dependencies, optionally claims the output
//! stream, loads its URLs, injects its content and runs its payload. Every
//! wait re-enters through the context's [`Scheduler`](crate::Scheduler); no
//! loader owns a timer or a task of its own.
//!
//! ## Lifecycle
//! ```text
//! run()
//!   ├─► Started, LoadingDependencies       (deadline armed at effective timeout)
//!   │     ├─ loader deps unfinished ─► one-shot success listeners, return
//!   │     ├─ readiness / predicates / tokens pending ─► poll every 65ms
//!   │     └─ deadline ─► TimedOut ─► defaults satisfy? continue : FailedToLoadDependencies
//!   ├─► LoadedDependencies
//!   ├─► output lock (uses_output_stream): Busy ─► poll, Granted ─► redirect output
//!   ├─► before hook (veto ─► Cancelled)
//!   ├─► LoadingUrl ... LoadedUrl            (sequential, bounded by remaining budget)
//!   ├─► inject content, flush buffer, release output lock
//!   ├─► payload ─► Executed | ExecutedWithErrors + FailedToExecute
//!   ├─► after hook
//!   └─► finished (success listeners only on Executed)
//! ```
//!
//! ## Rules
//! - `run()` while a run is in progress is rejected.
//! - A finished loader re-runs after an internal reset that keeps its history.
//! - Callbacks from an earlier cycle are ignored (generation counter) and a
//!   reset cancels every pending scheduled callback of the loader.
//! - No lock is held while calling a collaborator, a hook, a listener or the payload.

use std::collections::HashSet;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::Context;
use crate::error::{LoaderError, panic_message};
use crate::events::{Event, EventKind};
use crate::host::OutputBuffer;
use crate::scheduler::TaskHandle;

use super::admission::Admission;
use super::spec::LoaderSpec;
use super::state::{LoaderState, StateHistory};
use super::timeout::{self, Timeout};

/// Identifier of a loader, unique within one [`Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoaderId(pub(crate) u64);

impl fmt::Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loader#{}", self.0)
    }
}

/// How a container (or caller) fires a loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunCommand {
    /// Evaluate filters first ([`Loader::run_filtered`]).
    #[default]
    Filtered,
    /// Run unconditionally ([`Loader::run`]).
    Unfiltered,
}

/// Per-phase timestamps of the current run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamps {
    /// When the run started.
    pub before: Option<Instant>,
    /// When URL loading started.
    pub load_start: Option<Instant>,
    /// When the payload returned.
    pub executed: Option<Instant>,
    /// When the run finished.
    pub finished: Option<Instant>,
}

/// Persistent listener called each time the loader finishes a run.
pub type FinishListener = Arc<dyn Fn(&Loader) + Send + Sync>;

type OneShot = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Stage {
    Idle,
    Admitting,
    Waiting,
    Locking,
    Loading,
    Injecting,
    Finished,
}

pub(super) struct Runtime {
    pub run: u32,
    pub generation: u64,
    pub stage: Stage,
    pub history: StateHistory,
    pub cancelled: bool,
    pub locked: bool,
    pub pending_fire: Option<RunCommand>,
    pub deps_frozen: bool,
    pub effective: Timeout,
    pub timestamps: Timestamps,
    pub handles: Vec<TaskHandle>,
    pub listening: HashSet<LoaderId>,
    pub defaults_applied: bool,
    pub url_index: usize,
    pub holds_output: bool,
    pub output: Option<OutputBuffer>,
    pub succeeded: bool,
    pub on_success: Vec<OneShot>,
    pub admission: Admission,
    pub filter_started: Option<Instant>,
    pub session_waiting: bool,
    pub dedupe_sent: bool,
    pub errors: Vec<LoaderError>,
}

impl Runtime {
    fn new(locked: bool) -> Self {
        Self {
            run: 0,
            generation: 0,
            stage: Stage::Idle,
            history: StateHistory::new(),
            cancelled: false,
            locked,
            pending_fire: None,
            deps_frozen: false,
            effective: Timeout::Infinite,
            timestamps: Timestamps::default(),
            handles: Vec::new(),
            listening: HashSet::new(),
            defaults_applied: false,
            url_index: 0,
            holds_output: false,
            output: None,
            succeeded: false,
            on_success: Vec::new(),
            admission: Admission::NotChecked,
            filter_started: None,
            session_waiting: false,
            dedupe_sent: false,
            errors: Vec::new(),
        }
    }

    pub fn enter(&mut self, state: LoaderState) {
        self.history.enter(self.run, state);
    }

    /// Clears per-cycle fields and invalidates callbacks of the old cycle.
    ///
    /// Returns the scheduled handles the caller must cancel.
    pub fn clear_transient(&mut self) -> Vec<TaskHandle> {
        self.generation += 1;
        self.stage = Stage::Idle;
        self.cancelled = false;
        self.timestamps = Timestamps::default();
        self.listening.clear();
        self.defaults_applied = false;
        self.url_index = 0;
        self.output = None;
        self.succeeded = false;
        self.admission = Admission::NotChecked;
        self.filter_started = None;
        self.session_waiting = false;
        self.dedupe_sent = false;
        std::mem::take(&mut self.handles)
    }
}

/// A unit of deferred work.
pub struct Loader {
    pub(super) id: LoaderId,
    pub(super) name: Arc<str>,
    pub(super) ctx: Arc<Context>,
    pub(super) me: Weak<Loader>,
    pub(super) spec: LoaderSpec,
    own_timeout: Timeout,
    deps: Mutex<Vec<Arc<Loader>>>,
    rt: Mutex<Runtime>,
    finish_listeners: Mutex<Vec<FinishListener>>,
}

impl Loader {
    /// Creates a loader in `ctx` and registers it there.
    pub fn new(ctx: &Arc<Context>, spec: LoaderSpec) -> Arc<Self> {
        let id = ctx.registry().allocate_id();
        let own_timeout = spec.timeout.unwrap_or(ctx.config().default_timeout);
        let loader = Arc::new_cyclic(|me| Loader {
            id,
            name: Arc::clone(&spec.name),
            ctx: Arc::clone(ctx),
            me: me.clone(),
            own_timeout,
            deps: Mutex::new(Vec::new()),
            rt: Mutex::new(Runtime::new(spec.locked)),
            finish_listeners: Mutex::new(Vec::new()),
            spec,
        });
        ctx.registry().register(&loader);
        debug!(loader = %loader.name, id = %id, timeout = %own_timeout, "loader created");
        loader
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, Runtime> {
        self.rt.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- identity and declaration ----

    pub fn id(&self) -> LoaderId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the context the loader lives in.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Returns the declaration the loader was built from.
    pub fn spec(&self) -> &LoaderSpec {
        &self.spec
    }

    /// Returns the loader's own budget, without its dependencies.
    pub fn own_timeout(&self) -> Timeout {
        self.own_timeout
    }

    /// Returns the effective timeout: own budget plus the widest
    /// dependency cascade.
    pub fn timeout(&self) -> Timeout {
        timeout::cascade(self)
    }

    /// Returns the effective timeout snapshotted when the current run started.
    pub fn effective_timeout(&self) -> Timeout {
        self.lock().effective
    }

    pub fn is_disabled(&self) -> bool {
        self.spec.disabled
    }

    pub fn is_inactive(&self) -> bool {
        self.spec.inactive
    }

    pub fn needs_consent(&self) -> bool {
        self.spec.needs_consent
    }

    // ---- dependencies ----

    /// Returns the loader dependencies, in declaration order.
    pub fn dependencies(&self) -> Vec<Arc<Loader>> {
        self.deps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the loader dependencies.
    ///
    /// # Errors
    /// [`LoaderError::DependenciesLocked`] once the loader has started a run;
    /// only [`reset`](Self::reset) unfreezes the list.
    pub fn set_dependencies(&self, deps: Vec<Arc<Loader>>) -> Result<(), LoaderError> {
        let rt = self.lock();
        if rt.deps_frozen {
            return Err(LoaderError::DependenciesLocked {
                loader: self.name.to_string(),
            });
        }
        *self.deps.lock().unwrap_or_else(PoisonError::into_inner) = deps;
        drop(rt);
        Ok(())
    }

    /// Appends one dependency. Same rules as [`set_dependencies`](Self::set_dependencies).
    pub fn add_dependency(&self, dep: Arc<Loader>) -> Result<(), LoaderError> {
        let mut deps = self.dependencies();
        deps.push(dep);
        self.set_dependencies(deps)
    }

    // ---- state queries ----

    /// Returns the number of runs started so far.
    pub fn run_count(&self) -> u32 {
        self.lock().run
    }

    pub fn current_state(&self) -> LoaderState {
        self.lock().history.current()
    }

    /// Returns a copy of the state history.
    pub fn history(&self) -> StateHistory {
        self.lock().history.clone()
    }

    /// Returns `true` if `state` was entered since the last [`reset`](Self::reset).
    pub fn has(&self, state: LoaderState) -> bool {
        self.lock().history.has(state)
    }

    /// Returns `true` if `state` was entered during the current run.
    pub fn has_in_current_run(&self, state: LoaderState) -> bool {
        let rt = self.lock();
        rt.history.has_in_run(state, rt.run)
    }

    pub fn timestamps(&self) -> Timestamps {
        self.lock().timestamps
    }

    pub fn admission(&self) -> Admission {
        self.lock().admission
    }

    /// Returns the failures recorded since the last [`reset`](Self::reset).
    pub fn errors(&self) -> Vec<LoaderError> {
        self.lock().errors.clone()
    }

    /// Returns `true` until the loader is first fired (or after a reset).
    pub fn is_initial(&self) -> bool {
        self.lock().stage == Stage::Idle
    }

    /// Returns `true` while a run (or a filter wait) is in progress.
    pub fn is_running(&self) -> bool {
        !matches!(self.lock().stage, Stage::Idle | Stage::Finished)
    }

    pub fn is_finished(&self) -> bool {
        self.lock().stage == Stage::Finished
    }

    /// Returns `true` once the current run executed its payload without error.
    pub fn succeeded(&self) -> bool {
        self.lock().succeeded
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn is_locked(&self) -> bool {
        self.lock().locked
    }

    /// Returns `true` when a deduplicated signal replaced the run.
    pub fn dedupe_sent(&self) -> bool {
        self.lock().dedupe_sent
    }

    /// Returns `true` while filter admission waits on a session trigger.
    pub fn is_awaiting_session(&self) -> bool {
        let rt = self.lock();
        rt.stage == Stage::Admitting && rt.admission == Admission::AwaitingSession
    }

    /// Returns the number of predicate dependencies that do not hold right now.
    pub fn pending_predicates(&self) -> usize {
        self.spec
            .predicates
            .iter()
            .filter(|p| !catch_unwind(AssertUnwindSafe(|| p.holds())).unwrap_or(false))
            .count()
    }

    // ---- control ----

    /// Starts a run.
    ///
    /// Returns `false` while a previous run is in progress, or when the loader
    /// is `no_multiple_load` and already ran.
    pub fn run(&self) -> bool {
        self.start_run(self.spec.no_multiple_load)
    }

    /// Starts a run only if the loader never ran.
    pub fn run_once(&self) -> bool {
        self.start_run(true)
    }

    /// Fires the loader with `command`, or defers it while the loader is locked.
    pub fn fire(&self, command: RunCommand) -> bool {
        {
            let mut rt = self.lock();
            if rt.locked {
                rt.pending_fire = Some(command);
                debug!(loader = %self.name, ?command, "loader locked; firing deferred");
                return false;
            }
        }
        match command {
            RunCommand::Filtered => self.run_filtered(),
            RunCommand::Unfiltered => self.run(),
        }
    }

    /// Unlocks the loader and performs a deferred [`fire`](Self::fire), if any.
    ///
    /// Returns `true` when a deferred fire started.
    pub fn unlock(&self) -> bool {
        let pending = {
            let mut rt = self.lock();
            if !rt.locked {
                return false;
            }
            rt.locked = false;
            rt.pending_fire.take()
        };
        debug!(loader = %self.name, deferred = pending.is_some(), "loader unlocked");
        match pending {
            Some(command) => self.fire(command),
            None => false,
        }
    }

    /// Requests cancellation.
    ///
    /// Observed at the next poll tick, scheduled re-entry, or just before the
    /// payload runs. Returns `false` once the run has finished.
    pub fn cancel(&self) -> bool {
        let cycle = {
            let mut rt = self.lock();
            match rt.stage {
                Stage::Finished => return false,
                Stage::Idle | Stage::Loading | Stage::Injecting => {
                    rt.cancelled = true;
                    return true;
                }
                Stage::Admitting | Stage::Waiting | Stage::Locking => {
                    rt.cancelled = true;
                    rt.generation
                }
            }
        };
        self.schedule(cycle, Duration::ZERO, move |l| l.observe_cancel(cycle));
        true
    }

    /// Full reset: cancels pending work, releases the output lock, clears the
    /// history and unfreezes the dependencies.
    pub fn reset(&self) {
        let (stale, release, run) = {
            let mut rt = self.lock();
            let release = std::mem::replace(&mut rt.holds_output, false);
            let stale = rt.clear_transient();
            let run = rt.run;
            rt.history.clear(run);
            rt.deps_frozen = false;
            rt.pending_fire = None;
            rt.errors.clear();
            (stale, release, run)
        };
        for handle in stale {
            handle.cancel();
        }
        if release {
            self.release_output(run);
        }
        debug!(loader = %self.name, "loader reset");
    }

    // ---- listeners ----

    /// Runs `f` once the current (or next) run succeeds.
    ///
    /// Runs `f` immediately if the current run already succeeded.
    pub fn on_success<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let now = {
            let mut rt = self.lock();
            if rt.succeeded {
                Some(f)
            } else {
                rt.on_success.push(Box::new(f));
                None
            }
        };
        if let Some(f) = now {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
                warn!(loader = %self.name, panic = %panic_message(&*panic), "success listener panicked");
            }
        }
    }

    /// Calls `f` every time the loader finishes, successfully or not.
    pub fn on_finish<F>(&self, f: F)
    where
        F: Fn(&Loader) + Send + Sync + 'static,
    {
        self.finish_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(f));
    }

    // ---- internals shared by the phase modules ----

    fn start_run(&self, once: bool) -> bool {
        let effective = timeout::cascade(self);
        let (cycle, run, stale) = {
            let mut rt = self.lock();
            if once && rt.run > 0 {
                return false;
            }
            let stale = match rt.stage {
                Stage::Idle | Stage::Admitting => Vec::new(),
                Stage::Finished => rt.clear_transient(),
                _ => {
                    debug!(loader = %self.name, "run rejected: already running");
                    return false;
                }
            };
            rt.run += 1;
            rt.generation += 1;
            rt.stage = Stage::Waiting;
            rt.deps_frozen = true;
            rt.effective = effective;
            rt.timestamps.before = Some(Instant::now());
            rt.enter(LoaderState::Started);
            (rt.generation, rt.run, stale)
        };
        for handle in stale {
            handle.cancel();
        }

        info!(loader = %self.name, run, timeout = %effective, "run started");
        let mut ev = self.event(EventKind::LoaderStarted, run);
        if let Timeout::Finite(d) = effective {
            ev = ev.with_timeout(d);
        }
        self.ctx.bus().publish(ev);

        self.begin_waiting(cycle, effective);
        true
    }

    /// Runs `f` on the runtime if `cycle` is still the current cycle.
    pub(super) fn with_current<R>(&self, cycle: u64, f: impl FnOnce(&mut Runtime) -> R) -> Option<R> {
        let mut rt = self.lock();
        (rt.generation == cycle).then(|| f(&mut rt))
    }

    /// Returns `true` if `cycle` is current and the loader is in `stage`.
    pub(super) fn is_stage(&self, cycle: u64, stage: Stage) -> bool {
        let rt = self.lock();
        rt.generation == cycle && rt.stage == stage
    }

    /// Schedules `f` for run `cycle` and tracks the handle for cancellation.
    pub(super) fn schedule<F>(&self, cycle: u64, delay: Duration, f: F)
    where
        F: FnOnce(&Loader) + Send + 'static,
    {
        let me = self.me.clone();
        let handle = self.ctx.scheduler().schedule(delay, move || {
            if let Some(loader) = me.upgrade() {
                f(&loader);
            }
        });

        let mut rt = self.lock();
        if rt.generation == cycle {
            rt.handles.retain(TaskHandle::is_pending);
            rt.handles.push(handle);
        } else {
            handle.cancel();
        }
    }

    /// Cancels every scheduled callback of run `cycle`.
    pub(super) fn cancel_scheduled(&self, cycle: u64) {
        let stale = self
            .with_current(cycle, |rt| std::mem::take(&mut rt.handles))
            .unwrap_or_default();
        for handle in stale {
            handle.cancel();
        }
    }

    /// Calls a collaborator or user hook, folding a panic into an error.
    pub(super) fn guard<T>(&self, what: &str, f: impl FnOnce() -> T) -> Result<T, LoaderError> {
        catch_unwind(AssertUnwindSafe(f)).map_err(|panic| LoaderError::Unexpected {
            error: format!("{what}: {}", panic_message(&*panic)),
        })
    }

    pub(super) fn event(&self, kind: EventKind, run: u32) -> Event {
        Event::new(kind)
            .with_loader(Arc::clone(&self.name))
            .with_run(run)
    }

    /// Records `err` and `states`, reports the error, but keeps the run going.
    pub(super) fn record_error(&self, cycle: u64, err: LoaderError, states: &[LoaderState]) -> bool {
        let Some(run) = self.with_current(cycle, |rt| {
            for state in states {
                rt.enter(*state);
            }
            rt.errors.push(err.clone());
            rt.run
        }) else {
            return false;
        };

        warn!(loader = %self.name, run, label = err.as_label(), error = %err, "loader failure");
        if let Some(hook) = &self.spec.hooks.on_error {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| hook(self, &err))) {
                warn!(loader = %self.name, panic = %panic_message(&*panic), "error hook panicked");
            }
        }

        let kind = match &err {
            LoaderError::DependencyTimeout { .. } => EventKind::DependencyTimeout,
            LoaderError::UrlFailed { .. } | LoaderError::UrlTimeout { .. } => EventKind::UrlFailed,
            LoaderError::Execution { .. } => EventKind::ExecutionFailed,
            _ => EventKind::UnexpectedFail,
        };
        let mut ev = self.event(kind, run).with_reason(err.as_message());
        if let LoaderError::DependencyTimeout { timeout, .. } | LoaderError::UrlTimeout { timeout, .. } =
            &err
        {
            ev = ev.with_timeout(*timeout);
        }
        self.ctx.bus().publish(ev);
        true
    }

    /// Records `err` and finishes the run as failed.
    pub(super) fn fail(&self, cycle: u64, err: LoaderError, states: &[LoaderState]) {
        if self.record_error(cycle, err, states) {
            self.finish(cycle, false);
        }
    }

    pub(super) fn observe_cancel(&self, cycle: u64) {
        let active = self
            .with_current(cycle, |rt| {
                rt.cancelled && matches!(rt.stage, Stage::Admitting | Stage::Waiting | Stage::Locking)
            })
            .unwrap_or(false);
        if active {
            self.finish_cancelled(cycle);
        }
    }

    pub(super) fn finish_cancelled(&self, cycle: u64) {
        let Some(run) = self.with_current(cycle, |rt| {
            rt.enter(LoaderState::Cancelled);
            rt.run
        }) else {
            return;
        };
        info!(loader = %self.name, run, "loader cancelled");
        self.ctx.bus().publish(self.event(EventKind::Cancelled, run));
        self.finish(cycle, false);
    }

    /// Ends run cycle `cycle`: releases the output lock, cancels pending work
    /// and notifies listeners.
    pub(super) fn finish(&self, cycle: u64, success: bool) {
        let (run, reason, stale, listeners, release) = {
            let mut rt = self.lock();
            if rt.generation != cycle || rt.stage == Stage::Finished {
                return;
            }
            let reason = if rt.stage == Stage::Admitting {
                rt.admission.as_label()
            } else {
                rt.history.current().as_label()
            };
            rt.stage = Stage::Finished;
            rt.timestamps.finished = Some(Instant::now());
            rt.succeeded = success;
            let listeners = if success {
                std::mem::take(&mut rt.on_success)
            } else {
                Vec::new()
            };
            let release = std::mem::replace(&mut rt.holds_output, false);
            rt.output = None;
            (rt.run, reason, std::mem::take(&mut rt.handles), listeners, release)
        };

        for handle in stale {
            handle.cancel();
        }
        if release {
            self.release_output(run);
        }

        info!(loader = %self.name, run, outcome = reason, success, "loader finished");
        self.ctx
            .bus()
            .publish(self.event(EventKind::LoaderFinished, run).with_reason(reason));

        for listener in listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(listener)) {
                warn!(loader = %self.name, panic = %panic_message(&*panic), "success listener panicked");
            }
        }
        let finish: Vec<FinishListener> = self
            .finish_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in finish {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(self))) {
                warn!(loader = %self.name, panic = %panic_message(&*panic), "finish listener panicked");
            }
        }
    }
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rt = self.lock();
        f.debug_struct("Loader")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("run", &rt.run)
            .field("stage", &rt.stage)
            .field("state", &rt.history.current())
            .field("admission", &rt.admission)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::core::EngineConfig;
    use crate::filters::{Filter, FilterState, SessionTrigger};
    use crate::host::{Location, TokenTable};
    use crate::loader::{Admission, Parameter};
    use crate::testing::{Call, RecordingSurface, context_with};

    fn ctx() -> Arc<Context> {
        context_with(RecordingSurface::new())
    }

    fn gate() -> (Arc<AtomicBool>, impl Fn() -> bool + Send + Sync + 'static) {
        let flag = Arc::new(AtomicBool::new(false));
        let probe = Arc::clone(&flag);
        (flag, move || probe.load(Ordering::SeqCst))
    }

    async fn settle(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_walks_every_phase() {
        let surface = RecordingSurface::new();
        let ctx = context_with(Arc::clone(&surface));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let loader = Loader::new(
            &ctx,
            LoaderSpec::new("pixel")
                .with_url("a.js")
                .with_content("<div></div>")
                .with_payload(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
        );

        assert!(loader.is_initial());
        assert!(loader.run());
        assert!(loader.is_finished());
        assert!(loader.succeeded());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        for state in [
            LoaderState::Started,
            LoaderState::LoadingDependencies,
            LoaderState::LoadedDependencies,
            LoaderState::LoadingUrl,
            LoaderState::LoadedUrl,
            LoaderState::Executed,
        ] {
            assert!(loader.has(state), "missing {state}");
        }
        assert_eq!(
            surface.calls(),
            vec![
                Call::Script("a.js".into()),
                Call::Content(Location::Head, "<div></div>".into()),
            ]
        );
        let ts = loader.timestamps();
        assert!(ts.before.is_some() && ts.executed.is_some() && ts.finished.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_rejected_while_running() {
        let ctx = ctx();
        let (_flag, check) = gate();
        let loader = Loader::new(&ctx, LoaderSpec::new("slow").with_predicate("gate", check));

        assert!(loader.run());
        assert!(loader.is_running());
        assert!(!loader.run());
        assert_eq!(loader.run_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_survives_rerun_until_reset() {
        let ctx = ctx();
        let first = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&first);
        let loader = Loader::new(
            &ctx,
            LoaderSpec::new("flaky").with_payload(move |_| {
                if flag.swap(false, Ordering::SeqCst) {
                    anyhow::bail!("first call fails");
                }
                Ok(())
            }),
        );

        assert!(loader.run());
        assert!(loader.has_in_current_run(LoaderState::ExecutedWithErrors));
        assert!(!loader.succeeded());

        assert!(loader.run());
        assert_eq!(loader.run_count(), 2);
        assert!(loader.has_in_current_run(LoaderState::Executed));
        assert!(!loader.has_in_current_run(LoaderState::ExecutedWithErrors));
        assert!(loader.has(LoaderState::ExecutedWithErrors));
        assert!(loader.has(LoaderState::FailedToExecute));

        loader.reset();
        assert!(!loader.has(LoaderState::ExecutedWithErrors));
        assert_eq!(loader.current_state(), LoaderState::Initial);
        assert!(loader.is_initial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cascade_terminates_on_cycles() {
        let ctx = ctx();
        let a = Loader::new(&ctx, LoaderSpec::new("a").with_timeout(Timeout::millis(100)));
        let b = Loader::new(&ctx, LoaderSpec::new("b").with_timeout(Timeout::millis(200)));
        let c = Loader::new(&ctx, LoaderSpec::new("c").with_timeout(Timeout::millis(50)));
        a.set_dependencies(vec![Arc::clone(&b)]).unwrap();
        b.set_dependencies(vec![Arc::clone(&c), Arc::clone(&a)]).unwrap();

        assert_eq!(a.timeout(), Timeout::millis(350));
        assert_eq!(b.timeout(), Timeout::millis(300));
        assert_eq!(c.timeout(), Timeout::millis(50));

        let never = Loader::new(&ctx, LoaderSpec::new("never").with_timeout(Timeout::Infinite));
        c.set_dependencies(vec![never]).unwrap();
        assert_eq!(a.timeout(), Timeout::Infinite);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependencies_frozen_once_started() {
        let ctx = ctx();
        let dep = Loader::new(&ctx, LoaderSpec::new("dep"));
        let loader = Loader::new(&ctx, LoaderSpec::new("main"));

        assert!(loader.run());
        let err = loader.set_dependencies(vec![Arc::clone(&dep)]).unwrap_err();
        assert_eq!(err.as_label(), "dependencies_locked");

        loader.reset();
        assert!(loader.set_dependencies(vec![dep]).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_dependency_success() {
        let ctx = ctx();
        let (flag, check) = gate();
        let a = Loader::new(&ctx, LoaderSpec::new("a").with_predicate("gate", check));
        let b = Loader::new(&ctx, LoaderSpec::new("b"));
        b.set_dependencies(vec![Arc::clone(&a)]).unwrap();

        assert!(b.run());
        assert!(a.run());
        settle(200).await;
        assert!(!b.has(LoaderState::Executed));

        flag.store(true, Ordering::SeqCst);
        settle(200).await;
        assert!(a.succeeded());
        assert!(b.succeeded());
        assert!(b.timestamps().executed >= a.timestamps().executed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dependency_times_out_dependent() {
        let ctx = ctx();
        let a = Loader::new(
            &ctx,
            LoaderSpec::new("a")
                .with_timeout(Timeout::millis(100))
                .with_payload(|_| anyhow::bail!("broken")),
        );
        let b = Loader::new(&ctx, LoaderSpec::new("b").with_timeout(Timeout::millis(100)));
        b.set_dependencies(vec![Arc::clone(&a)]).unwrap();

        assert!(a.run());
        assert!(b.run());
        settle(150).await;
        assert!(!b.is_finished());

        settle(100).await;
        assert!(b.has(LoaderState::TimedOut));
        assert!(b.has(LoaderState::FailedToLoadDependencies));
        match &b.errors()[0] {
            LoaderError::DependencyTimeout { timeout, pending } => {
                assert_eq!(*timeout, Duration::from_millis(200));
                assert_eq!(pending, &vec!["loader(a)".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_falls_back_to_defaults() {
        let tokens = Arc::new(TokenTable::new());
        let ctx = Context::builder(EngineConfig::default())
            .with_tokens(tokens.clone())
            .build();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let with_default = Loader::new(
            &ctx,
            LoaderSpec::new("fallback")
                .with_timeout(Timeout::millis(200))
                .with_parameter(Parameter::new("account", "page.account").with_default("anon"))
                .with_payload(move |params| {
                    *sink.lock().unwrap() = params.get("account").map(str::to_string);
                    Ok(())
                }),
        );
        let without = Loader::new(
            &ctx,
            LoaderSpec::new("strict")
                .with_timeout(Timeout::millis(200))
                .with_parameter(Parameter::new("user", "page.user")),
        );

        assert!(with_default.run());
        assert!(without.run());
        settle(100).await;
        assert!(with_default.is_running());

        settle(200).await;
        assert!(with_default.has(LoaderState::TimedOut));
        assert!(with_default.has(LoaderState::Executed));
        assert_eq!(seen.lock().unwrap().as_deref(), Some("anon"));

        assert!(without.has(LoaderState::TimedOut));
        assert!(without.has(LoaderState::FailedToLoadDependencies));
        assert!(!without.has(LoaderState::Executed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_resolved_while_polling() {
        let tokens = Arc::new(TokenTable::new());
        let ctx = Context::builder(EngineConfig::default())
            .with_tokens(tokens.clone())
            .build();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let loader = Loader::new(
            &ctx,
            LoaderSpec::new("tokens")
                .with_parameter(Parameter::new("account", "page.account").with_default("anon"))
                .with_payload(move |params| {
                    *sink.lock().unwrap() = params.get("account").map(str::to_string);
                    Ok(())
                }),
        );

        assert!(loader.run());
        settle(100).await;
        tokens.define("page.account", "acme");
        settle(100).await;
        assert!(loader.succeeded());
        assert!(!loader.has(LoaderState::TimedOut));
        assert_eq!(seen.lock().unwrap().as_deref(), Some("acme"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_polled_until_surface_ready() {
        let surface = RecordingSurface::new();
        surface.set_ready(false);
        let ctx = context_with(Arc::clone(&surface));
        let loader = Loader::new(&ctx, LoaderSpec::new("late").with_location(Location::Body));

        assert!(loader.run());
        settle(300).await;
        assert!(!loader.has(LoaderState::LoadedDependencies));

        surface.set_ready(true);
        settle(100).await;
        assert!(loader.succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_flushes_follow_grant_order() {
        let surface = RecordingSurface::with_delay(Duration::from_millis(200));
        let ctx = context_with(Arc::clone(&surface));
        let (flag, check) = gate();
        let a = Loader::new(
            &ctx,
            LoaderSpec::new("a")
                .with_url("a.js")
                .uses_output_stream()
                .with_predicate("gate", check),
        );
        let b = Loader::new(&ctx, LoaderSpec::new("b").with_url("b.js").uses_output_stream());

        assert!(a.run());
        assert!(b.run());
        flag.store(true, Ordering::SeqCst);
        settle(1_000).await;

        assert!(a.succeeded());
        assert!(b.succeeded());
        assert_eq!(
            surface.calls(),
            vec![
                Call::Redirect,
                Call::Script("b.js".into()),
                Call::Content(Location::Head, "[b.js]".into()),
                Call::Restore,
                Call::Redirect,
                Call::Script("a.js".into()),
                Call::Content(Location::Head, "[a.js]".into()),
                Call::Restore,
            ]
        );
        assert_eq!(ctx.output_lock().grants(), 2);
        assert_eq!(ctx.output_lock().holder(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_observed_while_waiting() {
        let ctx = ctx();
        let (_flag, check) = gate();
        let ran = Arc::new(AtomicBool::new(false));
        let probe = Arc::clone(&ran);
        let loader = Loader::new(
            &ctx,
            LoaderSpec::new("cancel")
                .with_predicate("gate", check)
                .with_payload(move |_| {
                    probe.store(true, Ordering::SeqCst);
                    Ok(())
                }),
        );

        assert!(loader.run());
        assert!(loader.cancel());
        settle(10).await;

        assert!(loader.is_finished());
        assert!(loader.has(LoaderState::Cancelled));
        assert!(!ran.load(Ordering::SeqCst));
        assert!(!loader.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_before_hook_veto_cancels() {
        let surface = RecordingSurface::new();
        let ctx = context_with(Arc::clone(&surface));
        let loader = Loader::new(
            &ctx,
            LoaderSpec::new("veto").with_url("a.js").before(|_| false),
        );

        assert!(loader.run());
        assert!(loader.has(LoaderState::Cancelled));
        assert!(!loader.has(LoaderState::LoadingUrl));
        assert!(surface.scripts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_url_failure_and_timeout() {
        let surface = RecordingSurface::new();
        surface.fail_url("bad.js");
        surface.hang_url("hang.js");
        let ctx = context_with(Arc::clone(&surface));

        let failing = Loader::new(
            &ctx,
            LoaderSpec::new("failing").with_url("ok.js").with_url("bad.js").with_url("never.js"),
        );
        assert!(failing.run());
        assert!(failing.has(LoaderState::FailedToLoadUrl));
        assert!(!failing.has(LoaderState::LoadedUrl));
        assert_eq!(
            failing.errors(),
            vec![LoaderError::UrlFailed { url: "bad.js".into() }]
        );
        assert_eq!(surface.scripts(), vec!["ok.js".to_string(), "bad.js".to_string()]);

        let hanging = Loader::new(
            &ctx,
            LoaderSpec::new("hanging")
                .with_timeout(Timeout::millis(100))
                .with_url("hang.js"),
        );
        assert!(hanging.run());
        settle(150).await;
        assert!(hanging.has(LoaderState::TimedOut));
        assert!(hanging.has(LoaderState::FailedToLoadUrl));
        assert!(hanging.errors()[0].is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_panic_is_contained() {
        let ctx = ctx();
        let reported = Arc::new(Mutex::new(Vec::new()));
        let after = Arc::new(AtomicBool::new(false));
        let notified = Arc::new(AtomicBool::new(false));
        let (sink, after_probe) = (Arc::clone(&reported), Arc::clone(&after));
        let loader = Loader::new(
            &ctx,
            LoaderSpec::new("panics")
                .with_payload(|_| panic!("payload blew up"))
                .on_error(move |_, err| sink.lock().unwrap().push(err.as_label()))
                .after(move |_| after_probe.store(true, Ordering::SeqCst)),
        );
        let probe = Arc::clone(&notified);
        loader.on_success(move || probe.store(true, Ordering::SeqCst));

        assert!(loader.run());
        assert!(loader.has(LoaderState::ExecutedWithErrors));
        assert!(loader.has(LoaderState::FailedToExecute));
        assert!(!loader.has(LoaderState::Executed));
        assert!(after.load(Ordering::SeqCst));
        assert!(!notified.load(Ordering::SeqCst));
        assert_eq!(*reported.lock().unwrap(), vec!["execution_failed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_success_listener_is_contained() {
        let ctx = ctx();
        let loader = Loader::new(&ctx, LoaderSpec::new("listeners"));
        let later = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        loader.on_success(|| panic!("listener blew up"));
        let probe = Arc::clone(&later);
        loader.on_success(move || probe.store(true, Ordering::SeqCst));
        let probe = Arc::clone(&finished);
        loader.on_finish(move |_| probe.store(true, Ordering::SeqCst));

        let ran = catch_unwind(AssertUnwindSafe(|| loader.run()));
        assert!(matches!(ran, Ok(true)));
        assert!(loader.succeeded());
        assert!(later.load(Ordering::SeqCst));
        assert!(finished.load(Ordering::SeqCst));

        // Registered after success: runs inline, still contained.
        let late = catch_unwind(AssertUnwindSafe(|| loader.on_success(|| panic!("late listener"))));
        assert!(late.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_collaborator_panic_fails_run_unexpectedly() {
        let surface = RecordingSurface::new();
        surface.break_url("crash.js");
        let ctx = context_with(Arc::clone(&surface));
        let reported = Arc::new(Mutex::new(Vec::new()));
        let finished = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&reported);
        let loader = Loader::new(
            &ctx,
            LoaderSpec::new("crashing")
                .with_url("crash.js")
                .on_error(move |_, err| sink.lock().unwrap().push(err.as_label())),
        );
        let counter = Arc::clone(&finished);
        loader.on_finish(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(loader.run());
        assert!(loader.is_finished());
        assert!(!loader.succeeded());
        assert!(loader.has(LoaderState::UnexpectedFail));
        assert!(!loader.has(LoaderState::LoadedUrl));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(*reported.lock().unwrap(), vec!["unexpected_fail"]);
        match &loader.errors()[0] {
            LoaderError::Unexpected { error } => assert!(error.contains("inject_script")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_panic_fails_run_unexpectedly() {
        let surface = RecordingSurface::new();
        surface.break_readiness();
        let ctx = context_with(Arc::clone(&surface));
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        let loader = Loader::new(
            &ctx,
            LoaderSpec::new("unready")
                .on_error(move |_, err| sink.lock().unwrap().push(err.as_label())),
        );

        assert!(loader.run());
        assert!(loader.is_finished());
        assert!(loader.has(LoaderState::UnexpectedFail));
        assert!(!loader.has(LoaderState::LoadedDependencies));
        assert_eq!(*reported.lock().unwrap(), vec!["unexpected_fail"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_finite_timeout_keeps_waiting() {
        let ctx = ctx();
        let loader = Loader::new(
            &ctx,
            LoaderSpec::new("patient")
                .with_timeout(Timeout::Finite(Duration::MAX))
                .with_predicate("never", || false),
        );

        let ran = catch_unwind(AssertUnwindSafe(|| loader.run()));
        assert!(matches!(ran, Ok(true)));
        settle(500).await;
        assert!(loader.is_running());
        assert!(!loader.has(LoaderState::TimedOut));
        assert!(loader.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_dependency_is_awaited_again() {
        let ctx = ctx();
        let (a_open, a_check) = gate();
        let (b_open, b_check) = gate();
        let a = Loader::new(
            &ctx,
            LoaderSpec::new("a")
                .with_timeout(Timeout::millis(5_000))
                .with_predicate("gate", a_check),
        );
        let b = Loader::new(
            &ctx,
            LoaderSpec::new("b")
                .with_timeout(Timeout::millis(5_000))
                .with_predicate("gate", b_check),
        );
        let c = Loader::new(&ctx, LoaderSpec::new("c").with_timeout(Timeout::millis(5_000)));
        c.set_dependencies(vec![Arc::clone(&a), Arc::clone(&b)]).unwrap();

        assert!(c.run());
        assert!(a.run());
        assert!(b.run());
        a_open.store(true, Ordering::SeqCst);
        settle(200).await;
        assert!(a.succeeded());

        a_open.store(false, Ordering::SeqCst);
        assert!(a.run());
        b_open.store(true, Ordering::SeqCst);
        settle(200).await;
        assert!(b.succeeded());
        assert!(!a.succeeded());
        assert!(!c.has(LoaderState::LoadedDependencies));

        a_open.store(true, Ordering::SeqCst);
        settle(200).await;
        assert!(a.succeeded());
        assert!(c.succeeded());
        assert!(!c.has(LoaderState::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_and_no_multiple_load() {
        let ctx = ctx();
        let once = Loader::new(&ctx, LoaderSpec::new("once").no_multiple_load());
        assert!(once.run());
        assert!(!once.run());
        assert_eq!(once.run_count(), 1);

        let plain = Loader::new(&ctx, LoaderSpec::new("plain"));
        assert!(plain.run_once());
        assert!(!plain.run_once());
        assert!(plain.run());
        assert_eq!(plain.run_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_locked_fire_waits_for_unlock() {
        let ctx = ctx();
        let loader = Loader::new(&ctx, LoaderSpec::new("locked").locked());

        assert!(!loader.fire(RunCommand::Unfiltered));
        assert_eq!(loader.run_count(), 0);
        assert!(loader.unlock());
        assert!(loader.succeeded());
        assert!(!loader.unlock());
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_fail_finishes_without_running() {
        let ctx = ctx();
        let loader = Loader::new(
            &ctx,
            LoaderSpec::new("blocked").with_filter(Arc::new(Filter::constant("no", FilterState::Fail))),
        );

        assert!(loader.run_filtered());
        assert_eq!(loader.admission(), Admission::Failed);
        assert!(loader.is_finished());
        assert_eq!(loader.run_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_retry_bounded_by_filter_timeout() {
        let ctx = ctx();
        let asked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&asked);
        let loader = Loader::new(
            &ctx,
            LoaderSpec::new("retry")
                .with_filter(Arc::new(Filter::new("later", move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    FilterState::retry_ms(50)
                })))
                .with_filter_timeout(Timeout::millis(120)),
        );

        assert!(loader.run_filtered());
        assert_eq!(loader.admission(), Admission::AwaitingRetry);
        assert!(!loader.run_filtered());

        settle(300).await;
        assert_eq!(loader.admission(), Admission::TimedOut);
        assert!(loader.is_finished());
        assert_eq!(loader.run_count(), 0);
        assert_eq!(asked.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_trigger_readmits() {
        let ctx = ctx();
        let trigger: Arc<Mutex<Option<SessionTrigger>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&trigger);
        let filter = Arc::new(
            Filter::constant("consent", FilterState::Session)
                .with_session_starter(move |t| *slot.lock().unwrap() = Some(t)),
        );
        let first = Loader::new(&ctx, LoaderSpec::new("first").with_filter(Arc::clone(&filter)));
        let second = Loader::new(&ctx, LoaderSpec::new("second").with_filter(filter));

        assert!(first.run_filtered());
        assert!(second.run_filtered());
        assert!(first.is_awaiting_session());
        assert!(second.is_awaiting_session());

        trigger.lock().unwrap().take().unwrap().fire();
        settle(50).await;
        assert_eq!(first.admission(), Admission::Passed);
        assert!(first.succeeded());
        assert!(second.succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedupe_signal_replaces_run() {
        let ctx = ctx();
        let filters = vec![
            Arc::new(Filter::constant("ok", FilterState::Pass).with_order(5)),
            Arc::new(
                Filter::constant("consent", FilterState::Session)
                    .session()
                    .matching(|_| false),
            ),
        ];
        let loader = Loader::new(&ctx, LoaderSpec::new("dedupe").dedupe().with_filters(filters));

        assert!(loader.run_filtered());
        assert!(loader.dedupe_sent());
        assert_eq!(loader.admission(), Admission::Failed);
        assert_eq!(loader.run_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_events_are_published() {
        let ctx = ctx();
        let mut rx = ctx.bus().subscribe();
        let loader = Loader::new(&ctx, LoaderSpec::new("events").with_url("a.js"));
        assert!(loader.run());

        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            assert_eq!(ev.loader.as_deref(), Some("events"));
            kinds.push(ev.kind);
        }
        assert_eq!(
            kinds,
            vec![
                EventKind::LoaderStarted,
                EventKind::DependenciesLoaded,
                EventKind::UrlsLoaded,
                EventKind::Executed,
                EventKind::LoaderFinished,
            ]
        );
    }
}
