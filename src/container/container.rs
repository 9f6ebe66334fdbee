//! # Container: batch admission of tags.
//!
//! A [`Container`] owns a name-keyed, insertion-ordered set of loaders
//! ("tags") and runs them together.
//!
//! ```text
//! run(command)
//!   ├─ run-lock held? ─► rejected (0 admitted)
//!   ├─ admission pass over registered tags (inactive / disabled+override / consent / initial)
//!   │     └─ for each admitted tag: fire same-container deps first, then the tag
//!   └─ settle polling every settle_poll
//!         ├─ every admitted tag finished, locked, or session-pending with no predicates
//!         ├─ or settle_ceiling elapsed
//!         └─► BatchSettled, category log, telemetry flush (coalesced)
//! ```
//!
//! Each tag finish requests a telemetry flush through
//! [`Scheduler::run_if_not_scheduled`](crate::Scheduler::run_if_not_scheduled):
//! a burst of completions produces at most one batch per window.

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::Context;
use crate::error::panic_message;
use crate::events::{Event, EventKind};
use crate::loader::{Loader, LoaderId, RunCommand};
use crate::scheduler::{TaskHandle, ThrottleLock};

use super::config::ContainerConfig;
use super::overrides;
use super::report::{Category, TagReport, TagsByState, TelemetryBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Settle {
    batch: u64,
    settled: bool,
}

#[derive(Default)]
struct Inner {
    batch: u64,
    admitted: Vec<Arc<Loader>>,
    started: Option<Instant>,
    poll: Option<TaskHandle>,
    last_command: RunCommand,
    reported: HashMap<LoaderId, Instant>,
    telemetry_seq: u64,
}

/// Named set of tags admitted and settled as a batch.
pub struct Container {
    name: Arc<str>,
    ctx: Arc<Context>,
    cfg: ContainerConfig,
    me: Weak<Container>,
    tags: Mutex<Vec<Arc<Loader>>>,
    consent: AtomicBool,
    running: AtomicBool,
    telemetry: Arc<ThrottleLock>,
    inner: Mutex<Inner>,
    settle: watch::Sender<Settle>,
}

impl Container {
    /// Creates an empty container.
    pub fn new(ctx: &Arc<Context>, name: impl Into<Arc<str>>, cfg: ContainerConfig) -> Arc<Self> {
        let (settle, _) = watch::channel(Settle::default());
        Arc::new_cyclic(|me| Self {
            name: name.into(),
            ctx: Arc::clone(ctx),
            cfg,
            me: me.clone(),
            tags: Mutex::new(Vec::new()),
            consent: AtomicBool::new(false),
            running: AtomicBool::new(false),
            telemetry: Arc::new(ThrottleLock::new()),
            inner: Mutex::new(Inner::default()),
            settle,
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.cfg
    }

    /// Returns the registered tags in registration order.
    pub fn tags(&self) -> Vec<Arc<Loader>> {
        self.tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the tag registered under `name`.
    pub fn tag(&self, name: &str) -> Option<Arc<Loader>> {
        self.tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|t| t.name() == name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.tags.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ---- registration ----

    /// Registers a tag. A tag whose name is already registered is ignored.
    ///
    /// Returns `true` when the tag was added.
    pub fn register_tag(&self, tag: Arc<Loader>) -> bool {
        {
            let mut tags = self.tags.lock().unwrap_or_else(PoisonError::into_inner);
            if tags.iter().any(|t| t.name() == tag.name()) {
                debug!(container = %self.name, tag = tag.name(), "duplicate tag ignored");
                return false;
            }
            tags.push(Arc::clone(&tag));
        }
        let me = self.me.clone();
        tag.on_finish(move |_| {
            if let Some(container) = me.upgrade() {
                container.request_telemetry();
            }
        });
        true
    }

    /// Registers every tag; returns how many were added.
    pub fn register_tags<I>(&self, tags: I) -> usize
    where
        I: IntoIterator<Item = Arc<Loader>>,
    {
        tags.into_iter()
            .map(|tag| self.register_tag(tag))
            .filter(|added| *added)
            .count()
    }

    // ---- consent and overrides ----

    pub fn consent_granted(&self) -> bool {
        self.consent.load(Ordering::SeqCst)
    }

    /// Records consent and re-runs the container with the last command.
    ///
    /// Returns the number of tags admitted by the re-run.
    pub fn grant_consent(&self) -> usize {
        self.consent.store(true, Ordering::SeqCst);
        let command = self.inner().last_command;
        info!(container = %self.name, "consent granted");
        self.run_with(command)
    }

    /// Stores the override token: disabled tags listed here may run.
    pub fn set_overrides(&self, names: &[String], ttl: Option<Duration>) -> Result<(), serde_json::Error> {
        overrides::write(
            self.ctx.store().as_ref(),
            self.ctx.codec().as_ref(),
            &self.cfg.override_key,
            names,
            ttl,
        )
    }

    // ---- running ----

    /// Runs every admissible tag through its filters.
    pub fn run(&self) -> usize {
        self.run_with(RunCommand::Filtered)
    }

    /// Runs every admissible tag, bypassing filters.
    pub fn run_without_filters(&self) -> usize {
        self.run_with(RunCommand::Unfiltered)
    }

    /// Admits the registered tags as one batch and fires them with `command`.
    ///
    /// Returns the number of admitted tags; `0` when called during another
    /// admission pass.
    pub fn run_with(&self, command: RunCommand) -> usize {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!(container = %self.name, "run rejected: admission pass in progress");
            return 0;
        }

        let tags = self.tags();
        let overrides = overrides::read(
            self.ctx.store().as_ref(),
            self.ctx.codec().as_ref(),
            &self.cfg.override_key,
        );
        let consent = self.consent_granted();
        let admitted: Vec<Arc<Loader>> = tags
            .iter()
            .filter(|t| self.is_admissible(t, &overrides, consent))
            .cloned()
            .collect();

        let (batch, stale) = {
            let mut inner = self.inner();
            inner.batch += 1;
            inner.admitted = admitted.clone();
            inner.started = Some(Instant::now());
            inner.last_command = command;
            (inner.batch, inner.poll.take())
        };
        if let Some(handle) = stale {
            handle.cancel();
        }
        self.settle.send_replace(Settle { batch, settled: false });

        info!(container = %self.name, batch, admitted = admitted.len(), registered = tags.len(), "batch admitted");
        self.ctx.bus().publish(
            Event::new(EventKind::BatchAdmitted)
                .with_container(Arc::clone(&self.name))
                .with_reason(format!("admitted={}", admitted.len())),
        );

        for tag in &admitted {
            for dep in tag.dependencies() {
                let local = tags.iter().find(|t| t.id() == dep.id());
                if let Some(local) = local {
                    if self.is_admissible(local, &overrides, consent) {
                        debug!(container = %self.name, tag = tag.name(), dependency = local.name(), "firing dependency first");
                        self.fire(local, command);
                    }
                }
            }
            if tag.is_initial() {
                self.fire(tag, command);
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.check_settled(batch);
        admitted.len()
    }

    fn fire(&self, tag: &Loader, command: RunCommand) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| tag.fire(command))) {
            warn!(container = %self.name, tag = tag.name(), panic = %panic_message(&*panic), "tag panicked while firing");
        }
    }

    fn is_admissible(&self, tag: &Loader, overrides: &HashSet<String>, consent: bool) -> bool {
        !tag.is_inactive()
            && (!tag.is_disabled() || overrides.contains(tag.name()))
            && (consent || !self.consent_required(tag))
            && tag.is_initial()
    }

    fn consent_required(&self, tag: &Loader) -> bool {
        self.cfg.consent_required || tag.needs_consent()
    }

    // ---- settling ----

    /// Returns `true` once the current batch settled.
    pub fn is_settled(&self) -> bool {
        self.settle.borrow().settled
    }

    /// Waits until the current batch settles and returns the tag categories.
    ///
    /// Resolves immediately when no batch is in progress.
    pub async fn wait_settled(&self) -> TagsByState {
        let mut rx = self.settle.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|s| s.settled || s.batch == 0).await;
        self.tags_by_state()
    }

    fn check_settled(&self, batch: u64) {
        let (admitted, started) = {
            let inner = self.inner();
            if inner.batch != batch {
                return;
            }
            (inner.admitted.clone(), inner.started)
        };

        let pending: Vec<&str> = admitted
            .iter()
            .filter(|t| !t.is_disabled() && !Self::is_tag_settled(t))
            .map(|t| t.name())
            .collect();
        let elapsed = started.map(|t| t.elapsed()).unwrap_or_default();

        if pending.is_empty() {
            self.settled(batch);
        } else if elapsed >= self.cfg.settle_ceiling {
            warn!(container = %self.name, batch, pending = ?pending, "settle ceiling reached");
            self.settled(batch);
        } else {
            let me = self.me.clone();
            let handle = self
                .ctx
                .scheduler()
                .schedule(self.cfg.settle_poll_clamped(), move || {
                    if let Some(container) = me.upgrade() {
                        container.check_settled(batch);
                    }
                });
            let mut inner = self.inner();
            if inner.batch == batch {
                inner.poll = Some(handle);
            } else {
                handle.cancel();
            }
        }
    }

    fn is_tag_settled(tag: &Loader) -> bool {
        tag.is_finished()
            || tag.is_locked()
            || (tag.is_awaiting_session() && tag.pending_predicates() == 0)
    }

    fn settled(&self, batch: u64) {
        {
            let mut inner = self.inner();
            if inner.batch != batch {
                return;
            }
            inner.poll = None;
        }
        let by_state = self.tags_by_state();
        let summary = by_state.summary();
        info!(
            container = %self.name,
            batch,
            ran = by_state.ran.len(),
            failed = by_state.failed.len(),
            awaiting_filter = by_state.awaiting_filter.len(),
            awaiting_consent = by_state.awaiting_consent.len(),
            locked = by_state.locked.len(),
            other = by_state.other.len(),
            "batch settled"
        );
        self.ctx.bus().publish(
            Event::new(EventKind::BatchSettled)
                .with_container(Arc::clone(&self.name))
                .with_reason(summary),
        );
        self.settle.send_replace(Settle { batch, settled: true });
        self.request_telemetry();
    }

    /// Partitions the registered tags by outcome.
    pub fn tags_by_state(&self) -> TagsByState {
        let consent = self.consent_granted();
        let mut by_state = TagsByState::default();
        for tag in self.tags() {
            let consent_pending = !consent && self.consent_required(&tag);
            by_state.push(Category::of(&tag, consent_pending), tag.name());
        }
        by_state
    }

    // ---- telemetry ----

    fn request_telemetry(&self) {
        let me = self.me.clone();
        let outcome = self.ctx.scheduler().run_if_not_scheduled(
            &self.telemetry,
            self.cfg.max_telemetry_interval,
            move || {
                if let Some(container) = me.upgrade() {
                    container.flush_telemetry();
                }
            },
        );
        debug!(container = %self.name, ?outcome, "telemetry requested");
    }

    /// Sends every tag outcome not reported yet as one batch.
    fn flush_telemetry(&self) {
        let finished: Vec<(LoaderId, Instant, TagReport)> = self
            .tags()
            .iter()
            .filter_map(|tag| {
                let at = tag.timestamps().finished?;
                Some((tag.id(), at, TagReport::of(tag)))
            })
            .collect();

        let batch = {
            let mut inner = self.inner();
            let mut reports = Vec::new();
            for (id, at, report) in finished {
                if inner.reported.get(&id) != Some(&at) {
                    inner.reported.insert(id, at);
                    reports.push(report);
                }
            }
            if reports.is_empty() {
                return;
            }
            inner.telemetry_seq += 1;
            TelemetryBatch {
                container: self.name.to_string(),
                seq: inner.telemetry_seq,
                tags: reports,
            }
        };

        let count = batch.tags.len();
        debug!(container = %self.name, seq = batch.seq, tags = count, "sending telemetry");
        let sink = self.ctx.telemetry();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| sink.send(batch))) {
            warn!(container = %self.name, panic = %panic_message(&*panic), "telemetry sink panicked");
            return;
        }
        self.ctx.bus().publish(
            Event::new(EventKind::TelemetrySent)
                .with_container(Arc::clone(&self.name))
                .with_reason(format!("tags={count}")),
        );
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.name)
            .field("tags", &self.len())
            .field("consent", &self.consent_granted())
            .field("settled", &self.is_settled())
            .finish()
    }
}
