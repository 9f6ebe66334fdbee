//! # Runtime events emitted by loaders, filters and containers.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Loader lifecycle**: run started, dependencies, urls, execution, finish
//! - **Admission**: filter decisions, session waits, deduplicated signals
//! - **Container**: batch admission, settle, telemetry
//! - **Subscriber**: overflow and panic reports from the fan-out workers
//!
//! The [`Event`] struct carries optional metadata such as loader and container
//! names, run number, reasons and durations.
//!
//! ## Ordering guarantees
//! Each published event receives a sequence number from its [`Bus`](crate::Bus)
//! that increases monotonically per bus.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use tagvisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::DependencyTimeout)
//!     .with_loader("analytics")
//!     .with_reason("ready(body)")
//!     .with_run(2)
//!     .with_timeout(Duration::from_secs(5));
//!
//! assert_eq!(ev.kind, EventKind::DependencyTimeout);
//! assert_eq!(ev.loader.as_deref(), Some("analytics"));
//! assert_eq!(ev.timeout_ms, Some(5000));
//! ```

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::filters::FilterState;

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets:
    /// - `loader`: subscriber name
    /// - `reason`: panic info/message
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets:
    /// - `loader`: subscriber name
    /// - `reason`: reason string (e.g., "full", "closed")
    SubscriberOverflow,

    // === Loader lifecycle ===
    /// A run cycle started.
    ///
    /// Sets:
    /// - `loader`, `run`
    /// - `timeout_ms`: effective (cascaded) timeout, absent when infinite
    LoaderStarted,

    /// Every dependency and readiness condition was satisfied.
    ///
    /// Sets: `loader`, `run`
    DependenciesLoaded,

    /// Waiting for dependencies exceeded the effective timeout.
    ///
    /// Sets: `loader`, `run`, `timeout_ms`, `reason` (pending conditions)
    DependencyTimeout,

    /// The loader claimed the output-stream lock.
    ///
    /// Sets: `loader`, `run`
    OutputLockAcquired,

    /// The loader flushed its buffer and released the output-stream lock.
    ///
    /// Sets: `loader`, `run`
    OutputLockReleased,

    /// Every declared URL loaded.
    ///
    /// Sets: `loader`, `run`
    UrlsLoaded,

    /// A declared URL failed or timed out.
    ///
    /// Sets: `loader`, `run`, `reason`
    UrlFailed,

    /// The payload completed without error.
    ///
    /// Sets: `loader`, `run`
    Executed,

    /// The payload returned an error or panicked.
    ///
    /// Sets: `loader`, `run`, `reason`
    ExecutionFailed,

    /// The loader observed its cancellation flag (or a pre-execution veto).
    ///
    /// Sets: `loader`, `run`
    Cancelled,

    /// Engine bookkeeping or a collaborator failed unexpectedly.
    ///
    /// Sets: `loader`, `run`, `reason`
    UnexpectedFail,

    /// The run cycle reached a terminal state.
    ///
    /// Sets: `loader`, `run`, `reason` (final phase label)
    LoaderFinished,

    // === Admission ===
    /// Filters produced a decision.
    ///
    /// Sets: `loader`, `decision`
    FilterDecided,

    /// Filters kept answering "retry" past the filter-wait timeout.
    ///
    /// Sets: `loader`, `timeout_ms`
    FilterTimeout,

    /// A deduplicated signal replaced the run.
    ///
    /// Sets: `loader`
    DedupeSignal,

    // === Container ===
    /// A container finished its admission pass.
    ///
    /// Sets: `container`, `reason` (admitted count)
    BatchAdmitted,

    /// Every admitted tag settled (or the settle ceiling elapsed).
    ///
    /// Sets: `container`, `reason` (category counts)
    BatchSettled,

    /// A telemetry batch was handed to the sink.
    ///
    /// Sets: `container`, `reason` (tag count)
    TelemetrySent,
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic per-bus sequence for ordering (assigned on publish)
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Name of the loader, if applicable.
    pub loader: Option<Arc<str>>,
    /// Name of the container, if applicable.
    pub container: Option<Arc<str>>,
    /// Run cycle number (starting from 1).
    pub run: Option<u32>,
    /// Human-readable reason (errors, pending conditions, counts).
    pub reason: Option<Arc<str>>,
    /// Timeout in milliseconds (compact).
    pub timeout_ms: Option<u32>,
    /// Delay in milliseconds (compact).
    pub delay_ms: Option<u32>,
    /// Filter decision.
    pub decision: Option<FilterState>,
}

impl Event {
    /// Creates a new event of the given kind with the current timestamp.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: 0,
            at: SystemTime::now(),
            kind,
            loader: None,
            container: None,
            run: None,
            reason: None,
            timeout_ms: None,
            delay_ms: None,
            decision: None,
        }
    }

    /// Attaches a loader name.
    #[inline]
    pub fn with_loader(mut self, loader: impl Into<Arc<str>>) -> Self {
        self.loader = Some(loader.into());
        self
    }

    /// Attaches a container name.
    #[inline]
    pub fn with_container(mut self, container: impl Into<Arc<str>>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches a run cycle number.
    #[inline]
    pub fn with_run(mut self, run: u32) -> Self {
        self.run = Some(run);
        self
    }

    /// Attaches a timeout (stored as milliseconds).
    #[inline]
    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout_ms = Some(compact_ms(d));
        self
    }

    /// Attaches a delay (stored as milliseconds).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay_ms = Some(compact_ms(d));
        self
    }

    /// Attaches a filter decision.
    #[inline]
    pub fn with_decision(mut self, decision: FilterState) -> Self {
        self.decision = Some(decision);
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_loader(subscriber)
            .with_reason(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_loader(subscriber)
            .with_reason(info)
    }

    /// Returns `true` for events that end a loader's run cycle.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::LoaderFinished)
    }
}

fn compact_ms(d: Duration) -> u32 {
    d.as_millis().min(u128::from(u32::MAX)) as u32
}
