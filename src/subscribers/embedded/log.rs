//! # LogWriter: tracing-backed event writer
//!
//! A minimal subscriber that renders incoming [`Event`]s through `tracing`.
//!
//! ## Example output (with a fmt subscriber installed)
//! ```text
//! DEBUG tagvisor: started loader="analytics" run=1 timeout_ms=Some(5000)
//! WARN  tagvisor: dependency timeout loader="analytics" pending=Some("ready(body)")
//! INFO  tagvisor: batch settled container="main" counts=Some("ran=3 failed=1 ...")
//! ```

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event writer subscriber.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Construct a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let loader = e.loader.as_deref().unwrap_or("-");
        match e.kind {
            EventKind::LoaderStarted => {
                debug!(loader, run = ?e.run, timeout_ms = ?e.timeout_ms, "started");
            }
            EventKind::DependenciesLoaded => debug!(loader, run = ?e.run, "dependencies loaded"),
            EventKind::DependencyTimeout => {
                warn!(loader, timeout_ms = ?e.timeout_ms, pending = ?e.reason, "dependency timeout");
            }
            EventKind::OutputLockAcquired => debug!(loader, "output lock acquired"),
            EventKind::OutputLockReleased => debug!(loader, "output lock released"),
            EventKind::UrlsLoaded => debug!(loader, "urls loaded"),
            EventKind::UrlFailed => warn!(loader, err = ?e.reason, "url failed"),
            EventKind::Executed => info!(loader, run = ?e.run, "executed"),
            EventKind::ExecutionFailed => warn!(loader, err = ?e.reason, "execution failed"),
            EventKind::Cancelled => info!(loader, "cancelled"),
            EventKind::UnexpectedFail => warn!(loader, err = ?e.reason, "unexpected failure"),
            EventKind::LoaderFinished => debug!(loader, phase = ?e.reason, "finished"),
            EventKind::FilterDecided => debug!(loader, decision = ?e.decision, "filters decided"),
            EventKind::FilterTimeout => warn!(loader, timeout_ms = ?e.timeout_ms, "filter wait timed out"),
            EventKind::DedupeSignal => info!(loader, "deduplicated signal"),
            EventKind::BatchAdmitted => {
                debug!(container = ?e.container, admitted = ?e.reason, "batch admitted");
            }
            EventKind::BatchSettled => {
                info!(container = ?e.container, counts = ?e.reason, "batch settled");
            }
            EventKind::TelemetrySent => {
                debug!(container = ?e.container, tags = ?e.reason, "telemetry sent");
            }
            EventKind::SubscriberOverflow => {
                warn!(subscriber = loader, reason = ?e.reason, "subscriber overflow");
            }
            EventKind::SubscriberPanicked => {
                warn!(subscriber = loader, info = ?e.reason, "subscriber panicked");
            }
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }
}
