//! Shared fakes for unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::container::TelemetryBatch;
use crate::core::{Context, EngineConfig};
use crate::host::{Completion, Location, OutputBuffer, Surface, TelemetrySink};

/// One collaborator call seen by [`RecordingSurface`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Script(String),
    Content(Location, String),
    Redirect,
    Restore,
}

/// Surface that records every call.
///
/// Scripts write `[url]` into the redirected output buffer, if any, and
/// complete after `script_delay` (synchronously when zero). Broken URLs and a
/// broken readiness check panic inside the collaborator call.
pub(crate) struct RecordingSurface {
    calls: Mutex<Vec<Call>>,
    redirect: Mutex<Option<OutputBuffer>>,
    failing: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
    broken: Mutex<HashSet<String>>,
    ready: AtomicBool,
    ready_broken: AtomicBool,
    script_delay: Duration,
}

impl RecordingSurface {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub(crate) fn with_delay(script_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            redirect: Mutex::new(None),
            failing: Mutex::new(HashSet::new()),
            hanging: Mutex::new(HashSet::new()),
            broken: Mutex::new(HashSet::new()),
            ready: AtomicBool::new(true),
            ready_broken: AtomicBool::new(false),
            script_delay,
        })
    }

    pub(crate) fn fail_url(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    pub(crate) fn hang_url(&self, url: &str) {
        self.hanging.lock().unwrap().insert(url.to_string());
    }

    pub(crate) fn break_url(&self, url: &str) {
        self.broken.lock().unwrap().insert(url.to_string());
    }

    pub(crate) fn break_readiness(&self) {
        self.ready_broken.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn scripts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Script(url) => Some(url),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

impl Surface for RecordingSurface {
    fn inject_script(&self, url: &str, _location: &Location, _is_async: bool, on_complete: Completion<bool>) {
        self.record(Call::Script(url.to_string()));
        let broken = self.broken.lock().unwrap().contains(url);
        if broken {
            panic!("surface crashed loading {url}");
        }
        if let Some(buffer) = self.redirect.lock().unwrap().as_ref() {
            buffer.write(format!("[{url}]"));
        }
        if self.hanging.lock().unwrap().contains(url) {
            return;
        }
        let ok = !self.failing.lock().unwrap().contains(url);
        if self.script_delay.is_zero() {
            on_complete(ok);
        } else {
            let delay = self.script_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                on_complete(ok);
            });
        }
    }

    fn inject_content(&self, location: &Location, _at_start: bool, html: &str, on_complete: Completion<()>) {
        self.record(Call::Content(location.clone(), html.to_string()));
        on_complete(());
    }

    fn redirect_output(&self, buffer: OutputBuffer) {
        self.record(Call::Redirect);
        *self.redirect.lock().unwrap() = Some(buffer);
    }

    fn restore_output(&self) {
        self.record(Call::Restore);
        *self.redirect.lock().unwrap() = None;
    }

    fn is_ready(&self, _location: &Location) -> bool {
        if self.ready_broken.load(Ordering::SeqCst) {
            panic!("surface crashed checking readiness");
        }
        self.ready.load(Ordering::SeqCst)
    }
}

/// Telemetry sink that keeps every batch.
#[derive(Default)]
pub(crate) struct RecordingTelemetry {
    batches: Mutex<Vec<TelemetryBatch>>,
}

impl RecordingTelemetry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn batches(&self) -> Vec<TelemetryBatch> {
        self.batches.lock().unwrap().clone()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn send(&self, batch: TelemetryBatch) {
        self.batches.lock().unwrap().push(batch);
    }
}

/// Context with default collaborators and the given surface.
pub(crate) fn context_with(surface: Arc<RecordingSurface>) -> Arc<Context> {
    Context::builder(EngineConfig::default())
        .with_surface(surface)
        .build()
}
