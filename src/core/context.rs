//! # Orchestration context.
//!
//! [`Context`] is the explicit replacement for process-wide singletons: it
//! owns the scheduler, the output-stream lock, the live-loader registry, the
//! event bus and the host collaborators. Loaders and containers receive an
//! `Arc<Context>` at construction, so independent contexts (for example
//! parallel tests) never share state.
//!
//! ```text
//! Context
//!  ├─ EngineConfig
//!  ├─ Scheduler      (one polling loop for every delay)
//!  ├─ OutputLock     (shared output-channel token)
//!  ├─ Registry       (live loaders, id allocation)
//!  ├─ Bus            (lifecycle events) ──► SubscriberSet
//!  └─ Host           (Surface, Store, Codec, TelemetrySink, TokenResolver)
//! ```

use std::sync::Arc;

use crate::core::builder::ContextBuilder;
use crate::core::config::EngineConfig;
use crate::core::output_lock::OutputLock;
use crate::core::registry::Registry;
use crate::events::Bus;
use crate::host::{Codec, Store, Surface, TelemetrySink, TokenResolver};
use crate::scheduler::Scheduler;
use crate::subscribers::SubscriberSet;

/// Host collaborators held by a context.
pub(crate) struct Host {
    pub surface: Arc<dyn Surface>,
    pub store: Arc<dyn Store>,
    pub codec: Arc<dyn Codec>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub tokens: Arc<dyn TokenResolver>,
}

/// Shared orchestration context.
pub struct Context {
    cfg: EngineConfig,
    scheduler: Scheduler,
    output_lock: OutputLock,
    registry: Registry,
    bus: Bus,
    host: Host,
    subs: Option<Arc<SubscriberSet>>,
}

impl Context {
    /// Returns a builder for a context with the given configuration.
    pub fn builder(cfg: EngineConfig) -> ContextBuilder {
        ContextBuilder::new(cfg)
    }

    pub(crate) fn new_internal(
        cfg: EngineConfig,
        bus: Bus,
        host: Host,
        subs: Option<Arc<SubscriberSet>>,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(cfg.scheduler),
            output_lock: OutputLock::new(),
            registry: Registry::new(),
            cfg,
            bus,
            host,
            subs,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Returns the scheduler shared by every component of this context.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Returns the output-stream lock.
    pub fn output_lock(&self) -> &OutputLock {
        &self.output_lock
    }

    /// Returns the live-loader registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Returns the event bus.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Returns the number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subs.as_ref().map(|s| s.len()).unwrap_or(0)
    }

    /// Returns the rendering surface.
    pub fn surface(&self) -> &Arc<dyn Surface> {
        &self.host.surface
    }

    /// Returns the durable store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.host.store
    }

    /// Returns the storage codec.
    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.host.codec
    }

    /// Returns the telemetry sink.
    pub fn telemetry(&self) -> &Arc<dyn TelemetrySink> {
        &self.host.telemetry
    }

    /// Returns the token resolver.
    pub fn tokens(&self) -> &Arc<dyn TokenResolver> {
        &self.host.tokens
    }

    /// Stops the polling loop and drops every pending scheduled callback.
    ///
    /// Loaders waiting on the scheduler never resume afterwards.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}
