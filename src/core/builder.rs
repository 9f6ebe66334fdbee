use std::sync::Arc;

use crate::{
    core::EngineConfig,
    events::Bus,
    host::{
        Codec, IdentityCodec, MemoryStore, NoTokens, NullSurface, NullTelemetry, Store, Surface,
        TelemetrySink, TokenResolver,
    },
    subscribers::{Subscribe, SubscriberSet},
};
use super::context::{Context, Host};

/// Builder for constructing a [`Context`] with optional collaborators.
///
/// Every collaborator defaults to a trivial implementation:
/// [`NullSurface`], [`MemoryStore`], [`IdentityCodec`], [`NullTelemetry`], [`NoTokens`].
pub struct ContextBuilder {
    cfg: EngineConfig,
    subscribers: Vec<Arc<dyn Subscribe>>,
    surface: Arc<dyn Surface>,
    store: Arc<dyn Store>,
    codec: Arc<dyn Codec>,
    telemetry: Arc<dyn TelemetrySink>,
    tokens: Arc<dyn TokenResolver>,
}

impl ContextBuilder {
    /// Creates a new builder with the given configuration.
    pub fn new(cfg: EngineConfig) -> Self {
        Self {
            cfg,
            subscribers: Vec::new(),
            surface: Arc::new(NullSurface),
            store: Arc::new(MemoryStore::new()),
            codec: Arc::new(IdentityCodec),
            telemetry: Arc::new(NullTelemetry),
            tokens: Arc::new(NoTokens),
        }
    }

    /// Sets event subscribers for observability.
    ///
    /// Subscribers receive lifecycle events through dedicated workers with
    /// bounded queues. Building with subscribers requires a tokio runtime.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Sets the rendering surface.
    pub fn with_surface(mut self, surface: Arc<dyn Surface>) -> Self {
        self.surface = surface;
        self
    }

    /// Sets the durable store.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = store;
        self
    }

    /// Sets the storage codec.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Sets the telemetry sink.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Sets the token resolver.
    pub fn with_tokens(mut self, tokens: Arc<dyn TokenResolver>) -> Self {
        self.tokens = tokens;
        self
    }

    /// Builds and returns the context.
    ///
    /// When subscribers are configured, spawns the listener that forwards
    /// bus events to the [`SubscriberSet`].
    pub fn build(self) -> Arc<Context> {
        let bus = Bus::new(self.cfg.bus_capacity_clamped());

        let subs = if self.subscribers.is_empty() {
            None
        } else {
            let set = Arc::new(SubscriberSet::new(self.subscribers, bus.clone()));
            subscriber_listener(&bus, Arc::clone(&set));
            Some(set)
        };

        let host = Host {
            surface: self.surface,
            store: self.store,
            codec: self.codec,
            telemetry: self.telemetry,
            tokens: self.tokens,
        };
        Arc::new(Context::new_internal(self.cfg, bus, host, subs))
    }
}

/// Subscribes to the bus and forwards events to the subscriber set.
fn subscriber_listener(bus: &Bus, set: Arc<SubscriberSet>) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ev) => set.emit(Arc::new(ev)),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
