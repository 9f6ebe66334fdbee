//! # tagvisor
//!
//! **Tagvisor** decides whether and when deferred page loaders ("tags") may
//! run.
//!
//! Each [`Loader`] waits for its dependencies, optionally claims the shared
//! output stream, loads its URLs, injects its content and runs its payload.
//! Admission is gated by priority-ordered [`Filter`]s, readiness conditions
//! and cascaded timeouts. A [`Container`] admits many loaders as one batch,
//! detects when the batch has settled and throttles outbound telemetry.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!     │  LoaderSpec  │   │  LoaderSpec  │   │  LoaderSpec  │
//!     │   (tag #1)   │   │   (tag #2)   │   │   (tag #3)   │
//!     └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!            ▼                  ▼                  ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Container (batch admission)                                      │
//! │  - consent / disabled override / inactive checks                  │
//! │  - same-container dependencies fired first                        │
//! │  - settle polling, TagsByState, coalesced TelemetryBatch          │
//! └──────┬──────────────────┬──────────────────┬──────────────────────┘
//!        ▼                  ▼                  ▼
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!     │    Loader    │   │    Loader    │   │    Loader    │
//!     │ filters ─►   │   │ filters ─►   │   │ filters ─►   │
//!     │ deps ─► exec │   │ deps ─► exec │   │ deps ─► exec │
//!     └┬─────────────┘   └┬─────────────┘   └┬─────────────┘
//!      │ every wait       │                  │
//!      ▼                  ▼                  ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Context                                                          │
//! │  - Scheduler (one polling loop, dynamic rate, throttles)          │
//! │  - OutputLock (one writer of the shared output stream)            │
//! │  - Registry (live loaders)                                        │
//! │  - Host collaborators: Surface, Store, Codec, TelemetrySink,      │
//! │    TokenResolver                                                  │
//! │  - Bus (broadcast events) ──► SubscriberSet ──► LogWriter, ...    │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ### Loader lifecycle
//! ```text
//! run_filtered() ──► evaluate(filters)
//!   ├─ Fail      ─► finished (admission: filters_failed)
//!   ├─ Session   ─► wait for the session trigger, evaluate again
//!   ├─ Retry(N)  ─► evaluate again after N (bounded by the filter timeout)
//!   └─ Pass      ─► run()
//!
//! run()
//!   ├─► Started, LoadingDependencies ─► LoadedDependencies | TimedOut ─► FailedToLoadDependencies
//!   ├─► output lock, LoadingUrl ─► LoadedUrl | FailedToLoadUrl
//!   ├─► content, flush
//!   └─► payload ─► Executed | ExecutedWithErrors + FailedToExecute
//! ```
//!
//! ## Features
//! | Area              | Description                                                        | Key types / traits                         |
//! |-------------------|--------------------------------------------------------------------|--------------------------------------------|
//! | **Loaders**       | Declare deferred units of work and run them through their phases.  | [`Loader`], [`LoaderSpec`], [`Timeout`]    |
//! | **Filters**       | Priority-ordered admission control with sessions and retries.      | [`Filter`], [`FilterState`], [`evaluate`]  |
//! | **Containers**    | Batch admission, settle detection, throttled telemetry.            | [`Container`], [`TagsByState`]             |
//! | **Scheduling**    | One cooperative polling loop for every delay in the engine.        | [`Scheduler`], [`ThrottleLock`]            |
//! | **Host**          | Narrow contracts to the rendering surface, storage and network.    | [`Surface`], [`Store`], [`TelemetrySink`]  |
//! | **Subscriber API**| Hook into lifecycle events (logging, metrics, custom subscribers). | [`Subscribe`]                              |
//! | **Errors**        | Typed loader failures.                                             | [`LoaderError`]                            |
//!
//! ## Optional features
//! - `logging`: exports a simple built-in [`LogWriter`] _(demo/reference only)_.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use tagvisor::{Container, ContainerConfig, Context, EngineConfig, Loader, LoaderSpec};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     // Build subscribers (optional)
//!     #[cfg(feature = "logging")]
//!     let subs: Vec<Arc<dyn tagvisor::Subscribe>> = vec![Arc::new(tagvisor::LogWriter::default())];
//!     #[cfg(not(feature = "logging"))]
//!     let subs: Vec<Arc<dyn tagvisor::Subscribe>> = Vec::new();
//!
//!     let ctx = Context::builder(EngineConfig::default())
//!         .with_subscribers(subs)
//!         .build();
//!
//!     let analytics = Loader::new(&ctx, LoaderSpec::new("analytics").with_payload(|_| Ok(())));
//!     let pixel = Loader::new(&ctx, LoaderSpec::new("pixel").with_payload(|_| Ok(())));
//!     pixel.set_dependencies(vec![Arc::clone(&analytics)]).unwrap();
//!
//!     let container = Container::new(&ctx, "main", ContainerConfig::default());
//!     container.register_tags([pixel, analytics]);
//!     container.run();
//!
//!     let by_state = container.wait_settled().await;
//!     assert_eq!(by_state.ran.len(), 2);
//!     ctx.shutdown();
//! }
//! ```
mod container;
mod core;
mod error;
mod events;
mod filters;
mod host;
mod loader;
mod scheduler;
mod subscribers;

#[cfg(test)]
mod testing;

// ---- Public re-exports ----

pub use container::{Container, ContainerConfig, TagReport, TagsByState, TelemetryBatch};
pub use core::{Acquire, Context, ContextBuilder, EngineConfig, OutputLock, Registry};
pub use error::LoaderError;
pub use events::{Bus, Event, EventKind};
pub use filters::{
    Decision, Filter, FilterState, MatchFn, Polarity, SessionStarter, SessionTrigger, StateFn,
    evaluate,
};
pub use host::{
    Codec, Completion, IdentityCodec, Location, MemoryStore, NoTokens, NullSurface, NullTelemetry,
    OutputBuffer, Store, Surface, TelemetrySink, TokenResolver, TokenTable,
};
pub use loader::{
    Admission, AfterHook, BeforeHook, ErrorHook, FinishListener, Loader, LoaderId, LoaderSpec,
    LoaderState, Parameter, Parameters, Payload, Predicate, RunCommand, StateHistory, Timeout,
    Timestamps,
};
pub use scheduler::{Scheduler, SchedulerConfig, TaskHandle, TaskId, ThrottleLock, Throttled};
pub use subscribers::{Subscribe, SubscriberSet};

// Optional: expose a simple built-in logger subscriber (demo/reference).
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
