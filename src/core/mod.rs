//! Orchestration core: the context every component runs in.
//!
//! Internal modules:
//! - [`config`]: engine-wide settings;
//! - [`context`]: the shared [`Context`] replacing global registries;
//! - [`builder`]: wires collaborators and subscribers into a context;
//! - [`output_lock`]: mutual exclusion for the shared output channel;
//! - [`registry`]: live loaders and id allocation.

mod builder;
mod config;
mod context;
mod output_lock;
mod registry;

pub use builder::ContextBuilder;
pub use config::EngineConfig;
pub use context::Context;
pub use output_lock::{Acquire, OutputLock};
pub use registry::Registry;
