//! Loaders: declaration, lifecycle and admission.
//!
//! ## Contents
//! - [`LoaderSpec`] fluent declaration of one loader
//! - [`Loader`] the schedulable unit and its public controls
//! - [`LoaderState`], [`StateHistory`] phases and their append-only log
//! - [`Timeout`] budgets and the dependency cascade
//! - [`Admission`] outcome of a filtered run
//!
//! Phases are split by concern: `dependencies` (waiting), `execution`
//! (output lock through payload) and `admission` (filters).

mod admission;
mod dependencies;
mod execution;
mod loader;
mod spec;
mod state;
mod timeout;

pub use admission::Admission;
pub use loader::{FinishListener, Loader, LoaderId, RunCommand, Timestamps};
pub use spec::{
    AfterHook, BeforeHook, ErrorHook, LoaderSpec, Parameter, Parameters, Payload, Predicate,
};
pub use state::{LoaderState, StateHistory};
pub use timeout::Timeout;
