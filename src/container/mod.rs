//! # Batch orchestration of tags.
//!
//! - [`Container`] admits registered loaders as one batch, waits for the batch
//!   to settle and reports outcomes.
//! - [`ContainerConfig`] holds the per-container knobs.
//! - [`TagsByState`], [`TagReport`] and [`TelemetryBatch`] are the reports it produces.

mod config;
mod container;
mod overrides;
mod report;

pub use config::ContainerConfig;
pub use container::Container;
pub use report::{TagReport, TagsByState, TelemetryBatch};
