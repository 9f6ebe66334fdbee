//! Cooperative scheduling: one polling loop, cancellable handles, throttles.
//!
//! ## Contents
//! - [`Scheduler`] the delay multiplexer every component waits through
//! - [`TaskHandle`] cancellable handle returned by each `schedule` call
//! - [`ThrottleLock`], [`Throttled`] lossy and coalescing throttles
//! - [`SchedulerConfig`] base rate, dynamic adaptation, fastest rate

mod config;
mod handle;
mod scheduler;
mod throttle;

pub use config::SchedulerConfig;
pub use handle::{TaskHandle, TaskId};
pub use scheduler::Scheduler;
pub use throttle::{ThrottleLock, Throttled};
