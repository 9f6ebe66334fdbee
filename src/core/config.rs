//! # Engine-wide configuration.
//!
//! Provides [`EngineConfig`] centralized settings for one [`Context`](crate::Context).
//!
//! Config is used in two ways:
//! 1. **Context creation**: `Context::builder(config)`
//! 2. **Loader defaults**: `LoaderSpec::new(name)` leaves the timeout unset and
//!    the loader inherits `default_timeout` when it is created.
//!
//! ## Sentinel values
//! - `dependency_poll = 0s` → clamped to 1ms
//! - `bus_capacity = 0` → clamped to 1

use std::time::Duration;

use crate::loader::Timeout;
use crate::scheduler::SchedulerConfig;

/// Global configuration for one orchestration context.
///
/// ## Field semantics
/// - `scheduler`: polling-loop settings shared by every component
/// - `dependency_poll`: cadence of readiness polling and output-lock waits
/// - `bus_capacity`: event bus ring buffer size (min 1)
/// - `default_timeout`: loader timeout when a spec does not set one
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,

    /// Interval between readiness checks while a loader waits on conditions
    /// without a completion event, and between output-lock retries.
    pub dependency_poll: Duration,

    /// Capacity of the event bus broadcast channel ring buffer.
    pub bus_capacity: usize,

    /// Default per-loader timeout budget.
    pub default_timeout: Timeout,
}

impl EngineConfig {
    /// Returns the polling cadence clamped to at least 1ms.
    #[inline]
    pub fn dependency_poll_clamped(&self) -> Duration {
        self.dependency_poll.max(Duration::from_millis(1))
    }

    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

impl Default for EngineConfig {
    /// Default configuration:
    ///
    /// - `scheduler = SchedulerConfig::default()` (30ms base, dynamic, 5ms fastest)
    /// - `dependency_poll = 65ms`
    /// - `bus_capacity = 1024`
    /// - `default_timeout = 5s`
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            dependency_poll: Duration::from_millis(65),
            bus_capacity: 1024,
            default_timeout: Timeout::Finite(Duration::from_secs(5)),
        }
    }
}
