//! # Scheduler configuration.
//!
//! ## Sentinel values
//! - `fastest_rate = 0s` → clamped to 1ms (a zero-length sleep would spin)

use std::time::Duration;

/// Polling-loop settings for the [`Scheduler`](crate::Scheduler).
///
/// ## Field semantics
/// - `base_rate`: how often the loop wakes when nothing asks for more
/// - `dynamic`: adapt the rate to half of the smallest delay registered
/// - `fastest_rate`: lower bound for the adapted rate
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Default wake-up interval of the polling loop.
    pub base_rate: Duration,

    /// Enables rate adaptation.
    ///
    /// When `true`, registering a task with delay `d` lowers the loop rate to
    /// `max(d / 2, fastest_rate)` if that is more frequent than the current
    /// rate. The adapted rate is reset to `base_rate` when the loop stops.
    pub dynamic: bool,

    /// The most frequent rate dynamic mode may adapt to.
    pub fastest_rate: Duration,
}

impl SchedulerConfig {
    /// Returns `fastest_rate` clamped to at least 1ms.
    #[inline]
    pub fn fastest_rate_clamped(&self) -> Duration {
        self.fastest_rate.max(Duration::from_millis(1))
    }

    /// Returns `base_rate` clamped to at least the fastest rate.
    #[inline]
    pub fn base_rate_clamped(&self) -> Duration {
        self.base_rate.max(self.fastest_rate_clamped())
    }
}

impl Default for SchedulerConfig {
    /// Default configuration:
    ///
    /// - `base_rate = 30ms`
    /// - `dynamic = true`
    /// - `fastest_rate = 5ms`
    fn default() -> Self {
        Self {
            base_rate: Duration::from_millis(30),
            dynamic: true,
            fastest_rate: Duration::from_millis(5),
        }
    }
}
