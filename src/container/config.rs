//! # Container configuration.
//!
//! ## Sentinel values
//! - `settle_poll = 0s` → clamped to 1ms
//! - `max_telemetry_interval = 0s` → every finish flushes immediately

use std::borrow::Cow;
use std::time::Duration;

/// Settings of one [`Container`](crate::Container).
///
/// ## Field semantics
/// - `max_telemetry_interval`: at most one telemetry batch per window
/// - `settle_poll`: cadence of the "has the batch settled?" check
/// - `settle_ceiling`: a batch counts as settled after this long regardless
/// - `consent_required`: every tag needs consent, not only those declaring it
/// - `override_key`: store key listing disabled tags that may run anyway
#[derive(Clone, Debug)]
pub struct ContainerConfig {
    /// Coalescing window of the telemetry throttle.
    pub max_telemetry_interval: Duration,

    /// Interval between settle checks.
    pub settle_poll: Duration,

    /// Global ceiling on waiting for a batch to settle.
    pub settle_ceiling: Duration,

    /// Requires consent for every tag of the container.
    pub consent_required: bool,

    /// Store key of the override token.
    pub override_key: Cow<'static, str>,
}

impl ContainerConfig {
    /// Returns the settle cadence clamped to at least 1ms.
    #[inline]
    pub fn settle_poll_clamped(&self) -> Duration {
        self.settle_poll.max(Duration::from_millis(1))
    }
}

impl Default for ContainerConfig {
    /// Default configuration:
    ///
    /// - `max_telemetry_interval = 1s`
    /// - `settle_poll = 100ms`
    /// - `settle_ceiling = 15s`
    /// - `consent_required = false`
    /// - `override_key = "tagvisor.overrides"`
    fn default() -> Self {
        Self {
            max_telemetry_interval: Duration::from_secs(1),
            settle_poll: Duration::from_millis(100),
            settle_ceiling: Duration::from_secs(15),
            consent_required: false,
            override_key: Cow::Borrowed("tagvisor.overrides"),
        }
    }
}
