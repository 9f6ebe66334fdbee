//! # Outbound telemetry contract.

use crate::container::TelemetryBatch;

/// Best-effort, fire-and-forget delivery of telemetry batches.
pub trait TelemetrySink: Send + Sync + 'static {
    /// Hands a batch to the sink. Must not block.
    fn send(&self, batch: TelemetryBatch);
}

/// Sink that discards every batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn send(&self, _batch: TelemetryBatch) {}
}
