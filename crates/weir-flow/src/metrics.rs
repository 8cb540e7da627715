//! Engine metrics.
//!
//! Recorded through the `metrics` facade; without an installed recorder
//! every call is a no-op.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `weir_events_total` | Counter | `outcome` | Events processed by outcome |
//! | `weir_lots_completed_total` | Counter | `boundary`, `state` | Manifests created |
//! | `weir_late_arrivals_total` | Counter | `boundary` | Objects seen after their lot closed |
//! | `weir_dispatches_total` | Counter | `arc`, `result` | Dispatch outcomes per arc |
//! | `weir_dispatch_retries_total` | Counter | `arc` | Transient dispatch failures retried |
//! | `weir_lease_acquisitions_total` | Counter | `result` | Lease acquire outcomes |
//! | `weir_consumptions_total` | Counter | `result` | Consumption record outcomes |
//! | `weir_batch_duration_seconds` | Histogram | - | Time to process one batch |
//! | `weir_failed_dispatches` | Gauge | - | Failed dispatches awaiting operators |

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use weir_core::id::{ArcId, BoundaryId};

use crate::manifest::ManifestState;

/// Metric names.
pub mod names {
    /// Events processed by outcome.
    pub const EVENTS_TOTAL: &str = "weir_events_total";
    /// Manifests created.
    pub const LOTS_COMPLETED_TOTAL: &str = "weir_lots_completed_total";
    /// Objects observed after their lot closed.
    pub const LATE_ARRIVALS_TOTAL: &str = "weir_late_arrivals_total";
    /// Dispatch outcomes.
    pub const DISPATCHES_TOTAL: &str = "weir_dispatches_total";
    /// Retried dispatch attempts.
    pub const DISPATCH_RETRIES_TOTAL: &str = "weir_dispatch_retries_total";
    /// Lease acquire outcomes.
    pub const LEASE_ACQUISITIONS_TOTAL: &str = "weir_lease_acquisitions_total";
    /// Consumption outcomes.
    pub const CONSUMPTIONS_TOTAL: &str = "weir_consumptions_total";
    /// Finished arc runs.
    pub const ARCS_COMPLETED_TOTAL: &str = "weir_arcs_completed_total";
    /// Batch processing time.
    pub const BATCH_DURATION_SECONDS: &str = "weir_batch_duration_seconds";
    /// Failed dispatches in the operator queue.
    pub const FAILED_DISPATCHES: &str = "weir_failed_dispatches";
}

/// Label keys.
pub mod labels {
    /// Event outcome.
    pub const OUTCOME: &str = "outcome";
    /// Boundary name.
    pub const BOUNDARY: &str = "boundary";
    /// Arc name.
    pub const ARC: &str = "arc";
    /// Manifest state.
    pub const STATE: &str = "state";
    /// Operation result.
    pub const RESULT: &str = "result";
}

/// Handle for recording engine metrics. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics;

impl EngineMetrics {
    /// Creates a metrics handle.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Counts a processed event.
    pub fn record_event(&self, outcome: &'static str) {
        counter!(names::EVENTS_TOTAL, labels::OUTCOME => outcome).increment(1);
    }

    /// Counts a created manifest.
    pub fn record_lot_completed(&self, boundary: &BoundaryId, state: ManifestState) {
        counter!(
            names::LOTS_COMPLETED_TOTAL,
            labels::BOUNDARY => boundary.to_string(),
            labels::STATE => state.as_str(),
        )
        .increment(1);
    }

    /// Counts an object that arrived after its lot closed.
    pub fn record_late_arrival(&self, boundary: &BoundaryId) {
        counter!(names::LATE_ARRIVALS_TOTAL, labels::BOUNDARY => boundary.to_string())
            .increment(1);
    }

    /// Counts a dispatch outcome.
    pub fn record_dispatch(&self, arc: &ArcId, result: &'static str) {
        counter!(
            names::DISPATCHES_TOTAL,
            labels::ARC => arc.to_string(),
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Counts a retried dispatch attempt.
    pub fn record_dispatch_retry(&self, arc: &ArcId) {
        counter!(names::DISPATCH_RETRIES_TOTAL, labels::ARC => arc.to_string()).increment(1);
    }

    /// Counts a lease acquire outcome.
    pub fn record_lease(&self, result: &'static str) {
        counter!(names::LEASE_ACQUISITIONS_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Counts a consumption outcome.
    pub fn record_consumption(&self, result: &'static str) {
        counter!(names::CONSUMPTIONS_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Counts a finished arc run.
    pub fn record_arc_completed(&self, arc: &ArcId, state: &'static str) {
        counter!(
            names::ARCS_COMPLETED_TOTAL,
            labels::ARC => arc.to_string(),
            labels::STATE => state,
        )
        .increment(1);
    }

    /// Records how long a batch took.
    pub fn observe_batch_duration(&self, duration: Duration) {
        histogram!(names::BATCH_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Sets the size of the operator queue.
    #[allow(clippy::cast_precision_loss)] // Queue sizes are small
    pub fn set_failed_dispatches(&self, count: usize) {
        gauge!(names::FAILED_DISPATCHES).set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_noop() {
        let metrics = EngineMetrics::new();
        let arc = ArcId::new("clean").unwrap();
        metrics.record_event("completed");
        metrics.record_lot_completed(&BoundaryId::new("raw").unwrap(), ManifestState::Complete);
        metrics.record_dispatch(&arc, "dispatched");
        metrics.record_dispatch_retry(&arc);
        metrics.record_lease("leased");
        metrics.record_consumption("recorded");
        metrics.record_arc_completed(&arc, "complete");
        metrics.observe_batch_duration(Duration::from_millis(5));
        metrics.set_failed_dispatches(0);
    }

    #[test]
    fn metric_names_share_prefix() {
        for name in [
            names::EVENTS_TOTAL,
            names::LOTS_COMPLETED_TOTAL,
            names::DISPATCHES_TOTAL,
            names::LEASE_ACQUISITIONS_TOTAL,
            names::ARCS_COMPLETED_TOTAL,
            names::FAILED_DISPATCHES,
        ] {
            assert!(name.starts_with("weir_"));
        }
    }
}
