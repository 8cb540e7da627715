//! Engine facade: wires the normalizer, resolver, tracker, dispatcher and
//! lease layer into the event-processing control flow.
//!
//! ```text
//! payload -> normalize -> dedup check -> resolve -> observe/evaluate
//!         -> (lot closed) dispatch subscribed arcs -> mark event seen
//! ```
//!
//! Every event is processed independently. A malformed, unresolved or
//! failing event is reported in the [`BatchReport`] and never stops the rest
//! of the batch.

mod arc;
mod sweep;

pub use self::arc::{ArcCompletion, ArcState, SinkOutput};
pub use self::sweep::SweepReport;

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde_json::Value;
use weir_core::clock::{Clock, SystemClock};
use weir_core::id::{EventId, LotKey};
use weir_core::storage::StorageBackend;

use crate::config::EngineConfig;
use crate::dedup::EventDeduplicator;
use crate::dispatch::record::DispatchRecordStore;
use crate::dispatch::{
    ArcTriggerDispatcher, DispatchOutcome, FailedDispatchSink, StorageFailedDispatchSink,
    TriggerTarget,
};
use crate::error::{Error, Result, UnresolvedReason};
use crate::event::{
    normalize_payload, normalize_records, MalformedRecord, NormalizedBatch, ObjectEvent,
    SkippedRecord,
};
use crate::lease::LeaseLayer;
use crate::manifest::{ManifestRecord, ManifestStore, StorageManifestStore};
use crate::metrics::EngineMetrics;
use crate::resolver::resolve;
use crate::retry::with_retry;
use crate::topology::Topology;
use crate::tracker::{CompletionTracker, Evaluation};

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// The event id was already processed within the dedup window.
    Duplicate,
    /// The event could not be placed in a lot and was ignored.
    Ignored {
        /// Why it was not resolved.
        reason: UnresolvedReason,
    },
    /// The object was recorded; its lot is still open.
    Pending {
        /// Lot of the object.
        lot_key: LotKey,
        /// Distinct objects observed in the lot.
        observed: usize,
    },
    /// This event closed its lot.
    Completed {
        /// The manifest written.
        manifest: ManifestRecord,
        /// Dispatch outcome per subscribed arc.
        dispatches: Vec<DispatchOutcome>,
    },
    /// The lot was already closed.
    AlreadyComplete {
        /// Lot of the object.
        lot_key: LotKey,
        /// True if the object is not part of the manifest.
        late_arrival: bool,
        /// Dispatch outcome per subscribed arc.
        dispatches: Vec<DispatchOutcome>,
    },
}

impl EventOutcome {
    /// Label used in logs, metrics and event markers.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::Ignored { .. } => "ignored",
            Self::Pending { .. } => "pending",
            Self::Completed { .. } => "completed",
            Self::AlreadyComplete { .. } => "already_complete",
        }
    }
}

/// Outcome of one successfully processed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventReport {
    /// Processed event.
    pub event_id: EventId,
    /// What happened.
    pub outcome: EventOutcome,
}

/// An event whose processing failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedEvent {
    /// Failed event.
    pub event_id: EventId,
    /// Failure description.
    pub error: String,
    /// True if redelivering the event may succeed.
    pub retryable: bool,
}

/// Per-record results of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Processed events, in batch order.
    pub outcomes: Vec<EventReport>,
    /// Records rejected as malformed.
    pub malformed: Vec<MalformedRecord>,
    /// Records skipped on purpose.
    pub skipped: Vec<SkippedRecord>,
    /// Events whose processing failed.
    pub failed: Vec<FailedEvent>,
}

impl BatchReport {
    /// Event ids the substrate should redeliver.
    pub fn retryable_event_ids(&self) -> impl Iterator<Item = &EventId> {
        self.failed
            .iter()
            .filter(|failed| failed.retryable)
            .map(|failed| &failed.event_id)
    }

    /// Manifests written by this batch.
    pub fn completed(&self) -> impl Iterator<Item = &ManifestRecord> {
        self.outcomes.iter().filter_map(|report| match &report.outcome {
            EventOutcome::Completed { manifest, .. } => Some(manifest),
            _ => None,
        })
    }

    /// Dispatch outcomes produced by this batch.
    pub fn dispatches(&self) -> impl Iterator<Item = &DispatchOutcome> {
        self.outcomes.iter().flat_map(|report| match &report.outcome {
            EventOutcome::Completed { dispatches, .. }
            | EventOutcome::AlreadyComplete { dispatches, .. } => dispatches.as_slice(),
            _ => Default::default(),
        })
    }

    /// Number of events with the given outcome label.
    #[must_use]
    pub fn count(&self, label: &str) -> usize {
        self.outcomes
            .iter()
            .filter(|report| report.outcome.label() == label)
            .count()
    }
}

/// The completion and triggering engine.
pub struct Engine<S: StorageBackend + ?Sized> {
    config: EngineConfig,
    topology: Arc<Topology>,
    clock: Arc<dyn Clock>,
    manifests: Arc<dyn ManifestStore>,
    tracker: CompletionTracker<S>,
    dispatcher: ArcTriggerDispatcher<S>,
    leases: LeaseLayer<S>,
    dedup: EventDeduplicator<S>,
    metrics: EngineMetrics,
}

/// Builder for [`Engine`].
pub struct EngineBuilder<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    topology: Arc<Topology>,
    target: Arc<dyn TriggerTarget>,
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    manifests: Option<Arc<dyn ManifestStore>>,
    failed_sink: Option<Arc<dyn FailedDispatchSink>>,
}

impl<S: StorageBackend + ?Sized> EngineBuilder<S> {
    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the clock (defaults to the system clock).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Uses a custom manifest store instead of one over the engine storage.
    #[must_use]
    pub fn manifest_store(mut self, manifests: Arc<dyn ManifestStore>) -> Self {
        self.manifests = Some(manifests);
        self
    }

    /// Uses a custom operator queue instead of one over the engine storage.
    #[must_use]
    pub fn failed_dispatch_sink(mut self, sink: Arc<dyn FailedDispatchSink>) -> Self {
        self.failed_sink = Some(sink);
        self
    }

    /// Validates the configuration and builds the engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is inconsistent.
    pub fn build(self) -> Result<Engine<S>> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let manifests = self.manifests.unwrap_or_else(|| {
            Arc::new(StorageManifestStore::new(
                Arc::clone(&self.storage),
                Arc::clone(&clock),
            ))
        });
        let failed_sink = self.failed_sink.unwrap_or_else(|| {
            Arc::new(StorageFailedDispatchSink::new(Arc::clone(&self.storage)))
        });
        let records = DispatchRecordStore::new(Arc::clone(&self.storage));

        let tracker = CompletionTracker::new(
            Arc::clone(&self.storage),
            Arc::clone(&manifests),
            Arc::clone(&clock),
        )
        .with_cas_attempts(self.config.cas_max_attempts);
        let dispatcher = ArcTriggerDispatcher::new(
            Arc::clone(&self.topology),
            records.clone(),
            Arc::clone(&manifests),
            self.target,
            Arc::clone(&failed_sink),
            Arc::clone(&clock),
            self.config.dispatch_retry,
            self.config.stale_pending_after,
        );
        let leases = LeaseLayer::new(records, Arc::clone(&manifests), Arc::clone(&clock))
            .with_failed_dispatch_sink(failed_sink)
            .with_cas_attempts(self.config.cas_max_attempts);
        let dedup = EventDeduplicator::new(
            Arc::clone(&self.storage),
            Arc::clone(&clock),
            self.config.dedup_window,
        );

        tracing::info!(
            boundaries = self.topology.boundaries().count(),
            arcs = self.topology.arcs().count(),
            "engine ready"
        );
        Ok(Engine {
            config: self.config,
            topology: self.topology,
            clock,
            manifests,
            tracker,
            dispatcher,
            leases,
            dedup,
            metrics: EngineMetrics::new(),
        })
    }
}

impl<S: StorageBackend + ?Sized> Engine<S> {
    /// Starts building an engine over `storage`.
    #[must_use]
    pub fn builder(
        storage: Arc<S>,
        topology: Arc<Topology>,
        target: Arc<dyn TriggerTarget>,
    ) -> EngineBuilder<S> {
        EngineBuilder {
            storage,
            topology,
            target,
            config: EngineConfig::default(),
            clock: None,
            manifests: None,
            failed_sink: None,
        }
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Loaded topology.
    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Manifest store.
    #[must_use]
    pub fn manifests(&self) -> &Arc<dyn ManifestStore> {
        &self.manifests
    }

    /// Completion tracker.
    #[must_use]
    pub fn tracker(&self) -> &CompletionTracker<S> {
        &self.tracker
    }

    /// Arc trigger dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &ArcTriggerDispatcher<S> {
        &self.dispatcher
    }

    /// Lease layer for arc workers.
    #[must_use]
    pub fn leases(&self) -> &LeaseLayer<S> {
        &self.leases
    }

    /// Processes a raw notification payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedEvent`] only if the payload as a whole is
    /// unreadable. Per-record problems land in the report.
    pub async fn process_payload(&self, payload: &[u8]) -> Result<BatchReport> {
        let batch = normalize_payload(payload)?;
        Ok(self.process_batch(batch).await)
    }

    /// Processes already-parsed notification records.
    pub async fn process_records(&self, records: &[Value]) -> BatchReport {
        self.process_batch(normalize_records(records)).await
    }

    /// Processes one normalized event, retrying transient store failures.
    ///
    /// # Errors
    ///
    /// Returns the last error once the store retry budget is exhausted, or
    /// the first non-transient error.
    pub async fn process_event(&self, event: &ObjectEvent) -> Result<EventOutcome> {
        let outcome = with_retry(&self.config.store_retry, "process_event", || {
            self.process_event_once(event)
        })
        .await?;
        self.metrics.record_event(outcome.label());
        Ok(outcome)
    }

    async fn process_batch(&self, batch: NormalizedBatch) -> BatchReport {
        let started = Instant::now();
        let NormalizedBatch {
            events,
            malformed,
            skipped,
        } = batch;
        for _ in &malformed {
            self.metrics.record_event("malformed");
        }
        for _ in &skipped {
            self.metrics.record_event("skipped");
        }

        let results: Vec<(EventId, Result<EventOutcome>)> = stream::iter(events.iter())
            .map(|event| async move { (event.event_id.clone(), self.process_event(event).await) })
            .buffered(self.config.max_concurrency)
            .collect()
            .await;

        let mut report = BatchReport {
            malformed,
            skipped,
            ..BatchReport::default()
        };
        for (event_id, result) in results {
            match result {
                Ok(outcome) => report.outcomes.push(EventReport { event_id, outcome }),
                Err(e) => {
                    tracing::warn!(event_id = %event_id, error = %e, "event processing failed");
                    self.metrics.record_event("failed");
                    report.failed.push(FailedEvent {
                        event_id,
                        retryable: e.is_transient(),
                        error: e.to_string(),
                    });
                }
            }
        }

        self.metrics.observe_batch_duration(started.elapsed());
        tracing::debug!(
            processed = report.outcomes.len(),
            malformed = report.malformed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "batch processed"
        );
        report
    }

    async fn process_event_once(&self, event: &ObjectEvent) -> Result<EventOutcome> {
        if self.dedup.is_seen(&event.event_id).await? {
            tracing::debug!(event_id = %event.event_id, "duplicate event");
            return Ok(EventOutcome::Duplicate);
        }

        let resolved = match resolve(&self.topology, event) {
            Ok(resolved) => resolved,
            Err(Error::UnresolvedLot { reason, .. }) => {
                tracing::info!(
                    event_id = %event.event_id,
                    boundary_id = %event.boundary_id,
                    path = %event.path,
                    %reason,
                    "ignoring unresolved event"
                );
                let outcome = EventOutcome::Ignored { reason };
                self.dedup.mark_seen(&event.event_id, outcome.label()).await?;
                return Ok(outcome);
            }
            Err(e) => return Err(e),
        };
        let boundary = self.topology.boundary(&resolved.boundary_id).ok_or_else(|| {
            Error::UnresolvedLot {
                boundary_id: resolved.boundary_id.to_string(),
                path: resolved.path.clone(),
                reason: UnresolvedReason::UnknownBoundary,
            }
        })?;

        let observation = self.tracker.observe(boundary, &resolved).await?;
        let outcome = match observation.evaluation {
            Evaluation::Pending { observed } => EventOutcome::Pending {
                lot_key: resolved.lot_key,
                observed,
            },
            Evaluation::Completed(manifest) => {
                let dispatches = self.dispatcher.dispatch_completion(&manifest).await?;
                EventOutcome::Completed {
                    manifest,
                    dispatches,
                }
            }
            Evaluation::AlreadyComplete(manifest) => {
                let dispatches = self.dispatcher.dispatch_completion(&manifest).await?;
                EventOutcome::AlreadyComplete {
                    lot_key: resolved.lot_key,
                    late_arrival: observation.late_arrival,
                    dispatches,
                }
            }
        };

        self.dedup.mark_seen(&event.event_id, outcome.label()).await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::memory::InMemoryTriggerTarget;
    use crate::topology::TopologyDecl;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use weir_core::clock::ManualClock;
    use weir_core::storage::MemoryBackend;

    const TOPOLOGY: &str = r"
boundaries:
  - id: raw
    path_pattern: raw/{date}
    completeness_policy: { kind: count, count: 2 }
  - id: clean
    path_pattern: clean/{date}
    completeness_policy: { kind: count, count: 1 }
arcs:
  - id: cleanse
    source_boundary_id: raw
    sink_boundary_ids: [clean]
";

    fn engine() -> (Engine<MemoryBackend>, Arc<InMemoryTriggerTarget>) {
        let topology =
            Arc::new(Topology::load(&TopologyDecl::from_yaml_str(TOPOLOGY).unwrap()).unwrap());
        let target = Arc::new(InMemoryTriggerTarget::new("test"));
        let engine = Engine::builder(Arc::new(MemoryBackend::new()), topology, target.clone())
            .clock(Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            )))
            .build()
            .unwrap();
        (engine, target)
    }

    fn record(id: &str, path: &str) -> Value {
        json!({
            "boundary_id": "raw",
            "path": path,
            "size": 10,
            "event_time": "2024-01-01T00:00:00Z",
            "event_id": id,
        })
    }

    #[tokio::test]
    async fn batch_isolates_bad_records() {
        let (engine, target) = engine();
        let report = engine
            .process_records(&[
                record("e1", "raw/2024-01-01/a.csv"),
                json!({"path": "raw/2024-01-01/x.csv"}),
                record("e2", "tmp/ignored.csv"),
                record("e3", "raw/2024-01-01/"),
                record("e4", "raw/2024-01-01/b.csv"),
            ])
            .await;

        assert_eq!(report.malformed.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert!(report.failed.is_empty());
        assert_eq!(report.count("ignored"), 1);
        assert_eq!(report.completed().count(), 1);
        assert_eq!(target.call_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn redelivered_event_is_duplicate() {
        let (engine, _) = engine();
        let payload = serde_json::to_vec(&json!([record("e1", "raw/2024-01-01/a.csv")])).unwrap();

        let first = engine.process_payload(&payload).await.unwrap();
        assert_eq!(first.count("pending"), 1);
        let second = engine.process_payload(&payload).await.unwrap();
        assert_eq!(second.count("duplicate"), 1);
    }

    #[tokio::test]
    async fn unreadable_payload_is_rejected() {
        let (engine, _) = engine();
        let err = engine.process_payload(b"not json").await.unwrap_err();
        assert!(matches!(err, Error::MalformedEvent { .. }));
    }
}
