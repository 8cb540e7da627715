//! Arc trigger dispatch.
//!
//! This module provides:
//!
//! - [`TriggerTarget`]: the outbound seam to whatever runs arc workloads
//! - [`TriggerPayload`]: the serializable trigger body
//! - [`ArcTriggerDispatcher`]: one trigger per `(arc, lot)`, retried on
//!   transient failure, surfaced to a [`FailedDispatchSink`] when exhausted
//! - [`memory::InMemoryTriggerTarget`]: in-memory target for tests
//!
//! ## Exactly one dispatch
//!
//! Before calling the target the dispatcher creates the dispatch record with
//! `DoesNotExist`, and each attempt bumps `attempt_count` with a CAS. A worker
//! that loses either write knows someone else owns the dispatch and reports
//! [`DispatchOutcome::Deduplicated`]. The target still sees at-least-once
//! delivery when a process dies between trigger and bookkeeping, so every
//! payload carries a stable idempotency key.

pub mod memory;
pub mod record;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use weir_core::clock::{to_chrono, Clock};
use weir_core::id::{ArcId, BoundaryId, LotKey};
use weir_core::observability::arc_span;
use weir_core::storage::{read_json, write_json, StorageBackend, Versioned, WritePrecondition};
use weir_core::storage_keys::{FailedDispatchKey, ManifestKey, StorageKey};

use crate::error::{Error, Result};
use crate::manifest::{ManifestRecord, ManifestStore};
use crate::metrics::EngineMetrics;
use crate::retry::RetryPolicy;
use crate::topology::{ArcDef, JoinPolicy, Topology};

use self::record::{CreateOutcome, DispatchRecord, DispatchRecordStore, DispatchState};

/// Body of a trigger invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPayload {
    /// Arc to run.
    pub arc_id: ArcId,
    /// Boundary whose lot completed.
    pub boundary_id: BoundaryId,
    /// Completed lot.
    pub lot_key: LotKey,
    /// Storage key of the lot's manifest.
    pub manifest_ref: String,
    /// Manifests of the other inputs of a joined arc.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_manifests: BTreeMap<BoundaryId, String>,
    /// Stable across attempts; targets deduplicate on it.
    pub idempotency_key: String,
    /// Attempt number (1-indexed).
    pub attempt: u32,
}

impl TriggerPayload {
    /// Returns the idempotency key for an arc and lot.
    #[must_use]
    pub fn idempotency_key_for(arc_id: &ArcId, boundary_id: &BoundaryId, lot_key: &LotKey) -> String {
        format!("{arc_id}:{boundary_id}:{lot_key}")
    }
}

/// Acceptance of a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerAck {
    /// Target-specific invocation id.
    pub invocation_id: String,
}

/// Failure reported by a [`TriggerTarget`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TriggerError {
    /// The target could not be reached; retrying may succeed.
    #[error("trigger target unavailable: {0}")]
    Unavailable(String),
    /// The target refused the trigger; retrying will not help.
    #[error("trigger rejected: {0}")]
    Rejected(String),
}

impl TriggerError {
    /// Returns true if the dispatch should be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Destination of arc triggers.
#[async_trait]
pub trait TriggerTarget: Send + Sync {
    /// Invokes the arc for a lot.
    async fn trigger(&self, payload: &TriggerPayload) -> std::result::Result<TriggerAck, TriggerError>;

    /// Returns the target's name for logs.
    fn target_name(&self) -> &str;
}

/// A dispatch that exhausted its retries or was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDispatch {
    /// Arc that failed to trigger.
    pub arc_id: ArcId,
    /// Triggering boundary.
    pub boundary_id: BoundaryId,
    /// Triggering lot.
    pub lot_key: LotKey,
    /// Manifest that should have been delivered.
    pub manifest_ref: String,
    /// Attempts made.
    pub attempts: u32,
    /// Last failure.
    pub last_error: String,
    /// When the dispatch was marked failed.
    pub failed_at: DateTime<Utc>,
}

impl FailedDispatch {
    /// Converts the failure into the matching engine error.
    #[must_use]
    pub fn to_error(&self) -> Error {
        Error::DispatchExhausted {
            arc_id: self.arc_id.to_string(),
            lot_key: self.lot_key.to_string(),
            attempts: self.attempts,
            last_error: self.last_error.clone(),
        }
    }
}

/// Operator queue for failed dispatches.
#[async_trait]
pub trait FailedDispatchSink: Send + Sync {
    /// Records a failed dispatch for operator attention.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is unavailable.
    async fn surface(&self, failed: &FailedDispatch) -> Result<()>;

    /// Removes an entry after it was re-driven.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is unavailable.
    async fn resolve(&self, arc_id: &ArcId, boundary_id: &BoundaryId, lot_key: &LotKey) -> Result<()>;

    /// Lists outstanding failed dispatches.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is unavailable.
    async fn list(&self) -> Result<Vec<FailedDispatch>>;
}

/// [`FailedDispatchSink`] storing entries under `operator/failed-dispatches/`.
pub struct StorageFailedDispatchSink<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
}

impl<S: StorageBackend + ?Sized> StorageFailedDispatchSink<S> {
    /// Creates a sink over `storage`.
    #[must_use]
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl<S: StorageBackend + ?Sized> FailedDispatchSink for StorageFailedDispatchSink<S> {
    async fn surface(&self, failed: &FailedDispatch) -> Result<()> {
        let key = FailedDispatchKey::lot(&failed.arc_id, &failed.boundary_id, &failed.lot_key);
        write_json(&*self.storage, key.path(), failed, WritePrecondition::None).await?;
        Ok(())
    }

    async fn resolve(&self, arc_id: &ArcId, boundary_id: &BoundaryId, lot_key: &LotKey) -> Result<()> {
        let key = FailedDispatchKey::lot(arc_id, boundary_id, lot_key);
        self.storage.delete(key.path()).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<FailedDispatch>> {
        let mut metas = self.storage.list(FailedDispatchKey::PREFIX).await?;
        metas.sort_by(|a, b| a.path.cmp(&b.path));
        let mut failed = Vec::with_capacity(metas.len());
        for meta in metas {
            if let Some(found) = read_json::<S, FailedDispatch>(&*self.storage, &meta.path).await? {
                failed.push(found.value);
            }
        }
        Ok(failed)
    }
}

/// Result of dispatching one arc for one lot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// This worker delivered the trigger.
    Dispatched {
        /// Arc triggered.
        arc_id: ArcId,
        /// Invocation id returned by the target.
        invocation_id: String,
        /// Attempts it took.
        attempts: u32,
    },
    /// Another worker owns (or finished) the dispatch.
    Deduplicated {
        /// Arc concerned.
        arc_id: ArcId,
        /// State of the existing record.
        state: DispatchState,
    },
    /// The dispatch failed permanently and was surfaced to operators.
    Failed {
        /// Arc concerned.
        arc_id: ArcId,
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        error: String,
    },
    /// A joined arc is waiting for other inputs.
    Waiting {
        /// Arc concerned.
        arc_id: ArcId,
        /// Required boundaries without a manifest for the lot.
        missing: Vec<BoundaryId>,
    },
}

impl DispatchOutcome {
    /// Arc the outcome refers to.
    #[must_use]
    pub fn arc_id(&self) -> &ArcId {
        match self {
            Self::Dispatched { arc_id, .. }
            | Self::Deduplicated { arc_id, .. }
            | Self::Failed { arc_id, .. }
            | Self::Waiting { arc_id, .. } => arc_id,
        }
    }

    /// Label used in metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Dispatched { .. } => "dispatched",
            Self::Deduplicated { .. } => "deduplicated",
            Self::Failed { .. } => "failed",
            Self::Waiting { .. } => "waiting",
        }
    }
}

/// Dispatches arc triggers for completed lots.
pub struct ArcTriggerDispatcher<S: StorageBackend + ?Sized> {
    topology: Arc<Topology>,
    records: DispatchRecordStore<S>,
    manifests: Arc<dyn ManifestStore>,
    target: Arc<dyn TriggerTarget>,
    failed: Arc<dyn FailedDispatchSink>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    stale_pending_after: Duration,
    metrics: EngineMetrics,
}

impl<S: StorageBackend + ?Sized> ArcTriggerDispatcher<S> {
    /// Creates a dispatcher.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topology: Arc<Topology>,
        records: DispatchRecordStore<S>,
        manifests: Arc<dyn ManifestStore>,
        target: Arc<dyn TriggerTarget>,
        failed: Arc<dyn FailedDispatchSink>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        stale_pending_after: Duration,
    ) -> Self {
        Self {
            topology,
            records,
            manifests,
            target,
            failed,
            clock,
            retry,
            stale_pending_after,
            metrics: EngineMetrics::new(),
        }
    }

    /// Dispatch record store shared with the lease layer.
    #[must_use]
    pub fn records(&self) -> &DispatchRecordStore<S> {
        &self.records
    }

    /// Operator queue of failed dispatches.
    #[must_use]
    pub fn failed_dispatches(&self) -> &Arc<dyn FailedDispatchSink> {
        &self.failed
    }

    /// Dispatches every arc subscribed to the manifest's boundary.
    ///
    /// Safe to call for the same manifest any number of times.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails. Trigger failures are reported as
    /// [`DispatchOutcome::Failed`], not as errors.
    pub async fn dispatch_completion(&self, manifest: &ManifestRecord) -> Result<Vec<DispatchOutcome>> {
        let mut outcomes = Vec::new();
        for arc in self.topology.subscribers(&manifest.boundary_id) {
            let span = arc_span(
                "dispatch",
                arc.id().as_str(),
                manifest.boundary_id.as_str(),
                manifest.lot_key.as_str(),
            );
            let outcome = self.dispatch_arc(arc, &manifest.lot_key).instrument(span).await?;
            self.metrics.record_dispatch(arc.id(), outcome.label());
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Re-drives a dispatch that nobody is working on.
    ///
    /// Accepts failed, abandoned and stale pending records, lapsed leases,
    /// and dispatched records no worker has leased (the trigger was accepted
    /// but never picked up). The attempt budget starts over. Records under a
    /// live lease or already consumed are left alone and reported as
    /// deduplicated.
    ///
    /// # Errors
    ///
    /// Returns [`weir_core::Error::NotFound`] if the arc or record does not
    /// exist, or an error if storage fails.
    pub async fn redrive(
        &self,
        arc_id: &ArcId,
        boundary_id: &BoundaryId,
        lot_key: &LotKey,
    ) -> Result<DispatchOutcome> {
        let arc = self
            .topology
            .arc(arc_id)
            .ok_or_else(|| weir_core::Error::NotFound(format!("arc '{arc_id}'")))?;
        let span = arc_span("redrive", arc_id.as_str(), boundary_id.as_str(), lot_key.as_str());
        async {
            let Some(Versioned { value: mut record, version }) =
                self.records.load(arc_id, boundary_id, lot_key).await?
            else {
                return Err(weir_core::Error::NotFound(format!(
                    "dispatch record for arc '{arc_id}' lot '{lot_key}'"
                ))
                .into());
            };

            if self.manifests.is_consumed(arc_id, boundary_id, lot_key).await? {
                self.failed.resolve(arc_id, boundary_id, lot_key).await?;
                return Ok(DispatchOutcome::Deduplicated {
                    arc_id: arc_id.clone(),
                    state: DispatchState::Consumed,
                });
            }

            let now = self.clock.now();
            let redrivable = match record.state {
                DispatchState::Failed | DispatchState::Abandoned => true,
                DispatchState::Pending => self.is_stale(&record, now),
                DispatchState::Leased => record.lease_expired(now),
                DispatchState::Dispatched => record.lease.is_none(),
                DispatchState::Consumed => false,
            };
            if !redrivable {
                return Ok(DispatchOutcome::Deduplicated {
                    arc_id: arc_id.clone(),
                    state: record.state,
                });
            }

            tracing::info!(previous_state = %record.state, "re-driving dispatch");
            record.state = DispatchState::Pending;
            record.attempt_count = 0;
            record.lease = None;
            record.last_error = None;
            let outcome = self.deliver(arc, record, version).await?;
            if !matches!(outcome, DispatchOutcome::Failed { .. }) {
                self.failed.resolve(arc_id, boundary_id, lot_key).await?;
            }
            self.metrics.record_dispatch(arc_id, outcome.label());
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    /// Returns true if a pending record has not been touched for longer than
    /// the stale threshold.
    #[must_use]
    pub fn is_stale(&self, record: &DispatchRecord, now: DateTime<Utc>) -> bool {
        record.state == DispatchState::Pending
            && record.updated_at + to_chrono(self.stale_pending_after) <= now
    }

    async fn dispatch_arc(&self, arc: &ArcDef, lot_key: &LotKey) -> Result<DispatchOutcome> {
        let arc_id = arc.id();
        let source = arc.source();

        if arc.join() == JoinPolicy::AllInputs {
            let mut missing = Vec::new();
            for boundary in arc.required_boundaries() {
                if self.manifests.get(boundary, lot_key).await?.is_none() {
                    missing.push(boundary.clone());
                }
            }
            if !missing.is_empty() {
                tracing::debug!(?missing, "join barrier waiting for inputs");
                return Ok(DispatchOutcome::Waiting {
                    arc_id: arc_id.clone(),
                    missing,
                });
            }
        }

        if self.manifests.is_consumed(arc_id, source, lot_key).await? {
            return Ok(DispatchOutcome::Deduplicated {
                arc_id: arc_id.clone(),
                state: DispatchState::Consumed,
            });
        }

        let now = self.clock.now();
        let record = DispatchRecord::pending(
            arc_id.clone(),
            source.clone(),
            lot_key.clone(),
            ManifestKey::lot(source, lot_key).path().to_string(),
            now,
        );
        if let CreateOutcome::Created { version } = self.records.create(&record).await? {
            return self.deliver(arc, record, version).await;
        }

        let Some(Versioned { value: existing, version }) =
            self.records.load(arc_id, source, lot_key).await?
        else {
            // Garbage-collected between create and load; the consumption
            // record is authoritative.
            return Ok(DispatchOutcome::Deduplicated {
                arc_id: arc_id.clone(),
                state: DispatchState::Consumed,
            });
        };
        if self.is_stale(&existing, now) {
            tracing::warn!(
                attempts = existing.attempt_count,
                "taking over stale pending dispatch"
            );
            return self.deliver(arc, existing, version).await;
        }
        if existing.state == DispatchState::Abandoned {
            tracing::info!("re-triggering abandoned dispatch");
            return self.deliver(arc, existing, version).await;
        }
        Ok(DispatchOutcome::Deduplicated {
            arc_id: arc_id.clone(),
            state: existing.state,
        })
    }

    fn payload(arc: &ArcDef, record: &DispatchRecord) -> TriggerPayload {
        let input_manifests = match arc.join() {
            JoinPolicy::SourceOnly => BTreeMap::new(),
            JoinPolicy::AllInputs => arc
                .inputs()
                .iter()
                .map(|input| {
                    let key = ManifestKey::lot(input, &record.lot_key);
                    (input.clone(), key.path().to_string())
                })
                .collect(),
        };
        TriggerPayload {
            arc_id: record.arc_id.clone(),
            boundary_id: record.boundary_id.clone(),
            lot_key: record.lot_key.clone(),
            manifest_ref: record.manifest_ref.clone(),
            input_manifests,
            idempotency_key: TriggerPayload::idempotency_key_for(
                &record.arc_id,
                &record.boundary_id,
                &record.lot_key,
            ),
            attempt: record.attempt_count,
        }
    }

    /// Runs the bounded retry loop for a record this worker may own.
    ///
    /// Every attempt is claimed with a CAS before the target is called; losing
    /// the claim means another worker took the dispatch over.
    async fn deliver(
        &self,
        arc: &ArcDef,
        mut record: DispatchRecord,
        mut version: String,
    ) -> Result<DispatchOutcome> {
        let arc_id = arc.id().clone();
        loop {
            record.attempt_count += 1;
            record.state = DispatchState::Pending;
            record.updated_at = self.clock.now();
            let Some(claimed) = self.records.replace(&record, &version).await? else {
                tracing::debug!("dispatch claimed by another worker");
                let state = self
                    .records
                    .load(&record.arc_id, &record.boundary_id, &record.lot_key)
                    .await?
                    .map_or(DispatchState::Consumed, |found| found.value.state);
                return Ok(DispatchOutcome::Deduplicated { arc_id, state });
            };
            version = claimed;

            let attempt = record.attempt_count;
            let payload = Self::payload(arc, &record);
            match self.target.trigger(&payload).await {
                Ok(ack) => {
                    record.state = DispatchState::Dispatched;
                    record.invocation_id = Some(ack.invocation_id.clone());
                    record.last_error = None;
                    record.updated_at = self.clock.now();
                    if self.records.replace(&record, &version).await?.is_none() {
                        // A worker leased the lot before the ack was recorded.
                        tracing::debug!("dispatch record advanced by lease holder");
                    }
                    tracing::info!(
                        trigger_target = self.target.target_name(),
                        invocation_id = %ack.invocation_id,
                        attempt,
                        "arc triggered"
                    );
                    return Ok(DispatchOutcome::Dispatched {
                        arc_id,
                        invocation_id: ack.invocation_id,
                        attempts: attempt,
                    });
                }
                Err(err) if err.is_transient() && self.retry.allows_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    record.last_error = Some(err.to_string());
                    self.metrics.record_dispatch_retry(&arc_id);
                    tracing::warn!(
                        error = %err,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "trigger failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    record.last_error = Some(err.to_string());
                    return self.fail(arc_id, record, &version).await;
                }
            }
        }
    }

    async fn fail(&self, arc_id: ArcId, mut record: DispatchRecord, version: &str) -> Result<DispatchOutcome> {
        let now = self.clock.now();
        let last_error = record.last_error.clone().unwrap_or_default();
        record.state = DispatchState::Failed;
        record.updated_at = now;
        if self.records.replace(&record, version).await?.is_none() {
            tracing::debug!("dispatch record changed before it could be marked failed");
        }

        let failed = FailedDispatch {
            arc_id: arc_id.clone(),
            boundary_id: record.boundary_id.clone(),
            lot_key: record.lot_key.clone(),
            manifest_ref: record.manifest_ref.clone(),
            attempts: record.attempt_count,
            last_error: last_error.clone(),
            failed_at: now,
        };
        self.failed.surface(&failed).await?;
        tracing::error!(error = %failed.to_error(), "dispatch failed; surfaced to operator queue");

        Ok(DispatchOutcome::Failed {
            arc_id,
            attempts: record.attempt_count,
            error: last_error,
        })
    }
}
