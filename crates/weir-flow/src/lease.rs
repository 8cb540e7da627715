//! Lease layer: at most one in-flight processing attempt per arc and lot.
//!
//! Leases live on the dispatch record (see [`crate::dispatch::record`]), so
//! granting one is a `MatchesVersion` CAS on the same object the dispatcher
//! writes. Each grant bumps a fencing sequence; a holder whose lease lapsed
//! and was re-granted holds a lower sequence than the new holder.
//!
//! Consumption is checked before every grant and again right after it. The
//! first check keeps a completed-but-unreleased attempt from being redone;
//! the second closes the window where the previous holder records
//! consumption while the grant is in flight.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::Instrument;
use weir_core::clock::{to_chrono, Clock};
use weir_core::id::{ArcId, BoundaryId, LeaseToken, LotKey};
use weir_core::observability::arc_span;
use weir_core::storage::{StorageBackend, Versioned};
use weir_core::storage_keys::{DispatchKey, ManifestKey, StorageKey};

use crate::dispatch::record::{
    CreateOutcome, DispatchRecord, DispatchRecordStore, DispatchState, LeaseInfo,
};
use crate::dispatch::FailedDispatchSink;
use crate::error::{Error, Result};
use crate::manifest::{ConsumptionResult, ManifestStore};
use crate::metrics::EngineMetrics;
use crate::tracker::DEFAULT_CAS_ATTEMPTS;

/// Default lease TTL (5 minutes).
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);

/// A granted lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Leased arc.
    pub arc_id: ArcId,
    /// Boundary of the leased lot.
    pub boundary_id: BoundaryId,
    /// Leased lot.
    pub lot_key: LotKey,
    /// Token proving ownership.
    pub token: LeaseToken,
    /// Worker holding the lease.
    pub holder_id: String,
    /// When the lease lapses unless renewed.
    pub expires_at: DateTime<Utc>,
    /// Fencing sequence of this grant.
    pub fencing_sequence: u64,
}

/// Outcome of [`LeaseLayer::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireResult {
    /// The caller now holds the lease.
    Leased(Lease),
    /// Another worker holds an unexpired lease.
    AlreadyLeased {
        /// Current holder.
        holder_id: String,
        /// When the current lease lapses.
        expires_at: DateTime<Utc>,
    },
    /// The arc already consumed the lot.
    AlreadyConsumed,
}

impl AcquireResult {
    /// Label used in metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Leased(_) => "leased",
            Self::AlreadyLeased { .. } => "already_leased",
            Self::AlreadyConsumed => "already_consumed",
        }
    }

    /// Returns the lease if one was granted.
    #[must_use]
    pub fn into_lease(self) -> Option<Lease> {
        match self {
            Self::Leased(lease) => Some(lease),
            _ => None,
        }
    }
}

/// Conditional-write leases over dispatch records.
pub struct LeaseLayer<S: StorageBackend + ?Sized> {
    records: DispatchRecordStore<S>,
    manifests: Arc<dyn ManifestStore>,
    clock: Arc<dyn Clock>,
    failed: Option<Arc<dyn FailedDispatchSink>>,
    max_cas_attempts: u32,
    metrics: EngineMetrics,
}

impl<S: StorageBackend + ?Sized> LeaseLayer<S> {
    /// Creates a lease layer.
    #[must_use]
    pub fn new(
        records: DispatchRecordStore<S>,
        manifests: Arc<dyn ManifestStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            records,
            manifests,
            clock,
            failed: None,
            max_cas_attempts: DEFAULT_CAS_ATTEMPTS,
            metrics: EngineMetrics::new(),
        }
    }

    /// Overrides the CAS attempt budget.
    #[must_use]
    pub fn with_cas_attempts(mut self, attempts: u32) -> Self {
        self.max_cas_attempts = attempts.max(1);
        self
    }

    /// Clears operator queue entries of dispatches that end up consumed.
    ///
    /// A failed dispatch can still be leased by a worker that learned of
    /// the lot another way; once it consumes the lot the entry is moot.
    #[must_use]
    pub fn with_failed_dispatch_sink(mut self, sink: Arc<dyn FailedDispatchSink>) -> Self {
        self.failed = Some(sink);
        self
    }

    /// Tries to take the lease for an arc and lot.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the record stays contended.
    pub async fn acquire(
        &self,
        arc_id: &ArcId,
        boundary_id: &BoundaryId,
        lot_key: &LotKey,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<AcquireResult> {
        let span = arc_span("lease_acquire", arc_id.as_str(), boundary_id.as_str(), lot_key.as_str());
        let result = self
            .try_acquire(arc_id, boundary_id, lot_key, holder_id, ttl)
            .instrument(span)
            .await?;
        self.metrics.record_lease(result.label());
        Ok(result)
    }

    async fn try_acquire(
        &self,
        arc_id: &ArcId,
        boundary_id: &BoundaryId,
        lot_key: &LotKey,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<AcquireResult> {
        if self.manifests.is_consumed(arc_id, boundary_id, lot_key).await? {
            return Ok(AcquireResult::AlreadyConsumed);
        }

        for _ in 0..self.max_cas_attempts {
            let now = self.clock.now();
            let granted = match self.records.load(arc_id, boundary_id, lot_key).await? {
                None => {
                    let mut record = DispatchRecord::pending(
                        arc_id.clone(),
                        boundary_id.clone(),
                        lot_key.clone(),
                        ManifestKey::lot(boundary_id, lot_key).path().to_string(),
                        now,
                    );
                    let lease = grant(&mut record, holder_id, ttl, now);
                    match self.records.create(&record).await? {
                        CreateOutcome::Created { .. } => Some(lease),
                        CreateOutcome::Exists => None,
                    }
                }
                Some(Versioned { value: mut record, version }) => match record.state {
                    DispatchState::Consumed => return Ok(AcquireResult::AlreadyConsumed),
                    DispatchState::Leased if !record.lease_expired(now) => {
                        let (holder_id, expires_at) = record
                            .lease
                            .map(|lease| (lease.holder_id, lease.expires_at))
                            .unwrap_or_default();
                        return Ok(AcquireResult::AlreadyLeased {
                            holder_id,
                            expires_at,
                        });
                    }
                    previous => {
                        let lease = grant(&mut record, holder_id, ttl, now);
                        if previous == DispatchState::Leased {
                            tracing::warn!(
                                fencing_sequence = lease.fencing_sequence,
                                "taking over expired lease"
                            );
                        }
                        self.records
                            .replace(&record, &version)
                            .await?
                            .map(|_| lease)
                    }
                },
            };

            let Some(lease) = granted else {
                continue;
            };
            if self.manifests.is_consumed(arc_id, boundary_id, lot_key).await? {
                self.mark_consumed(arc_id, boundary_id, lot_key).await?;
                return Ok(AcquireResult::AlreadyConsumed);
            }
            tracing::debug!(holder_id, fencing_sequence = lease.fencing_sequence, "lease granted");
            return Ok(AcquireResult::Leased(lease));
        }

        Err(Error::Contention {
            key: DispatchKey::lot(arc_id, boundary_id, lot_key).to_string(),
            attempts: self.max_cas_attempts,
        })
    }

    /// Records consumption and releases the lease.
    ///
    /// Consumption is recorded even if the lease lapsed in the meantime: the
    /// work is done, and recording it is what stops a later holder from
    /// redoing it.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the record stays contended.
    pub async fn release_consumed(&self, lease: &Lease) -> Result<ConsumptionResult> {
        let span = arc_span(
            "lease_release",
            lease.arc_id.as_str(),
            lease.boundary_id.as_str(),
            lease.lot_key.as_str(),
        );
        async {
            let result = self
                .manifests
                .record_consumption(
                    &lease.arc_id,
                    &lease.boundary_id,
                    &lease.lot_key,
                    Some(lease.token),
                )
                .await?;
            self.mark_consumed(&lease.arc_id, &lease.boundary_id, &lease.lot_key)
                .await?;
            let label = match result {
                ConsumptionResult::Recorded => "recorded",
                ConsumptionResult::AlreadyConsumed => "already_consumed",
            };
            self.metrics.record_consumption(label);
            tracing::info!(result = label, "lot consumed");
            Ok(result)
        }
        .instrument(span)
        .await
    }

    /// Gives the lease up without recording consumption.
    ///
    /// The record moves to [`DispatchState::Abandoned`]: the lot becomes
    /// dispatchable again, and the next sweep re-triggers the arc. Returns
    /// false if the caller no longer holds the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the record stays contended.
    pub async fn abandon(&self, lease: &Lease) -> Result<bool> {
        self.update_held(lease, |record, _| {
            record.state = DispatchState::Abandoned;
            record.lease = None;
        })
        .await
        .map(|updated| {
            if updated {
                tracing::info!(arc_id = %lease.arc_id, lot_key = %lease.lot_key, "lease abandoned");
            }
            updated
        })
    }

    /// Extends an unexpired lease by `ttl` from now.
    ///
    /// Returns false if the lease lapsed or was taken over.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the record stays contended.
    pub async fn renew(&self, lease: &mut Lease, ttl: Duration) -> Result<bool> {
        let mut expires_at = lease.expires_at;
        let renewed = self
            .update_held(lease, |record, now| {
                expires_at = now + to_chrono(ttl);
                if let Some(info) = record.lease.as_mut() {
                    info.expires_at = expires_at;
                }
            })
            .await?;
        if renewed {
            lease.expires_at = expires_at;
        }
        Ok(renewed)
    }

    /// Reads the dispatch record backing a lease.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the record is corrupt.
    pub async fn inspect(
        &self,
        arc_id: &ArcId,
        boundary_id: &BoundaryId,
        lot_key: &LotKey,
    ) -> Result<Option<DispatchRecord>> {
        Ok(self
            .records
            .load(arc_id, boundary_id, lot_key)
            .await?
            .map(|found| found.value))
    }

    async fn update_held<F>(&self, lease: &Lease, mut apply: F) -> Result<bool>
    where
        F: FnMut(&mut DispatchRecord, DateTime<Utc>) + Send,
    {
        for _ in 0..self.max_cas_attempts {
            let now = self.clock.now();
            let Some(Versioned { value: mut record, version }) = self
                .records
                .load(&lease.arc_id, &lease.boundary_id, &lease.lot_key)
                .await?
            else {
                return Ok(false);
            };
            if !record.is_held_by(&lease.token, now) {
                return Ok(false);
            }
            apply(&mut record, now);
            record.updated_at = now;
            if self.records.replace(&record, &version).await?.is_some() {
                return Ok(true);
            }
        }
        Err(Error::Contention {
            key: DispatchKey::lot(&lease.arc_id, &lease.boundary_id, &lease.lot_key).to_string(),
            attempts: self.max_cas_attempts,
        })
    }

    async fn mark_consumed(&self, arc_id: &ArcId, boundary_id: &BoundaryId, lot_key: &LotKey) -> Result<()> {
        for _ in 0..self.max_cas_attempts {
            let Some(Versioned { value: mut record, version }) =
                self.records.load(arc_id, boundary_id, lot_key).await?
            else {
                return Ok(());
            };
            if record.state == DispatchState::Consumed {
                return Ok(());
            }
            let had_failed = record.state == DispatchState::Failed || record.last_error.is_some();
            record.state = DispatchState::Consumed;
            record.last_error = None;
            record.updated_at = self.clock.now();
            if self.records.replace(&record, &version).await?.is_some() {
                if let (true, Some(sink)) = (had_failed, &self.failed) {
                    sink.resolve(arc_id, boundary_id, lot_key).await?;
                    tracing::info!(%arc_id, %lot_key, "failed dispatch resolved by consumption");
                }
                return Ok(());
            }
        }
        Err(Error::Contention {
            key: DispatchKey::lot(arc_id, boundary_id, lot_key).to_string(),
            attempts: self.max_cas_attempts,
        })
    }
}

fn grant(record: &mut DispatchRecord, holder_id: &str, ttl: Duration, now: DateTime<Utc>) -> Lease {
    record.fencing_sequence = record.fencing_sequence.saturating_add(1);
    let info = LeaseInfo {
        token: LeaseToken::generate(),
        holder_id: holder_id.to_string(),
        acquired_at: now,
        expires_at: now + to_chrono(ttl),
        fencing_sequence: record.fencing_sequence,
    };
    let lease = Lease {
        arc_id: record.arc_id.clone(),
        boundary_id: record.boundary_id.clone(),
        lot_key: record.lot_key.clone(),
        token: info.token,
        holder_id: info.holder_id.clone(),
        expires_at: info.expires_at,
        fencing_sequence: info.fencing_sequence,
    };
    record.state = DispatchState::Leased;
    record.lease = Some(info);
    record.updated_at = now;
    lease
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::StorageManifestStore;
    use chrono::TimeZone;
    use weir_core::clock::ManualClock;
    use weir_core::storage::MemoryBackend;

    struct Fixture {
        leases: LeaseLayer<MemoryBackend>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryBackend::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let manifests: Arc<dyn ManifestStore> =
            Arc::new(StorageManifestStore::new(storage.clone(), Arc::new(clock.clone())));
        let leases = LeaseLayer::new(
            DispatchRecordStore::new(storage),
            manifests,
            Arc::new(clock.clone()),
        );
        Fixture { leases, clock }
    }

    fn ids() -> (ArcId, BoundaryId, LotKey) {
        (
            ArcId::new("clean").unwrap(),
            BoundaryId::new("raw").unwrap(),
            LotKey::new("2024-01-01").unwrap(),
        )
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn second_acquire_sees_holder() {
        let fx = fixture();
        let (arc, boundary, lot) = ids();
        let lease = fx
            .leases
            .acquire(&arc, &boundary, &lot, "w1", TTL)
            .await
            .unwrap()
            .into_lease()
            .unwrap();
        assert_eq!(lease.fencing_sequence, 1);

        let second = fx.leases.acquire(&arc, &boundary, &lot, "w2", TTL).await.unwrap();
        assert_eq!(
            second,
            AcquireResult::AlreadyLeased {
                holder_id: "w1".into(),
                expires_at: lease.expires_at,
            }
        );
    }

    #[tokio::test]
    async fn release_makes_lot_permanently_consumed() {
        let fx = fixture();
        let (arc, boundary, lot) = ids();
        let lease = fx
            .leases
            .acquire(&arc, &boundary, &lot, "w1", TTL)
            .await
            .unwrap()
            .into_lease()
            .unwrap();
        assert_eq!(
            fx.leases.release_consumed(&lease).await.unwrap(),
            ConsumptionResult::Recorded
        );

        fx.clock.advance(Duration::from_secs(3600));
        assert_eq!(
            fx.leases.acquire(&arc, &boundary, &lot, "w2", TTL).await.unwrap(),
            AcquireResult::AlreadyConsumed
        );
        let record = fx.leases.inspect(&arc, &boundary, &lot).await.unwrap().unwrap();
        assert_eq!(record.state, DispatchState::Consumed);
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over_with_higher_fence() {
        let fx = fixture();
        let (arc, boundary, lot) = ids();
        let first = fx
            .leases
            .acquire(&arc, &boundary, &lot, "w1", TTL)
            .await
            .unwrap()
            .into_lease()
            .unwrap();

        fx.clock.advance(TTL);
        let second = fx
            .leases
            .acquire(&arc, &boundary, &lot, "w2", TTL)
            .await
            .unwrap()
            .into_lease()
            .unwrap();
        assert!(second.fencing_sequence > first.fencing_sequence);

        let mut stale = first.clone();
        assert!(!fx.leases.renew(&mut stale, TTL).await.unwrap());
        assert!(!fx.leases.abandon(&first).await.unwrap());
    }

    #[tokio::test]
    async fn abandon_returns_lot_to_dispatchable() {
        let fx = fixture();
        let (arc, boundary, lot) = ids();
        let lease = fx
            .leases
            .acquire(&arc, &boundary, &lot, "w1", TTL)
            .await
            .unwrap()
            .into_lease()
            .unwrap();
        assert!(fx.leases.abandon(&lease).await.unwrap());

        let record = fx.leases.inspect(&arc, &boundary, &lot).await.unwrap().unwrap();
        assert_eq!(record.state, DispatchState::Abandoned);
        assert!(record.lease.is_none());
        assert!(fx
            .leases
            .acquire(&arc, &boundary, &lot, "w2", TTL)
            .await
            .unwrap()
            .into_lease()
            .is_some());
    }

    #[tokio::test]
    async fn renew_extends_expiry() {
        let fx = fixture();
        let (arc, boundary, lot) = ids();
        let mut lease = fx
            .leases
            .acquire(&arc, &boundary, &lot, "w1", TTL)
            .await
            .unwrap()
            .into_lease()
            .unwrap();
        fx.clock.advance(Duration::from_secs(30));
        assert!(fx.leases.renew(&mut lease, TTL).await.unwrap());

        fx.clock.advance(Duration::from_secs(45));
        assert!(matches!(
            fx.leases.acquire(&arc, &boundary, &lot, "w2", TTL).await.unwrap(),
            AcquireResult::AlreadyLeased { .. }
        ));
    }
}
