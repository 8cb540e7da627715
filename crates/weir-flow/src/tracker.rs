//! Completion tracker: accumulates observed objects per lot and closes lots
//! whose completeness policy is satisfied.
//!
//! Many workers observe objects of the same lot concurrently. Safety comes
//! from three write-once or CAS records:
//!
//! 1. each observed object is created with `DoesNotExist`, so duplicates
//!    collapse and the observed set only grows;
//! 2. the lot record is updated with `MatchesVersion`, so its lifecycle never
//!    moves backwards;
//! 3. the manifest is created through [`ManifestStore::try_complete`], and
//!    only the writer that creates it reports [`Evaluation::Completed`].

use std::sync::Arc;

use tracing::Instrument;
use weir_core::clock::Clock;
use weir_core::id::{BoundaryId, LotKey};
use weir_core::observability::lot_span;
use weir_core::storage::{read_json, write_json, StorageBackend, Versioned, WritePrecondition};
use weir_core::storage_keys::{LotStateKey, ObservedObjectKey, StorageKey};

use crate::error::{Error, Result};
use crate::lot::{LotRecord, LotState, ObservedObject, ObservedSet};
use crate::manifest::{CompletionResult, ManifestRecord, ManifestStore};
use crate::metrics::EngineMetrics;
use crate::policy::{CompletenessPolicy, Verdict};
use crate::resolver::ResolvedObject;
use crate::topology::Boundary;

/// Default number of CAS attempts before reporting contention.
pub const DEFAULT_CAS_ATTEMPTS: u32 = 16;

/// Result of evaluating a lot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// The lot is still open.
    Pending {
        /// Distinct objects observed so far.
        observed: usize,
    },
    /// This evaluator created the manifest and owns dispatch.
    Completed(ManifestRecord),
    /// The lot was already closed by someone else.
    AlreadyComplete(ManifestRecord),
}

impl Evaluation {
    /// Returns the manifest of a closed lot.
    #[must_use]
    pub fn manifest(&self) -> Option<&ManifestRecord> {
        match self {
            Self::Pending { .. } => None,
            Self::Completed(manifest) | Self::AlreadyComplete(manifest) => Some(manifest),
        }
    }
}

/// Result of observing one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// False if the object had been recorded before.
    pub newly_observed: bool,
    /// True if the object arrived after its lot closed without it.
    pub late_arrival: bool,
    /// Lot evaluation after recording the object.
    pub evaluation: Evaluation,
}

/// Tracks lot completeness over a [`StorageBackend`].
pub struct CompletionTracker<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    manifests: Arc<dyn ManifestStore>,
    clock: Arc<dyn Clock>,
    metrics: EngineMetrics,
    max_cas_attempts: u32,
}

impl<S: StorageBackend + ?Sized> CompletionTracker<S> {
    /// Creates a tracker.
    #[must_use]
    pub fn new(storage: Arc<S>, manifests: Arc<dyn ManifestStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            manifests,
            clock,
            metrics: EngineMetrics::new(),
            max_cas_attempts: DEFAULT_CAS_ATTEMPTS,
        }
    }

    /// Overrides the CAS attempt budget.
    #[must_use]
    pub fn with_cas_attempts(mut self, attempts: u32) -> Self {
        self.max_cas_attempts = attempts.max(1);
        self
    }

    /// Records an object and re-evaluates its lot.
    ///
    /// Observing the same object any number of times, in any order relative
    /// to other objects, leaves the lot in the same state.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the lot record stays contended.
    pub async fn observe(&self, boundary: &Boundary, object: &ResolvedObject) -> Result<Observation> {
        let span = lot_span("observe", object.boundary_id.as_str(), object.lot_key.as_str());
        async {
            if let Some(existing) = self.manifests.get(&object.boundary_id, &object.lot_key).await? {
                self.settle(&existing).await?;
                let late_arrival = self.is_late(boundary, &existing, object);
                return Ok(Observation {
                    newly_observed: false,
                    late_arrival,
                    evaluation: Evaluation::AlreadyComplete(existing),
                });
            }

            let record = ObservedObject {
                path: object.path.clone(),
                relative_path: object.relative_path.clone(),
                size: object.size,
                event_time: object.event_time,
                event_id: object.event_id.clone(),
                observed_at: self.clock.now(),
            };
            let key = ObservedObjectKey::object(&object.boundary_id, &object.lot_key, &object.path);
            let newly_observed =
                write_json(&*self.storage, key.path(), &record, WritePrecondition::DoesNotExist)
                    .await?
                    .is_success();
            if newly_observed {
                tracing::debug!(path = %object.path, "object observed");
            } else {
                tracing::debug!(path = %object.path, "object already observed");
            }

            self.touch_lot(&object.boundary_id, &object.lot_key, newly_observed)
                .await?;
            let evaluation = self.evaluate(boundary, &object.lot_key).await?;
            let late_arrival = match &evaluation {
                Evaluation::AlreadyComplete(existing) => self.is_late(boundary, existing, object),
                _ => false,
            };

            Ok(Observation {
                newly_observed,
                late_arrival,
                evaluation,
            })
        }
        .instrument(span)
        .await
    }

    /// Evaluates a lot against its boundary's policy and closes it if due.
    ///
    /// Safe to call repeatedly and concurrently.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the lot record stays contended.
    pub async fn evaluate(&self, boundary: &Boundary, lot_key: &LotKey) -> Result<Evaluation> {
        let boundary_id = boundary.id();
        if let Some(existing) = self.manifests.get(boundary_id, lot_key).await? {
            self.settle(&existing).await?;
            return Ok(Evaluation::AlreadyComplete(existing));
        }

        let Some(record) = self.lot_record(boundary_id, lot_key).await? else {
            return Ok(Evaluation::Pending { observed: 0 });
        };
        let observed = self.observed_objects(boundary_id, lot_key).await?;
        let policy = boundary.policy();

        let Verdict::Complete(state) = policy.evaluate(&observed, &record, self.clock.now()) else {
            return Ok(Evaluation::Pending {
                observed: observed.len(),
            });
        };

        self.advance_lot(boundary_id, lot_key, LotState::Completing, None)
            .await?;
        let paths = policy.manifest_paths(&observed);
        match self
            .manifests
            .try_complete(boundary_id, lot_key, state, paths)
            .await?
        {
            CompletionResult::Created(manifest) => {
                self.advance_lot(
                    boundary_id,
                    lot_key,
                    LotState::Complete,
                    Some(&manifest.object_list_hash),
                )
                .await?;
                self.metrics.record_lot_completed(boundary_id, manifest.state);
                tracing::info!(
                    objects = manifest.object_paths.len(),
                    state = %manifest.state,
                    "lot complete"
                );
                Ok(Evaluation::Completed(manifest))
            }
            CompletionResult::AlreadyExists {
                existing,
                same_content,
            } => {
                if !same_content {
                    tracing::warn!(
                        existing_hash = %existing.object_list_hash,
                        "lot was closed with a different object list; keeping existing manifest"
                    );
                }
                self.settle(&existing).await?;
                Ok(Evaluation::AlreadyComplete(existing))
            }
        }
    }

    /// Reads the lot record.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the record is corrupt.
    pub async fn lot_record(&self, boundary_id: &BoundaryId, lot_key: &LotKey) -> Result<Option<LotRecord>> {
        let key = LotStateKey::lot(boundary_id, lot_key);
        Ok(read_json::<S, LotRecord>(&*self.storage, key.path())
            .await?
            .map(|found| found.value))
    }

    /// Reads every object recorded for a lot.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or a record is corrupt.
    pub async fn observed_objects(&self, boundary_id: &BoundaryId, lot_key: &LotKey) -> Result<ObservedSet> {
        let metas = self
            .storage
            .list(&ObservedObjectKey::lot_prefix(boundary_id, lot_key))
            .await?;
        let mut observed = ObservedSet::new();
        for meta in metas {
            if let Some(found) = read_json::<S, ObservedObject>(&*self.storage, &meta.path).await? {
                observed.insert(found.value);
            }
        }
        Ok(observed)
    }

    /// Lists every lot record of a boundary, in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or a record is corrupt.
    pub async fn lots(&self, boundary_id: &BoundaryId) -> Result<Vec<LotRecord>> {
        let mut metas = self
            .storage
            .list(&LotStateKey::boundary_prefix(boundary_id))
            .await?;
        metas.retain(|meta| LotStateKey::is_state_path(&meta.path));
        metas.sort_by(|a, b| a.path.cmp(&b.path));

        let mut lots = Vec::with_capacity(metas.len());
        for meta in metas {
            if let Some(found) = read_json::<S, LotRecord>(&*self.storage, &meta.path).await? {
                lots.push(found.value);
            }
        }
        Ok(lots)
    }

    /// Lists lots of a boundary that are not yet complete.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or a record is corrupt.
    pub async fn open_lots(&self, boundary_id: &BoundaryId) -> Result<Vec<LotRecord>> {
        let mut lots = self.lots(boundary_id).await?;
        lots.retain(|lot| !lot.state.is_terminal());
        Ok(lots)
    }

    /// Deletes the observed objects and state record of a completed lot.
    ///
    /// The manifest is kept, and [`Self::observe`] consults it before writing
    /// anything, so a late event cannot reopen the lot. Does nothing for a lot
    /// without a manifest. Returns the number of records deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn collect_lot(&self, boundary_id: &BoundaryId, lot_key: &LotKey) -> Result<usize> {
        if self.manifests.get(boundary_id, lot_key).await?.is_none() {
            return Ok(0);
        }
        let objects = self
            .storage
            .list(&ObservedObjectKey::lot_prefix(boundary_id, lot_key))
            .await?;
        let mut deleted = 0;
        for meta in objects {
            self.storage.delete(&meta.path).await?;
            deleted += 1;
        }
        // State goes last so an interrupted collection is retried.
        self.storage
            .delete(LotStateKey::lot(boundary_id, lot_key).path())
            .await?;
        tracing::debug!(%boundary_id, %lot_key, objects = deleted, "lot records collected");
        Ok(deleted + 1)
    }

    fn is_late(&self, boundary: &Boundary, manifest: &ManifestRecord, object: &ResolvedObject) -> bool {
        let is_marker = matches!(
            boundary.policy().declared(),
            CompletenessPolicy::Marker { marker } if *marker == object.relative_path
        );
        let late = !is_marker && !manifest.object_paths.contains(&object.path);
        if late {
            self.metrics.record_late_arrival(&object.boundary_id);
            tracing::warn!(
                path = %object.path,
                "object arrived after its lot completed; not part of the manifest"
            );
        }
        late
    }

    async fn touch_lot(&self, boundary_id: &BoundaryId, lot_key: &LotKey, newly_observed: bool) -> Result<()> {
        let key = LotStateKey::lot(boundary_id, lot_key);
        for _ in 0..self.max_cas_attempts {
            let now = self.clock.now();
            let (record, precondition) =
                match read_json::<S, LotRecord>(&*self.storage, key.path()).await? {
                    None => (
                        LotRecord::open(boundary_id.clone(), lot_key.clone(), now),
                        WritePrecondition::DoesNotExist,
                    ),
                    Some(Versioned { mut value, version }) => {
                        if !newly_observed
                            || value.state != LotState::Open
                            || now <= value.last_observed_at
                        {
                            return Ok(());
                        }
                        value.last_observed_at = now;
                        (value, WritePrecondition::MatchesVersion(version))
                    }
                };
            if write_json(&*self.storage, key.path(), &record, precondition)
                .await?
                .is_success()
            {
                return Ok(());
            }
        }
        Err(Error::Contention {
            key: key.to_string(),
            attempts: self.max_cas_attempts,
        })
    }

    /// Brings the lot record in line with an existing manifest.
    async fn settle(&self, manifest: &ManifestRecord) -> Result<()> {
        self.advance_lot(
            &manifest.boundary_id,
            &manifest.lot_key,
            LotState::Complete,
            Some(&manifest.object_list_hash),
        )
        .await
    }

    async fn advance_lot(
        &self,
        boundary_id: &BoundaryId,
        lot_key: &LotKey,
        target: LotState,
        manifest_hash: Option<&str>,
    ) -> Result<()> {
        let key = LotStateKey::lot(boundary_id, lot_key);
        for _ in 0..self.max_cas_attempts {
            let now = self.clock.now();
            let (mut record, precondition) =
                match read_json::<S, LotRecord>(&*self.storage, key.path()).await? {
                    None => (
                        LotRecord::open(boundary_id.clone(), lot_key.clone(), now),
                        WritePrecondition::DoesNotExist,
                    ),
                    Some(Versioned { value, version }) => {
                        if value.state >= target {
                            return Ok(());
                        }
                        (value, WritePrecondition::MatchesVersion(version))
                    }
                };
            record.advance(target, now)?;
            if let Some(hash) = manifest_hash {
                record.manifest_hash = Some(hash.to_string());
            }
            if write_json(&*self.storage, key.path(), &record, precondition)
                .await?
                .is_success()
            {
                tracing::debug!(state = %target, "lot advanced");
                return Ok(());
            }
        }
        Err(Error::Contention {
            key: key.to_string(),
            attempts: self.max_cas_attempts,
        })
    }
}
