//! Durable dispatch records.
//!
//! One record exists per `(arc, boundary, lot)`. It is created with
//! `DoesNotExist` by whichever worker first decides the arc should run, and
//! every later change (attempt bookkeeping, lease grants, consumption) is a
//! `MatchesVersion` CAS on the same object. The dispatcher and the lease
//! layer therefore agree on a single state machine:
//!
//! ```text
//! Pending -> Dispatched -> Leased -> Consumed
//!    |                     |    |
//!    v                     |    v  (abandon)
//!  Failed                  |  Abandoned
//!    |                     |    |
//!    +------> Pending <----+----+  (redrive; lease expiry)
//! ```
//!
//! `Abandoned` and lapsed `Leased` records are re-triggered by the sweep.
//! `Failed` records wait for an operator.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use weir_core::id::{ArcId, BoundaryId, LeaseToken, LotKey};
use weir_core::storage::{
    read_json, write_json, StorageBackend, Versioned, WritePrecondition, WriteResult,
};
use weir_core::storage_keys::{DispatchKey, StorageKey};

use crate::error::Result;

/// Lifecycle of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    /// Created, trigger not yet accepted.
    Pending,
    /// Trigger accepted by the target.
    Dispatched,
    /// A worker holds the lease.
    Leased,
    /// The lease holder gave the lot up unprocessed.
    Abandoned,
    /// The lot was consumed. Terminal.
    Consumed,
    /// Retries exhausted or the target rejected the trigger.
    Failed,
}

impl DispatchState {
    /// Returns the lowercase name used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Leased => "leased",
            Self::Abandoned => "abandoned",
            Self::Consumed => "consumed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The lease currently granted on a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    /// Token proving ownership.
    pub token: LeaseToken,
    /// Worker holding the lease.
    pub holder_id: String,
    /// When the lease was granted.
    pub acquired_at: DateTime<Utc>,
    /// When the lease lapses unless renewed.
    pub expires_at: DateTime<Utc>,
    /// Fencing sequence at grant time.
    pub fencing_sequence: u64,
}

/// Persisted dispatch state for one arc and lot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    /// Arc being triggered.
    pub arc_id: ArcId,
    /// Boundary whose completion triggered the arc.
    pub boundary_id: BoundaryId,
    /// Triggering lot.
    pub lot_key: LotKey,
    /// Current state.
    pub state: DispatchState,
    /// Trigger attempts made so far.
    pub attempt_count: u32,
    /// Storage key of the triggering manifest.
    pub manifest_ref: String,
    /// Invocation id returned by the target on acceptance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    /// Current lease, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<LeaseInfo>,
    /// Incremented on every lease grant; never decreases.
    #[serde(default)]
    pub fencing_sequence: u64,
    /// Last trigger failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

impl DispatchRecord {
    /// Creates a pending record.
    #[must_use]
    pub fn pending(
        arc_id: ArcId,
        boundary_id: BoundaryId,
        lot_key: LotKey,
        manifest_ref: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            arc_id,
            boundary_id,
            lot_key,
            state: DispatchState::Pending,
            attempt_count: 0,
            manifest_ref,
            invocation_id: None,
            lease: None,
            fencing_sequence: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Storage key of the record.
    #[must_use]
    pub fn key(&self) -> DispatchKey {
        DispatchKey::lot(&self.arc_id, &self.boundary_id, &self.lot_key)
    }

    /// Returns true if the record is leased and the lease lapsed.
    #[must_use]
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == DispatchState::Leased
            && !matches!(&self.lease, Some(lease) if lease.expires_at > now)
    }

    /// Returns true if `token` is the current, unexpired lease.
    #[must_use]
    pub fn is_held_by(&self, token: &LeaseToken, now: DateTime<Utc>) -> bool {
        self.state == DispatchState::Leased
            && self
                .lease
                .as_ref()
                .is_some_and(|lease| lease.token == *token && lease.expires_at > now)
    }
}

/// Outcome of [`DispatchRecordStore::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The record was created.
    Created {
        /// Version token of the new record.
        version: String,
    },
    /// A record already existed.
    Exists,
}

/// CAS access to dispatch records.
pub struct DispatchRecordStore<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
}

impl<S: StorageBackend + ?Sized> Clone for DispatchRecordStore<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S: StorageBackend + ?Sized> DispatchRecordStore<S> {
    /// Creates a store over `storage`.
    #[must_use]
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Creates the record unless one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn create(&self, record: &DispatchRecord) -> Result<CreateOutcome> {
        let key = record.key();
        match write_json(&*self.storage, key.path(), record, WritePrecondition::DoesNotExist).await? {
            WriteResult::Success { version } => Ok(CreateOutcome::Created { version }),
            WriteResult::PreconditionFailed { .. } => Ok(CreateOutcome::Exists),
        }
    }

    /// Loads a record with its version.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the record is corrupt.
    pub async fn load(
        &self,
        arc_id: &ArcId,
        boundary_id: &BoundaryId,
        lot_key: &LotKey,
    ) -> Result<Option<Versioned<DispatchRecord>>> {
        let key = DispatchKey::lot(arc_id, boundary_id, lot_key);
        Ok(read_json(&*self.storage, key.path()).await?)
    }

    /// Replaces a record if it is still at `version`.
    ///
    /// Returns the new version, or `None` if another writer got there first.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn replace(&self, record: &DispatchRecord, version: &str) -> Result<Option<String>> {
        let key = record.key();
        let precondition = WritePrecondition::MatchesVersion(version.to_string());
        match write_json(&*self.storage, key.path(), record, precondition).await? {
            WriteResult::Success { version } => Ok(Some(version)),
            WriteResult::PreconditionFailed { .. } => Ok(None),
        }
    }

    /// Lists every record of an arc, in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or a record is corrupt.
    pub async fn list_for_arc(&self, arc_id: &ArcId) -> Result<Vec<Versioned<DispatchRecord>>> {
        let mut metas = self.storage.list(&DispatchKey::arc_prefix(arc_id)).await?;
        metas.sort_by(|a, b| a.path.cmp(&b.path));
        let mut records = Vec::with_capacity(metas.len());
        for meta in metas {
            if let Some(found) = read_json(&*self.storage, &meta.path).await? {
                records.push(found);
            }
        }
        Ok(records)
    }

    /// Deletes a record.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn delete(&self, record: &DispatchRecord) -> Result<()> {
        self.storage.delete(record.key().path()).await?;
        Ok(())
    }
}
