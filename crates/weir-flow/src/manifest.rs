//! Manifest store: the single point of truth for lot completion and arc
//! consumption.
//!
//! Both records are write-once and created with a `DoesNotExist`
//! precondition, so exactly one of any number of concurrent writers wins.
//! Losers get the existing record back as a normal outcome.
//!
//! ## Manifest format
//!
//! ```json
//! {
//!   "boundary_id": "raw",
//!   "lot_key": "2024-01-01",
//!   "state": "complete",
//!   "object_paths": ["raw/2024-01-01/a.csv", "raw/2024-01-01/b.csv"],
//!   "object_list_hash": "5f1d...",
//!   "completed_at": "2024-01-01T00:05:00Z",
//!   "manifest_version": 1
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use weir_core::clock::Clock;
use weir_core::id::{ArcId, BoundaryId, LeaseToken, LotKey};
use weir_core::storage::{read_json, write_json, StorageBackend, WritePrecondition, WriteResult};
use weir_core::storage_keys::{ConsumptionKey, ManifestKey, StorageKey};

use crate::error::{Error, Result};

/// Schema version written into every manifest.
pub const MANIFEST_VERSION: u32 = 1;

/// How a lot was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestState {
    /// The completeness predicate was fully satisfied.
    Complete,
    /// Accepted with fewer objects than declared after the partial window.
    Partial,
    /// Closed by a marker with no data objects.
    Empty,
}

impl ManifestState {
    /// Returns the label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Empty => "empty",
        }
    }
}

impl fmt::Display for ManifestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hashes an object list independently of order and duplicates.
#[must_use]
pub fn object_list_hash<'a>(paths: impl IntoIterator<Item = &'a str>) -> String {
    let mut sorted: Vec<&str> = paths.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = Sha256::new();
    for path in sorted {
        hasher.update(path.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Durable record that a lot is complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    /// Boundary owning the lot.
    pub boundary_id: BoundaryId,
    /// Lot identity within the boundary.
    pub lot_key: LotKey,
    /// How the lot was closed.
    pub state: ManifestState,
    /// Sorted, distinct object paths.
    pub object_paths: Vec<String>,
    /// Hash of `object_paths`, see [`object_list_hash`].
    pub object_list_hash: String,
    /// When the manifest was written.
    pub completed_at: DateTime<Utc>,
    /// Schema version.
    pub manifest_version: u32,
}

impl ManifestRecord {
    /// Builds a manifest, normalizing the object list.
    #[must_use]
    pub fn new(
        boundary_id: BoundaryId,
        lot_key: LotKey,
        state: ManifestState,
        mut object_paths: Vec<String>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        object_paths.sort_unstable();
        object_paths.dedup();
        let object_list_hash = object_list_hash(object_paths.iter().map(String::as_str));
        Self {
            boundary_id,
            lot_key,
            state,
            object_paths,
            object_list_hash,
            completed_at,
            manifest_version: MANIFEST_VERSION,
        }
    }

    /// Storage key of this manifest, handed to triggered arcs.
    #[must_use]
    pub fn manifest_ref(&self) -> String {
        ManifestKey::lot(&self.boundary_id, &self.lot_key)
            .path()
            .to_string()
    }
}

/// Outcome of [`ManifestStore::try_complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionResult {
    /// This caller wrote the manifest and owns dispatch.
    Created(ManifestRecord),
    /// A manifest already existed.
    AlreadyExists {
        /// The manifest that won.
        existing: ManifestRecord,
        /// True if the existing object list hash equals the attempted one
        /// (a duplicate rather than a genuine re-completion).
        same_content: bool,
    },
}

/// Outcome of [`ManifestStore::record_consumption`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumptionResult {
    /// This caller recorded the consumption.
    Recorded,
    /// The arc had already consumed the lot.
    AlreadyConsumed,
}

/// Permanent record that an arc consumed a lot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    /// Consuming arc.
    pub arc_id: ArcId,
    /// Boundary of the consumed lot.
    pub boundary_id: BoundaryId,
    /// Consumed lot.
    pub lot_key: LotKey,
    /// When consumption was recorded.
    pub consumed_at: DateTime<Utc>,
    /// Lease under which the work ran, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_token: Option<LeaseToken>,
}

/// Durable, idempotent store of lot completion and arc consumption.
///
/// Implementations must make `try_complete` and `record_consumption` single
/// atomic create-if-absent operations.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Writes the manifest for a lot unless one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    async fn try_complete(
        &self,
        boundary_id: &BoundaryId,
        lot_key: &LotKey,
        state: ManifestState,
        object_paths: Vec<String>,
    ) -> Result<CompletionResult>;

    /// Reads the manifest of a lot.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable or the record is corrupt.
    async fn get(&self, boundary_id: &BoundaryId, lot_key: &LotKey)
        -> Result<Option<ManifestRecord>>;

    /// Lists every manifest of a boundary.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable or a record is corrupt.
    async fn list(&self, boundary_id: &BoundaryId) -> Result<Vec<ManifestRecord>>;

    /// Records that an arc consumed a lot, exactly once.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    async fn record_consumption(
        &self,
        arc_id: &ArcId,
        boundary_id: &BoundaryId,
        lot_key: &LotKey,
        lease_token: Option<LeaseToken>,
    ) -> Result<ConsumptionResult>;

    /// Returns true if the arc already consumed the lot.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    async fn is_consumed(
        &self,
        arc_id: &ArcId,
        boundary_id: &BoundaryId,
        lot_key: &LotKey,
    ) -> Result<bool>;
}

/// [`ManifestStore`] over a conditional-write [`StorageBackend`].
pub struct StorageManifestStore<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: StorageBackend + ?Sized> StorageManifestStore<S> {
    /// Creates a store over `storage`.
    #[must_use]
    pub fn new(storage: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    async fn read_manifest(&self, path: &str) -> Result<Option<ManifestRecord>> {
        Ok(read_json::<S, ManifestRecord>(&self.storage, path)
            .await?
            .map(|found| found.value))
    }
}

#[async_trait]
impl<S: StorageBackend + ?Sized> ManifestStore for StorageManifestStore<S> {
    async fn try_complete(
        &self,
        boundary_id: &BoundaryId,
        lot_key: &LotKey,
        state: ManifestState,
        object_paths: Vec<String>,
    ) -> Result<CompletionResult> {
        let record = ManifestRecord::new(
            boundary_id.clone(),
            lot_key.clone(),
            state,
            object_paths,
            self.clock.now(),
        );
        let key = ManifestKey::lot(boundary_id, lot_key);

        match write_json(&*self.storage, key.path(), &record, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => {
                tracing::info!(
                    boundary = %boundary_id,
                    lot = %lot_key,
                    objects = record.object_paths.len(),
                    hash = %record.object_list_hash,
                    state = %record.state,
                    "manifest created"
                );
                Ok(CompletionResult::Created(record))
            }
            WriteResult::PreconditionFailed { .. } => {
                let existing = self.read_manifest(key.path()).await?.ok_or_else(|| {
                    Error::Core(weir_core::Error::Internal {
                        message: format!("manifest {key} vanished after failed create"),
                    })
                })?;
                let same_content = existing.object_list_hash == record.object_list_hash;
                Ok(CompletionResult::AlreadyExists {
                    existing,
                    same_content,
                })
            }
        }
    }

    async fn get(
        &self,
        boundary_id: &BoundaryId,
        lot_key: &LotKey,
    ) -> Result<Option<ManifestRecord>> {
        self.read_manifest(ManifestKey::lot(boundary_id, lot_key).path())
            .await
    }

    async fn list(&self, boundary_id: &BoundaryId) -> Result<Vec<ManifestRecord>> {
        let mut metas = self
            .storage
            .list(&ManifestKey::boundary_prefix(boundary_id))
            .await?;
        metas.sort_by(|a, b| a.path.cmp(&b.path));

        let mut manifests = Vec::with_capacity(metas.len());
        for meta in metas {
            if let Some(manifest) = self.read_manifest(&meta.path).await? {
                manifests.push(manifest);
            }
        }
        Ok(manifests)
    }

    async fn record_consumption(
        &self,
        arc_id: &ArcId,
        boundary_id: &BoundaryId,
        lot_key: &LotKey,
        lease_token: Option<LeaseToken>,
    ) -> Result<ConsumptionResult> {
        let record = ConsumptionRecord {
            arc_id: arc_id.clone(),
            boundary_id: boundary_id.clone(),
            lot_key: lot_key.clone(),
            consumed_at: self.clock.now(),
            lease_token,
        };
        let key = ConsumptionKey::lot(arc_id, boundary_id, lot_key);
        let result =
            write_json(&*self.storage, key.path(), &record, WritePrecondition::DoesNotExist)
                .await?;
        Ok(if result.is_success() {
            ConsumptionResult::Recorded
        } else {
            ConsumptionResult::AlreadyConsumed
        })
    }

    async fn is_consumed(
        &self,
        arc_id: &ArcId,
        boundary_id: &BoundaryId,
        lot_key: &LotKey,
    ) -> Result<bool> {
        let key = ConsumptionKey::lot(arc_id, boundary_id, lot_key);
        Ok(self.storage.head(key.path()).await?.is_some())
    }
}
