//! Storage contract for engine state.
//!
//! Every piece of shared mutable state (manifests, lot records, dispatch and
//! lease records, consumption records) lives behind [`StorageBackend`]. The
//! contract is the one offered by cloud object stores and most key-value
//! stores: reads, listing, and writes guarded by a precondition that is
//! checked atomically with the write.
//!
//! ## Version tokens
//!
//! The version token is an opaque `String`. Backends interpret it according to
//! their own semantics (object generation, `ETag`, row version). Callers only
//! ever hand back a token they previously received.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Precondition for conditional writes (CAS operations).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if object does not exist.
    DoesNotExist,
    /// Write only if object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded, returns new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns current version token.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object path (key).
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Object version token for CAS operations.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Object contents together with the version they were read at.
#[derive(Debug, Clone)]
pub struct VersionedBytes {
    /// Object contents.
    pub data: Bytes,
    /// Version token to use with [`WritePrecondition::MatchesVersion`].
    pub version: String,
}

/// Storage backend trait for engine state.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads entire object.
    ///
    /// Returns `Error::NotFound` if object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Reads an object together with its version token.
    ///
    /// Returns `None` if the object doesn't exist. The default implementation
    /// reads metadata before content, so the returned version is never newer
    /// than the data. A CAS with a stale version fails instead of clobbering a
    /// concurrent write.
    async fn get_with_version(&self, path: &str) -> Result<Option<VersionedBytes>> {
        let Some(meta) = self.head(path).await? else {
            return Ok(None);
        };
        match self.get(path).await {
            Ok(data) => Ok(Some(VersionedBytes {
                data,
                version: meta.version,
            })),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Writes with optional precondition.
    ///
    /// Returns `WriteResult::PreconditionFailed` if precondition not met.
    /// Never returns error for precondition failure - that's a normal result.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object.
    ///
    /// Succeeds even if object doesn't exist (idempotent).
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists objects with the given prefix.
    ///
    /// **Ordering**: results come back in arbitrary order. Callers requiring
    /// deterministic order sort by `path`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

/// A decoded record together with the version it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    /// The decoded record.
    pub value: T,
    /// Version token for a subsequent CAS write.
    pub version: String,
}

/// Reads and decodes a JSON record, returning `None` when absent.
///
/// # Errors
///
/// Returns a storage error if the read fails, or a serialization error if the
/// stored bytes are not a valid record.
pub async fn read_json<S, T>(storage: &S, path: &str) -> Result<Option<Versioned<T>>>
where
    S: StorageBackend + ?Sized,
    T: DeserializeOwned,
{
    let Some(found) = storage.get_with_version(path).await? else {
        return Ok(None);
    };
    let value = serde_json::from_slice(&found.data)
        .map_err(|e| Error::serialization(&format!("decode {path}"), e))?;
    Ok(Some(Versioned {
        value,
        version: found.version,
    }))
}

/// Encodes a record as JSON and writes it under `precondition`.
///
/// # Errors
///
/// Returns a serialization error if encoding fails, or a storage error if the
/// write fails. A failed precondition is reported through [`WriteResult`].
pub async fn write_json<S, T>(
    storage: &S,
    path: &str,
    value: &T,
    precondition: WritePrecondition,
) -> Result<WriteResult>
where
    S: StorageBackend + ?Sized,
    T: Serialize + Sync,
{
    let bytes =
        serde_json::to_vec(value).map_err(|e| Error::serialization(&format!("encode {path}"), e))?;
    storage.put(path, Bytes::from(bytes), precondition).await
}

/// In-memory storage backend for tests and single-process deployments.
///
/// Thread-safe via `RwLock`. Versions are numeric internally and exposed as
/// strings.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: self.data.len() as u64,
            version: self.version.to_string(),
            last_modified: Some(self.last_modified),
        }
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "memory backend lock poisoned".into(),
    }
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.objects.read().map_err(|_| poisoned())?.len())
    }

    /// Returns true if no objects are stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn get_with_version(&self, path: &str) -> Result<Option<VersionedBytes>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(path).map(|o| VersionedBytes {
            data: o.data.clone(),
            version: o.version.to_string(),
        }))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        let current = objects.get(path);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match current {
                    Some(obj) if obj.version != expected_num => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: obj.version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects.write().map_err(|_| poisoned())?.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| obj.meta(path))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(path).map(|obj| obj.meta(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        n: u32,
    }

    #[tokio::test]
    async fn does_not_exist_allows_single_creator() {
        let backend = MemoryBackend::new();

        let first = backend
            .put("a", Bytes::from("1"), WritePrecondition::DoesNotExist)
            .await
            .unwrap();
        let second = backend
            .put("a", Bytes::from("2"), WritePrecondition::DoesNotExist)
            .await
            .unwrap();

        assert!(first.is_success());
        assert_eq!(
            second,
            WriteResult::PreconditionFailed {
                current_version: "1".into()
            }
        );
        assert_eq!(backend.get("a").await.unwrap(), Bytes::from("1"));
    }

    #[tokio::test]
    async fn matches_version_rejects_stale_writer() {
        let backend = MemoryBackend::new();
        backend
            .put("a", Bytes::from("1"), WritePrecondition::None)
            .await
            .unwrap();

        let fresh = backend
            .put(
                "a",
                Bytes::from("2"),
                WritePrecondition::MatchesVersion("1".into()),
            )
            .await
            .unwrap();
        let stale = backend
            .put(
                "a",
                Bytes::from("3"),
                WritePrecondition::MatchesVersion("1".into()),
            )
            .await
            .unwrap();

        assert_eq!(fresh, WriteResult::Success { version: "2".into() });
        assert!(!stale.is_success());
    }

    #[tokio::test]
    async fn matches_version_on_missing_object_fails() {
        let backend = MemoryBackend::new();
        let result = backend
            .put(
                "missing",
                Bytes::from("x"),
                WritePrecondition::MatchesVersion("1".into()),
            )
            .await
            .unwrap();
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn missing_object_reads() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.get("nope").await,
            Err(Error::NotFound(_))
        ));
        assert!(backend.head("nope").await.unwrap().is_none());
        assert!(backend.get_with_version("nope").await.unwrap().is_none());
        backend.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let backend = MemoryBackend::new();
        for path in ["lots/a/1", "lots/a/2", "lots/b/1"] {
            backend
                .put(path, Bytes::from("x"), WritePrecondition::None)
                .await
                .unwrap();
        }

        let mut paths: Vec<_> = backend
            .list("lots/a/")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.path)
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["lots/a/1", "lots/a/2"]);
    }

    #[tokio::test]
    async fn json_helpers_roundtrip_with_version() {
        let backend = MemoryBackend::new();
        let written = write_json(&backend, "r.json", &Record { n: 7 }, WritePrecondition::None)
            .await
            .unwrap();
        assert!(written.is_success());

        let read: Versioned<Record> = read_json(&backend, "r.json").await.unwrap().unwrap();
        assert_eq!(read.value, Record { n: 7 });
        assert_eq!(read.version, "1");

        backend
            .put("bad.json", Bytes::from("{"), WritePrecondition::None)
            .await
            .unwrap();
        let bad = read_json::<_, Record>(&backend, "bad.json").await;
        assert!(matches!(bad, Err(Error::Serialization { .. })));
    }
}
