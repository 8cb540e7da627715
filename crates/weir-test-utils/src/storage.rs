//! Test storage with operation tracing and fault injection.
//!
//! Injected faults surface as [`Error::Storage`], the transient class the
//! engine retries, so tests can drive the retry paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use weir_core::error::{Error, Result};
use weir_core::storage::{ObjectMeta, StorageBackend, VersionedBytes, WritePrecondition, WriteResult};

/// Record of a storage operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// Get operation.
    Get {
        /// Path that was read.
        path: String,
    },
    /// Head operation (metadata only).
    Head {
        /// Path that was checked.
        path: String,
    },
    /// Put operation.
    Put {
        /// Path that was written.
        path: String,
        /// Size of data written.
        size: usize,
        /// Precondition used.
        precondition: WritePrecondition,
    },
    /// Delete operation.
    Delete {
        /// Path that was deleted.
        path: String,
    },
    /// List operation.
    List {
        /// Prefix that was listed.
        prefix: String,
    },
}

impl StorageOp {
    /// Returns true for a put with the given precondition kind on `prefix`.
    #[must_use]
    pub fn is_conditional_put_under(&self, prefix: &str) -> bool {
        matches!(
            self,
            Self::Put { path, precondition, .. }
                if path.starts_with(prefix) && *precondition != WritePrecondition::None
        )
    }
}

#[derive(Debug, Clone)]
struct Fault {
    prefix: String,
    /// Remaining failures; `None` fails forever.
    remaining: Option<u32>,
}

/// In-memory storage backend with operation tracing.
///
/// Records all operations for later assertion in tests.
#[derive(Debug, Clone, Default)]
pub struct TracingMemoryBackend {
    data: Arc<Mutex<HashMap<String, StoredObject>>>,
    operations: Arc<Mutex<Vec<StorageOp>>>,
    faults: Arc<Mutex<Vec<Fault>>>,
    latency: Option<Duration>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
}

impl TracingMemoryBackend {
    /// Creates a new empty tracing storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates storage with simulated latency on every operation.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StorageOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Fails every operation on paths starting with `prefix`.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.faults.lock().expect("lock").push(Fault {
            prefix: prefix.into(),
            remaining: None,
        });
    }

    /// Fails the next `count` operations on paths starting with `prefix`.
    pub fn inject_failures(&self, prefix: impl Into<String>, count: u32) {
        self.faults.lock().expect("lock").push(Fault {
            prefix: prefix.into(),
            remaining: Some(count),
        });
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.faults.lock().expect("lock").clear();
    }

    /// Returns the current version for a path (for CAS testing).
    #[must_use]
    pub fn version(&self, path: &str) -> Option<String> {
        self.data
            .lock()
            .expect("lock")
            .get(path)
            .map(|o| o.version.to_string())
    }

    /// Returns all stored paths, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.data.lock().expect("lock").keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Returns stored paths under `prefix`, sorted.
    #[must_use]
    pub fn paths_under(&self, prefix: &str) -> Vec<String> {
        self.paths()
            .into_iter()
            .filter(|p| p.starts_with(prefix))
            .collect()
    }

    fn record(&self, op: StorageOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, path: &str) -> Result<()> {
        let mut faults = self.faults.lock().expect("lock");
        let Some(fault) = faults
            .iter_mut()
            .find(|f| path.starts_with(&f.prefix) && f.remaining != Some(0))
        else {
            return Ok(());
        };
        if let Some(remaining) = fault.remaining.as_mut() {
            *remaining -= 1;
        }
        Err(Error::storage(format!("injected failure for path: {path}")))
    }

    async fn maybe_delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn meta(path: &str, object: &StoredObject) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: object.data.len() as u64,
            version: object.version.to_string(),
            last_modified: Some(object.last_modified),
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for TracingMemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.maybe_delay().await;
        self.check_failure(path)?;
        self.record(StorageOp::Get {
            path: path.to_string(),
        });

        let data = self.data.lock().expect("lock");
        data.get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn get_with_version(&self, path: &str) -> Result<Option<VersionedBytes>> {
        self.maybe_delay().await;
        self.check_failure(path)?;
        self.record(StorageOp::Get {
            path: path.to_string(),
        });

        let data = self.data.lock().expect("lock");
        Ok(data.get(path).map(|o| VersionedBytes {
            data: o.data.clone(),
            version: o.version.to_string(),
        }))
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.maybe_delay().await;
        self.check_failure(path)?;
        self.record(StorageOp::Head {
            path: path.to_string(),
        });

        let data = self.data.lock().expect("lock");
        Ok(data.get(path).map(|o| Self::meta(path, o)))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.maybe_delay().await;
        self.check_failure(path)?;
        self.record(StorageOp::Put {
            path: path.to_string(),
            size: data.len(),
            precondition: precondition.clone(),
        });

        let mut store = self.data.lock().expect("lock");
        let existing = store.get(path);

        match &precondition {
            WritePrecondition::None => {}
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = existing {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match existing {
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
        }

        let new_version = existing.map_or(1, |o| o.version + 1);
        store.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.maybe_delay().await;
        self.check_failure(path)?;
        self.record(StorageOp::Delete {
            path: path.to_string(),
        });

        self.data.lock().expect("lock").remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.maybe_delay().await;
        self.check_failure(prefix)?;
        self.record(StorageOp::List {
            prefix: prefix.to_string(),
        });

        let data = self.data.lock().expect("lock");
        Ok(data
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| Self::meta(k, v))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracing_storage_records_operations() {
        let storage = TracingMemoryBackend::new();

        storage
            .put("test.txt", Bytes::from("hello"), WritePrecondition::None)
            .await
            .expect("put");
        let _ = storage.get("test.txt").await;
        let _ = storage.list("").await;

        let ops = storage.operations();
        assert_eq!(ops.len(), 3);
        assert!(matches!(ops[0], StorageOp::Put { .. }));
        assert!(matches!(ops[1], StorageOp::Get { .. }));
        assert!(matches!(ops[2], StorageOp::List { .. }));
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_counted() {
        let storage = TracingMemoryBackend::new();
        storage.inject_failures("fail/", 2);

        for _ in 0..2 {
            let err = storage.get("fail/test.txt").await.unwrap_err();
            assert!(err.is_transient());
        }
        assert!(matches!(
            storage.get("fail/test.txt").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn permanent_injection_until_cleared() {
        let storage = TracingMemoryBackend::new();
        storage.inject_failure("fail/");
        assert!(storage.head("fail/x").await.is_err());
        assert!(storage.head("fail/x").await.is_err());
        storage.clear_failures();
        assert!(storage.head("fail/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tracing_storage_cas_works() {
        let storage = TracingMemoryBackend::new();

        let result = storage
            .put("test.txt", Bytes::from("v1"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(matches!(result, WriteResult::Success { ref version } if version == "1"));

        let result = storage
            .put("test.txt", Bytes::from("v2"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(matches!(result, WriteResult::PreconditionFailed { .. }));

        let result = storage
            .put(
                "test.txt",
                Bytes::from("v2"),
                WritePrecondition::MatchesVersion("1".to_string()),
            )
            .await
            .expect("put");
        assert!(matches!(result, WriteResult::Success { ref version } if version == "2"));
    }
}
