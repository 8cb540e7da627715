//! Raw-event deduplication.
//!
//! Notification substrates redeliver. A marker keyed by event id is written
//! once an event has been fully processed; redeliveries inside the dedup
//! window short-circuit before resolution. Markers are written only after
//! success, so an event whose processing failed is processed again when it
//! comes back.
//!
//! Correctness never depends on the markers: the tracker and dispatcher are
//! idempotent on their own. Markers only save work.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use weir_core::clock::{to_chrono, Clock};
use weir_core::id::EventId;
use weir_core::storage::{read_json, write_json, StorageBackend, WritePrecondition};
use weir_core::storage_keys::{EventMarkerKey, StorageKey};

use crate::error::Result;

/// Default dedup window (24 hours).
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Persisted marker of a processed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMarker {
    /// Processed event.
    pub event_id: EventId,
    /// When processing finished.
    pub seen_at: DateTime<Utc>,
    /// Outcome label of the processing.
    pub outcome: String,
}

/// Event-id markers with a time window.
pub struct EventDeduplicator<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl<S: StorageBackend + ?Sized> EventDeduplicator<S> {
    /// Creates a deduplicator with the given window.
    #[must_use]
    pub fn new(storage: Arc<S>, clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self {
            storage,
            clock,
            window,
        }
    }

    /// Returns true if the event was processed within the window.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the marker is corrupt.
    pub async fn is_seen(&self, event_id: &EventId) -> Result<bool> {
        let key = EventMarkerKey::event(event_id);
        let Some(found) = read_json::<S, EventMarker>(&*self.storage, key.path()).await? else {
            return Ok(false);
        };
        Ok(!self.is_expired(&found.value, self.clock.now()))
    }

    /// Records that an event was processed.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn mark_seen(&self, event_id: &EventId, outcome: &str) -> Result<()> {
        let marker = EventMarker {
            event_id: event_id.clone(),
            seen_at: self.clock.now(),
            outcome: outcome.to_string(),
        };
        let key = EventMarkerKey::event(event_id);
        write_json(&*self.storage, key.path(), &marker, WritePrecondition::None).await?;
        Ok(())
    }

    /// Deletes markers older than the window. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or a marker is corrupt.
    pub async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut removed = 0;
        for meta in self.storage.list(EventMarkerKey::PREFIX).await? {
            let Some(found) = read_json::<S, EventMarker>(&*self.storage, &meta.path).await? else {
                continue;
            };
            if self.is_expired(&found.value, now) {
                self.storage.delete(&meta.path).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "purged expired event markers");
        }
        Ok(removed)
    }

    fn is_expired(&self, marker: &EventMarker, now: DateTime<Utc>) -> bool {
        marker.seen_at + to_chrono(self.window) <= now
    }
}
