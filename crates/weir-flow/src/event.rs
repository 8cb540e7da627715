//! Event normalizer: raw notification batches to [`ObjectEvent`]s.
//!
//! Normalization is a pure transform. Each record is handled on its own; a
//! malformed record is reported and skipped, never failing the batch.
//!
//! Accepted payloads are a JSON array of records, a single record, or an
//! envelope `{"records": [...]}`. A record has the shape
//!
//! ```json
//! {"boundary_id": "raw", "path": "raw/2024-01-01/a.csv", "size": 42,
//!  "event_time": "2024-01-01T00:00:00Z", "event_id": "evt-1"}
//! ```

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use weir_core::id::{BoundaryId, EventId};

use crate::error::{Error, Result};

/// A normalized object-created event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEvent {
    /// Boundary the object landed in.
    pub boundary_id: BoundaryId,
    /// Canonical object path.
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Event time from the notification.
    pub event_time: DateTime<Utc>,
    /// Notification id.
    pub event_id: EventId,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    boundary_id: String,
    path: String,
    size: u64,
    event_time: String,
    event_id: String,
}

/// A record that could not be normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRecord {
    /// Position of the record in the batch.
    pub index: usize,
    /// Event id, when it could be read.
    pub event_id: Option<String>,
    /// What was wrong.
    pub reason: String,
}

/// Why a well-formed record produced no event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The key names a directory placeholder (ends with `/`).
    DirectoryMarker,
    /// Another record in the same batch had the same event id.
    DuplicateInBatch,
}

/// A record skipped without being an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    /// Position of the record in the batch.
    pub index: usize,
    /// Event id of the record.
    pub event_id: EventId,
    /// Why it was skipped.
    pub reason: SkipReason,
}

/// Output of normalizing a batch; `events` keep batch order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedBatch {
    /// Normalized events.
    pub events: Vec<ObjectEvent>,
    /// Records rejected as malformed.
    pub malformed: Vec<MalformedRecord>,
    /// Records skipped on purpose.
    pub skipped: Vec<SkippedRecord>,
}

enum Normalized {
    Event(ObjectEvent),
    DirectoryMarker(EventId),
}

/// Splits a raw payload into records.
///
/// # Errors
///
/// Returns [`Error::MalformedEvent`] if the payload is not JSON or has no
/// recognizable record container.
pub fn parse_payload(payload: &[u8]) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| Error::malformed(format!("payload is not JSON: {e}")))?;
    match value {
        Value::Array(records) => Ok(records),
        Value::Object(mut map) => match map.remove("records") {
            Some(Value::Array(records)) => Ok(records),
            Some(_) => Err(Error::malformed("'records' must be an array")),
            None => Ok(vec![Value::Object(map)]),
        },
        _ => Err(Error::malformed("payload must be an object or an array")),
    }
}

/// Normalizes a batch of records, isolating per-record failures.
#[must_use]
pub fn normalize_records(records: &[Value]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    let mut seen: HashSet<EventId> = HashSet::new();

    for (index, record) in records.iter().enumerate() {
        match normalize_record(record) {
            Ok(normalized) => {
                let event_id = match &normalized {
                    Normalized::Event(event) => &event.event_id,
                    Normalized::DirectoryMarker(id) => id,
                };
                if !seen.insert(event_id.clone()) {
                    tracing::debug!(index, event_id = %event_id, "duplicate event id in batch");
                    batch.skipped.push(SkippedRecord {
                        index,
                        event_id: event_id.clone(),
                        reason: SkipReason::DuplicateInBatch,
                    });
                    continue;
                }
                match normalized {
                    Normalized::Event(event) => batch.events.push(event),
                    Normalized::DirectoryMarker(event_id) => {
                        tracing::debug!(index, event_id = %event_id, "skipping directory marker");
                        batch.skipped.push(SkippedRecord {
                            index,
                            event_id,
                            reason: SkipReason::DirectoryMarker,
                        });
                    }
                }
            }
            Err(e) => {
                let event_id = record
                    .get("event_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                tracing::warn!(index, event_id = ?event_id, error = %e, "skipping malformed record");
                batch.malformed.push(MalformedRecord {
                    index,
                    event_id,
                    reason: e.to_string(),
                });
            }
        }
    }
    batch
}

/// Normalizes a raw payload.
///
/// # Errors
///
/// Returns [`Error::MalformedEvent`] only when the payload as a whole is
/// unreadable; bad records inside a readable payload are reported in the
/// returned batch.
pub fn normalize_payload(payload: &[u8]) -> Result<NormalizedBatch> {
    Ok(normalize_records(&parse_payload(payload)?))
}

fn normalize_record(record: &Value) -> Result<Normalized> {
    let raw: RawRecord = serde_json::from_value(record.clone())
        .map_err(|e| Error::malformed(format!("invalid record: {e}")))?;

    let event_id =
        EventId::new(raw.event_id).map_err(|e| Error::malformed(format!("event_id: {e}")))?;
    let boundary_id =
        BoundaryId::new(raw.boundary_id).map_err(|e| Error::malformed(format!("boundary_id: {e}")))?;
    let event_time = DateTime::parse_from_rfc3339(&raw.event_time)
        .map_err(|e| Error::malformed(format!("event_time '{}': {e}", raw.event_time)))?
        .with_timezone(&Utc);

    match canonicalize_path(&raw.path)? {
        CanonicalPath::Directory => Ok(Normalized::DirectoryMarker(event_id)),
        CanonicalPath::Object(path) => Ok(Normalized::Event(ObjectEvent {
            boundary_id,
            path,
            size: raw.size,
            event_time,
            event_id,
        })),
    }
}

/// Result of canonicalizing a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalPath {
    /// A directory placeholder key.
    Directory,
    /// An object key in canonical form.
    Object(String),
}

/// Canonicalizes an object key.
///
/// Percent-escapes are decoded, leading slashes and empty or `.` segments
/// are dropped. Keys ending in `/` are directory placeholders.
///
/// # Errors
///
/// Returns [`Error::MalformedEvent`] for empty keys, invalid UTF-8 escapes,
/// control characters, or `..` segments.
pub fn canonicalize_path(raw: &str) -> Result<CanonicalPath> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|e| Error::malformed(format!("path is not valid UTF-8: {e}")))?;
    if decoded.chars().any(char::is_control) {
        return Err(Error::malformed("path contains control characters"));
    }

    let mut segments = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(Error::malformed(format!("path '{decoded}' escapes its prefix"))),
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Err(Error::malformed("path is empty"));
    }
    if decoded.ends_with('/') {
        return Ok(CanonicalPath::Directory);
    }
    Ok(CanonicalPath::Object(segments.join("/")))
}
