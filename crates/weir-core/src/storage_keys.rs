//! Typed storage keys for engine state.
//!
//! Every persisted record has exactly one key type, so a path can only be
//! built from the identifiers it is meant to hold.
//!
//! | Key Type | Path | Written By |
//! |----------|------|------------|
//! | `ManifestKey` | `manifests/{boundary}/lot={lot}/manifest.json` | Completion tracker (write-once) |
//! | `LotStateKey` | `lots/{boundary}/lot={lot}/state.json` | Completion tracker (CAS) |
//! | `ObservedObjectKey` | `lots/{boundary}/lot={lot}/objects/{sha256(path)}.json` | Completion tracker (write-once) |
//! | `DispatchKey` | `arcs/{arc}/dispatch/{boundary}/lot={lot}.json` | Dispatcher, lease layer (CAS) |
//! | `ConsumptionKey` | `arcs/{arc}/consumed/{boundary}/lot={lot}.json` | Lease layer (write-once) |
//! | `EventMarkerKey` | `events/{event_id}.json` | Engine |
//! | `FailedDispatchKey` | `operator/failed-dispatches/{arc}/{boundary}/lot={lot}.json` | Dispatcher |
//!
//! Lot keys and event ids are percent-encoded into a single path segment, so
//! a lot key containing `/` never changes the depth of a path.
//!
//! # Example
//!
//! ```rust
//! use weir_core::id::{BoundaryId, LotKey};
//! use weir_core::storage_keys::{ManifestKey, StorageKey};
//!
//! let boundary = BoundaryId::new("raw").unwrap();
//! let lot = LotKey::new("2024/01/01").unwrap();
//! let key = ManifestKey::lot(&boundary, &lot);
//! assert_eq!(key.path(), "manifests/raw/lot=2024%2F01%2F01/manifest.json");
//! ```

use std::fmt;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};

use crate::id::{ArcId, BoundaryId, EventId, LotKey};

/// Characters escaped when embedding user data in a single path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// A typed storage key that encodes path structure.
pub trait StorageKey: AsRef<str> {
    /// Returns the underlying path string.
    fn path(&self) -> &str {
        self.as_ref()
    }
}

/// Percent-encodes a value into a single path segment.
#[must_use]
pub fn encode_segment(raw: &str) -> String {
    utf8_percent_encode(raw, SEGMENT).to_string()
}

/// Reverses [`encode_segment`]. Returns `None` for invalid UTF-8.
#[must_use]
pub fn decode_segment(encoded: &str) -> Option<String> {
    percent_decode_str(encoded)
        .decode_utf8()
        .ok()
        .map(std::borrow::Cow::into_owned)
}

fn lot_segment(lot: &LotKey) -> String {
    format!("lot={}", encode_segment(lot.as_str()))
}

macro_rules! storage_key {
    ($name:ident) => {
        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl StorageKey for $name {}

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

/// Key of the write-once manifest for a lot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestKey(String);

impl ManifestKey {
    /// Manifest path for a lot.
    #[must_use]
    pub fn lot(boundary: &BoundaryId, lot: &LotKey) -> Self {
        Self(format!("manifests/{boundary}/{}/manifest.json", lot_segment(lot)))
    }

    /// Prefix holding every manifest of a boundary.
    #[must_use]
    pub fn boundary_prefix(boundary: &BoundaryId) -> String {
        format!("manifests/{boundary}/")
    }
}

storage_key!(ManifestKey);

/// Key of the mutable per-lot state record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LotStateKey(String);

impl LotStateKey {
    /// File name shared by every lot state record.
    pub const FILE_NAME: &'static str = "state.json";

    /// State record path for a lot.
    #[must_use]
    pub fn lot(boundary: &BoundaryId, lot: &LotKey) -> Self {
        Self(format!(
            "lots/{boundary}/{}/{}",
            lot_segment(lot),
            Self::FILE_NAME
        ))
    }

    /// Prefix holding all lot records (state and objects) of a boundary.
    #[must_use]
    pub fn boundary_prefix(boundary: &BoundaryId) -> String {
        format!("lots/{boundary}/")
    }

    /// Returns true if a listed path is a lot state record.
    #[must_use]
    pub fn is_state_path(path: &str) -> bool {
        path.ends_with(&format!("/{}", Self::FILE_NAME))
    }
}

storage_key!(LotStateKey);

/// Key of one observed object inside a lot.
///
/// The object path is hashed so arbitrary object names map to a fixed-width,
/// storage-safe file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObservedObjectKey(String);

impl ObservedObjectKey {
    /// Record path for an observed object.
    #[must_use]
    pub fn object(boundary: &BoundaryId, lot: &LotKey, object_path: &str) -> Self {
        let digest = hex::encode(Sha256::digest(object_path.as_bytes()));
        Self(format!("{}{digest}.json", Self::lot_prefix(boundary, lot)))
    }

    /// Prefix holding every observed object of a lot.
    #[must_use]
    pub fn lot_prefix(boundary: &BoundaryId, lot: &LotKey) -> String {
        format!("lots/{boundary}/{}/objects/", lot_segment(lot))
    }
}

storage_key!(ObservedObjectKey);

/// Key of the dispatch/lease record for an (arc, lot) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DispatchKey(String);

impl DispatchKey {
    /// Dispatch record path for an (arc, lot) pair.
    #[must_use]
    pub fn lot(arc: &ArcId, boundary: &BoundaryId, lot: &LotKey) -> Self {
        Self(format!("arcs/{arc}/dispatch/{boundary}/{}.json", lot_segment(lot)))
    }

    /// Prefix holding every dispatch record of an arc.
    #[must_use]
    pub fn arc_prefix(arc: &ArcId) -> String {
        format!("arcs/{arc}/dispatch/")
    }
}

storage_key!(DispatchKey);

/// Key of the permanent consumption record for an (arc, lot) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumptionKey(String);

impl ConsumptionKey {
    /// Consumption record path for an (arc, lot) pair.
    #[must_use]
    pub fn lot(arc: &ArcId, boundary: &BoundaryId, lot: &LotKey) -> Self {
        Self(format!("arcs/{arc}/consumed/{boundary}/{}.json", lot_segment(lot)))
    }
}

storage_key!(ConsumptionKey);

/// Key of a raw-event dedup marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventMarkerKey(String);

impl EventMarkerKey {
    /// Prefix holding every event marker.
    pub const PREFIX: &'static str = "events/";

    /// Marker path for an event id.
    #[must_use]
    pub fn event(event_id: &EventId) -> Self {
        Self(format!(
            "{}{}.json",
            Self::PREFIX,
            encode_segment(event_id.as_str())
        ))
    }
}

storage_key!(EventMarkerKey);

/// Key of an operator-queue entry for an exhausted dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FailedDispatchKey(String);

impl FailedDispatchKey {
    /// Prefix holding the operator queue.
    pub const PREFIX: &'static str = "operator/failed-dispatches/";

    /// Queue entry path for an (arc, lot) pair.
    #[must_use]
    pub fn lot(arc: &ArcId, boundary: &BoundaryId, lot: &LotKey) -> Self {
        Self(format!(
            "{}{arc}/{boundary}/{}.json",
            Self::PREFIX,
            lot_segment(lot)
        ))
    }
}

storage_key!(FailedDispatchKey);
