//! Lot lifecycle records.
//!
//! A lot moves `OPEN -> COMPLETING -> COMPLETE` and never back. The record is
//! informational: the manifest's existence is the authority on completion,
//! so a lot record that lags behind (crash after the manifest write) is
//! repaired on the next evaluation.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use weir_core::id::{BoundaryId, EventId, LotKey};

use crate::error::{Error, Result};

/// Lifecycle state of a lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LotState {
    /// At least one object observed, completeness not yet satisfied.
    Open,
    /// Completeness satisfied, manifest write in progress.
    Completing,
    /// Manifest durably written.
    Complete,
}

impl LotState {
    /// Returns true for the terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete)
    }

    /// Returns true if moving to `next` keeps the lifecycle monotonic.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        next > self
    }

    /// Returns the lowercase name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Completing => "completing",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for LotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state of one lot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotRecord {
    /// Boundary owning the lot.
    pub boundary_id: BoundaryId,
    /// Lot identity within the boundary.
    pub lot_key: LotKey,
    /// Current lifecycle state.
    pub state: LotState,
    /// When the first object was observed.
    pub opened_at: DateTime<Utc>,
    /// When a new object was last observed; drives quiescence.
    pub last_observed_at: DateTime<Utc>,
    /// When the lot entered `COMPLETING`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completing_since: Option<DateTime<Utc>>,
    /// When the lot entered `COMPLETE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Object list hash of the manifest that closed the lot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_hash: Option<String>,
}

impl LotRecord {
    /// Creates an open lot first observed at `now`.
    #[must_use]
    pub fn open(boundary_id: BoundaryId, lot_key: LotKey, now: DateTime<Utc>) -> Self {
        Self {
            boundary_id,
            lot_key,
            state: LotState::Open,
            opened_at: now,
            last_observed_at: now,
            completing_since: None,
            completed_at: None,
            manifest_hash: None,
        }
    }

    /// Moves the lot forward, stamping the transition time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if `next` is not later in the
    /// lifecycle than the current state.
    pub fn advance(&mut self, next: LotState, now: DateTime<Utc>) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        match next {
            LotState::Open => {}
            LotState::Completing => self.completing_since = Some(now),
            LotState::Complete => {
                self.completing_since.get_or_insert(now);
                self.completed_at = Some(now);
            }
        }
        self.state = next;
        Ok(())
    }
}

/// An object recorded as part of a lot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedObject {
    /// Canonical object path.
    pub path: String,
    /// Path below the lot directory.
    pub relative_path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Event time reported by the storage notification.
    pub event_time: DateTime<Utc>,
    /// Id of the first event that reported the object.
    pub event_id: EventId,
    /// When the engine first recorded the object.
    pub observed_at: DateTime<Utc>,
}

/// The distinct objects of a lot, keyed by path.
///
/// Built from whatever order the records were written in; duplicates collapse,
/// so evaluating the same set twice gives the same answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedSet {
    objects: BTreeMap<String, ObservedObject>,
}

impl ObservedSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an object, keeping the first record seen for a path.
    pub fn insert(&mut self, object: ObservedObject) {
        self.objects.entry(object.path.clone()).or_insert(object);
    }

    /// Number of distinct objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if no objects were observed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Returns true if an object with this lot-relative path was observed.
    #[must_use]
    pub fn contains_relative(&self, relative_path: &str) -> bool {
        self.objects.values().any(|o| o.relative_path == relative_path)
    }

    /// Iterates objects in path order.
    pub fn iter(&self) -> impl Iterator<Item = &ObservedObject> {
        self.objects.values()
    }
}

impl FromIterator<ObservedObject> for ObservedSet {
    fn from_iter<I: IntoIterator<Item = ObservedObject>>(iter: I) -> Self {
        let mut set = Self::new();
        for object in iter {
            set.insert(object);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn object(path: &str, event: &str) -> ObservedObject {
        ObservedObject {
            path: format!("raw/2024-01-01/{path}"),
            relative_path: path.to_string(),
            size: 1,
            event_time: now(),
            event_id: EventId::new(event).unwrap(),
            observed_at: now(),
        }
    }

    #[test]
    fn lifecycle_is_monotonic() {
        let mut lot = LotRecord::open(
            BoundaryId::new("raw").unwrap(),
            LotKey::new("2024-01-01").unwrap(),
            now(),
        );
        lot.advance(LotState::Completing, now()).unwrap();
        lot.advance(LotState::Complete, now()).unwrap();
        assert!(lot.completed_at.is_some());

        assert!(matches!(
            lot.advance(LotState::Open, now()),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(lot.advance(LotState::Complete, now()).is_err());
    }

    #[test]
    fn open_lot_may_jump_to_complete() {
        let mut lot = LotRecord::open(
            BoundaryId::new("raw").unwrap(),
            LotKey::new("2024-01-01").unwrap(),
            now(),
        );
        lot.advance(LotState::Complete, now()).unwrap();
        assert_eq!(lot.completing_since, Some(now()));
    }

    #[test]
    fn observed_set_collapses_duplicates() {
        let set: ObservedSet = [object("b.csv", "e1"), object("a.csv", "e2"), object("b.csv", "e3")]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains_relative("a.csv"));
        let paths: Vec<_> = set.iter().map(|o| o.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a.csv", "b.csv"]);
        assert_eq!(set.iter().nth(1).unwrap().event_id.as_str(), "e1");
    }
}
