//! Lot resolver: maps an [`ObjectEvent`] to the lot it belongs to.

use chrono::{DateTime, Utc};
use weir_core::id::{BoundaryId, EventId, LotKey};

use crate::error::{Error, Result, UnresolvedReason};
use crate::event::ObjectEvent;
use crate::topology::{Boundary, LotSource, Topology};

/// An object event placed in its lot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedObject {
    /// Boundary owning the lot.
    pub boundary_id: BoundaryId,
    /// Lot identity.
    pub lot_key: LotKey,
    /// Canonical object path.
    pub path: String,
    /// Path below the lot directory.
    pub relative_path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Event time.
    pub event_time: DateTime<Utc>,
    /// Notification id.
    pub event_id: EventId,
}

fn unresolved(event: &ObjectEvent, reason: UnresolvedReason) -> Error {
    Error::UnresolvedLot {
        boundary_id: event.boundary_id.to_string(),
        path: event.path.clone(),
        reason,
    }
}

/// Resolves an event against a single boundary.
///
/// # Errors
///
/// Returns [`Error::UnresolvedLot`] when the path does not match the
/// boundary's pattern or is excluded by its filter.
pub fn resolve_in(boundary: &Boundary, event: &ObjectEvent) -> Result<ResolvedObject> {
    let matched = boundary
        .pattern()
        .match_path(&event.path)
        .ok_or_else(|| unresolved(event, UnresolvedReason::PatternMismatch))?;

    if !boundary.filter().allows(&event.path, &matched.relative_path) {
        return Err(unresolved(event, UnresolvedReason::Filtered));
    }

    let lot_key = match boundary.lot_source() {
        LotSource::Path => matched.lot_key()?,
        LotSource::EventTime { interval } => interval.lot_key(event.event_time)?,
    };

    Ok(ResolvedObject {
        boundary_id: boundary.id().clone(),
        lot_key,
        path: event.path.clone(),
        relative_path: matched.relative_path,
        size: event.size,
        event_time: event.event_time,
        event_id: event.event_id.clone(),
    })
}

/// Resolves an event against the boundary it names.
///
/// # Errors
///
/// Returns [`Error::UnresolvedLot`] for unknown boundaries and for paths the
/// boundary does not accept.
pub fn resolve(topology: &Topology, event: &ObjectEvent) -> Result<ResolvedObject> {
    let boundary = topology
        .boundary(&event.boundary_id)
        .ok_or_else(|| unresolved(event, UnresolvedReason::UnknownBoundary))?;
    resolve_in(boundary, event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologyDecl;
    use chrono::TimeZone;

    fn topology() -> Topology {
        Topology::load(
            &TopologyDecl::from_yaml_str(
                r"
boundaries:
  - id: raw
    path_pattern: raw/{date}
    completeness_policy: { kind: count, count: 2 }
    filter: { excludes: ['_tmp/**'] }
  - id: clicks
    path_pattern: clicks/{region}
    lot_source: { kind: event_time, interval: hourly }
    completeness_policy: { kind: timeout, quiescence_secs: 60 }
",
            )
            .unwrap(),
        )
        .unwrap()
    }

    fn event(boundary: &str, path: &str) -> ObjectEvent {
        ObjectEvent {
            boundary_id: BoundaryId::new(boundary).unwrap(),
            path: path.to_string(),
            size: 5,
            event_time: Utc.with_ymd_and_hms(2024, 1, 1, 13, 20, 0).unwrap(),
            event_id: EventId::new("evt").unwrap(),
        }
    }

    fn reason(result: Result<ResolvedObject>) -> UnresolvedReason {
        match result {
            Err(Error::UnresolvedLot { reason, .. }) => reason,
            other => panic!("expected unresolved lot, got {other:?}"),
        }
    }

    #[test]
    fn resolves_path_lots() {
        let resolved = resolve(&topology(), &event("raw", "raw/2024-01-01/a.csv")).unwrap();
        assert_eq!(resolved.lot_key.as_str(), "2024-01-01");
        assert_eq!(resolved.relative_path, "a.csv");
        assert_eq!(resolved.size, 5);
    }

    #[test]
    fn resolves_event_time_lots() {
        let resolved = resolve(&topology(), &event("clicks", "clicks/eu/x.json")).unwrap();
        assert_eq!(resolved.lot_key.as_str(), "20240101PT1H013");
    }

    #[test]
    fn unresolved_reasons() {
        let topology = topology();
        assert_eq!(
            reason(resolve(&topology, &event("nope", "raw/2024-01-01/a.csv"))),
            UnresolvedReason::UnknownBoundary
        );
        assert_eq!(
            reason(resolve(&topology, &event("raw", "tmp/2024-01-01/a.csv"))),
            UnresolvedReason::PatternMismatch
        );
        assert_eq!(
            reason(resolve(&topology, &event("raw", "raw/2024-01-01/_tmp/a.csv"))),
            UnresolvedReason::Filtered
        );
    }
}
