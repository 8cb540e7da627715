//! Arc completion: a worker reports what its arc wrote, and each sink result
//! becomes a closed lot of the sink boundary.
//!
//! Sink manifests are written before consumption is recorded. A worker that
//! dies in between leaves the lot unconsumed; the retried run writes the
//! same manifests (write-once, so the first ones stand) and records
//! consumption then. Downstream dispatch comes last, and a crash before it
//! is repaired by the sweep, which dispatches manifests lacking records.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::Instrument;
use weir_core::id::{ArcId, BoundaryId, LotKey};
use weir_core::observability::arc_span;
use weir_core::storage::StorageBackend;

use super::Engine;
use crate::dispatch::DispatchOutcome;
use crate::error::{Error, Result};
use crate::lease::Lease;
use crate::manifest::{CompletionResult, ConsumptionResult, ManifestRecord, ManifestState};

/// What an arc wrote to one of its sink boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkOutput {
    /// Sink boundary written.
    pub boundary_id: BoundaryId,
    /// How complete the written lot is.
    pub state: ManifestState,
    /// Objects written.
    pub object_paths: Vec<String>,
}

impl SinkOutput {
    /// Describes one sink result.
    #[must_use]
    pub fn new(boundary_id: BoundaryId, state: ManifestState, object_paths: Vec<String>) -> Self {
        Self {
            boundary_id,
            state,
            object_paths,
        }
    }
}

/// How a finished arc run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArcState {
    /// Every sink is complete or empty.
    Complete,
    /// At least one sink holds partial results.
    Partial,
}

impl ArcState {
    /// Derives the arc state from its sink manifests.
    #[must_use]
    pub fn from_sinks(states: impl IntoIterator<Item = ManifestState>) -> Self {
        if states.into_iter().any(|state| state == ManifestState::Partial) {
            Self::Partial
        } else {
            Self::Complete
        }
    }

    /// Returns the label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
        }
    }
}

impl fmt::Display for ArcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`Engine::complete_arc`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArcCompletion {
    /// Finished arc.
    pub arc_id: ArcId,
    /// Lot the arc consumed; also the lot key of every sink manifest.
    pub lot_key: LotKey,
    /// How the run ended.
    pub state: ArcState,
    /// Whether this call recorded the consumption.
    pub consumption: ConsumptionResult,
    /// Sink manifests, in the order reported.
    pub sink_manifests: Vec<ManifestRecord>,
    /// Dispatches of the arcs subscribed to the sinks.
    pub dispatches: Vec<DispatchOutcome>,
}

impl<S: StorageBackend + ?Sized> Engine<S> {
    /// Finishes the arc run held under `lease`.
    ///
    /// Writes one manifest per sink boundary for the leased lot, records the
    /// consumption, then dispatches every arc subscribed to a sink. Every
    /// declared sink must be reported exactly once. Calling again with the
    /// same lease is safe: existing manifests stand and dispatches are
    /// deduplicated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArcResult`] if the sinks do not match the
    /// arc's declaration (nothing is written then), or an error if storage
    /// fails.
    pub async fn complete_arc(&self, lease: &Lease, sinks: Vec<SinkOutput>) -> Result<ArcCompletion> {
        let span = arc_span(
            "complete_arc",
            lease.arc_id.as_str(),
            lease.boundary_id.as_str(),
            lease.lot_key.as_str(),
        );
        async {
            self.check_sinks(&lease.arc_id, &sinks)?;

            let mut sink_manifests = Vec::with_capacity(sinks.len());
            for sink in sinks {
                let manifest = match self
                    .manifests
                    .try_complete(&sink.boundary_id, &lease.lot_key, sink.state, sink.object_paths)
                    .await?
                {
                    CompletionResult::Created(manifest) => {
                        self.metrics
                            .record_lot_completed(&manifest.boundary_id, manifest.state);
                        manifest
                    }
                    CompletionResult::AlreadyExists {
                        existing,
                        same_content,
                    } => {
                        if !same_content {
                            tracing::warn!(
                                sink = %existing.boundary_id,
                                existing_hash = %existing.object_list_hash,
                                "sink lot already closed with a different object list"
                            );
                        }
                        existing
                    }
                };
                sink_manifests.push(manifest);
            }

            let state = ArcState::from_sinks(sink_manifests.iter().map(|m| m.state));
            let consumption = self.leases.release_consumed(lease).await?;

            let mut dispatches = Vec::new();
            for manifest in &sink_manifests {
                dispatches.extend(self.dispatcher.dispatch_completion(manifest).await?);
            }

            self.metrics.record_arc_completed(&lease.arc_id, state.as_str());
            tracing::info!(
                state = state.as_str(),
                sinks = sink_manifests.len(),
                dispatches = dispatches.len(),
                "arc complete"
            );
            Ok(ArcCompletion {
                arc_id: lease.arc_id.clone(),
                lot_key: lease.lot_key.clone(),
                state,
                consumption,
                sink_manifests,
                dispatches,
            })
        }
        .instrument(span)
        .await
    }

    fn check_sinks(&self, arc_id: &ArcId, sinks: &[SinkOutput]) -> Result<()> {
        let arc = self
            .topology
            .arc(arc_id)
            .ok_or_else(|| weir_core::Error::NotFound(format!("arc '{arc_id}'")))?;
        let invalid = |message: String| Error::InvalidArcResult {
            arc_id: arc_id.to_string(),
            message,
        };

        let mut reported = BTreeSet::new();
        for sink in sinks {
            if !arc.sinks().contains(&sink.boundary_id) {
                return Err(invalid(format!("'{}' is not a sink of the arc", sink.boundary_id)));
            }
            if !reported.insert(&sink.boundary_id) {
                return Err(invalid(format!("sink '{}' reported twice", sink.boundary_id)));
            }
        }
        if let Some(missing) = arc.sinks().iter().find(|id| !reported.contains(id)) {
            return Err(invalid(format!("sink '{missing}' was not reported")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_sink_makes_the_arc_partial() {
        assert_eq!(
            ArcState::from_sinks([ManifestState::Complete, ManifestState::Partial]),
            ArcState::Partial
        );
        assert_eq!(
            ArcState::from_sinks([ManifestState::Empty, ManifestState::Empty]),
            ArcState::Complete
        );
        assert_eq!(
            ArcState::from_sinks([ManifestState::Complete, ManifestState::Empty]),
            ArcState::Complete
        );
    }
}
