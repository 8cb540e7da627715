//! Test fixtures: topologies, notification records and an engine harness.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use weir_core::clock::ManualClock;
use weir_core::id::{ArcId, BoundaryId, LotKey};
use weir_flow::config::EngineConfig;
use weir_flow::dispatch::memory::InMemoryTriggerTarget;
use weir_flow::pattern::PathFilterDecl;
use weir_flow::policy::CompletenessPolicy;
use weir_flow::retry::RetryPolicy;
use weir_flow::topology::{ArcDecl, BoundaryDecl, JoinPolicy, LotSource, Topology, TopologyDecl};
use weir_flow::Engine;

use crate::storage::TracingMemoryBackend;

/// Instant every [`TestContext`] clock starts at.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Parses a boundary id.
pub fn boundary_id(raw: &str) -> BoundaryId {
    BoundaryId::new(raw).unwrap()
}

/// Parses an arc id.
pub fn arc_id(raw: &str) -> ArcId {
    ArcId::new(raw).unwrap()
}

/// Parses a lot key.
pub fn lot_key(raw: &str) -> LotKey {
    LotKey::new(raw).unwrap()
}

/// A raw notification record in the engine's input format.
pub fn object_record(event_id: &str, boundary: &str, path: &str) -> Value {
    json!({
        "boundary_id": boundary,
        "path": path,
        "size": 128,
        "event_time": "2024-01-01T00:00:00Z",
        "event_id": event_id,
    })
}

/// Builder for topology declarations.
#[derive(Debug, Clone, Default)]
pub struct TopologyBuilder {
    decl: TopologyDecl,
}

impl TopologyBuilder {
    /// Starts an empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a boundary with an explicit policy.
    #[must_use]
    pub fn boundary(mut self, id: &str, pattern: &str, policy: CompletenessPolicy) -> Self {
        self.decl.boundaries.push(BoundaryDecl {
            id: id.to_string(),
            path_pattern: pattern.to_string(),
            completeness_policy: policy,
            lot_source: LotSource::Path,
            filter: PathFilterDecl::default(),
        });
        self
    }

    /// Adds a boundary that closes after `count` distinct objects.
    #[must_use]
    pub fn count_boundary(self, id: &str, pattern: &str, count: u32) -> Self {
        self.boundary(
            id,
            pattern,
            CompletenessPolicy::Count {
                count,
                accept_partial_after_secs: None,
            },
        )
    }

    /// Adds a boundary that closes on a marker object.
    #[must_use]
    pub fn marker_boundary(self, id: &str, pattern: &str, marker: &str) -> Self {
        self.boundary(
            id,
            pattern,
            CompletenessPolicy::Marker {
                marker: marker.to_string(),
            },
        )
    }

    /// Adds a boundary that closes after a quiet period.
    #[must_use]
    pub fn timeout_boundary(self, id: &str, pattern: &str, quiescence_secs: u64) -> Self {
        self.boundary(id, pattern, CompletenessPolicy::Timeout { quiescence_secs })
    }

    /// Adds an arc triggered by `source`.
    #[must_use]
    pub fn arc(mut self, id: &str, source: &str, sinks: &[&str]) -> Self {
        self.decl.arcs.push(ArcDecl {
            id: id.to_string(),
            source_boundary_id: source.to_string(),
            input_boundary_ids: Vec::new(),
            sink_boundary_ids: sinks.iter().map(ToString::to_string).collect(),
            join: JoinPolicy::SourceOnly,
        });
        self
    }

    /// Adds an arc that waits for the lot on `source` and every input.
    #[must_use]
    pub fn join_arc(mut self, id: &str, source: &str, inputs: &[&str], sinks: &[&str]) -> Self {
        self.decl.arcs.push(ArcDecl {
            id: id.to_string(),
            source_boundary_id: source.to_string(),
            input_boundary_ids: inputs.iter().map(ToString::to_string).collect(),
            sink_boundary_ids: sinks.iter().map(ToString::to_string).collect(),
            join: JoinPolicy::AllInputs,
        });
        self
    }

    /// Returns the declaration.
    pub fn decl(self) -> TopologyDecl {
        self.decl
    }

    /// Loads the topology.
    pub fn build(self) -> Arc<Topology> {
        Arc::new(Topology::load(&self.decl).unwrap())
    }
}

/// Engine configuration with millisecond backoff for tests.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        dispatch_retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
        store_retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
        ..EngineConfig::default()
    }
}

/// An engine over traced in-memory storage, a manual clock and an
/// in-memory trigger target.
pub struct TestContext {
    /// Backing storage.
    pub storage: Arc<TracingMemoryBackend>,
    /// Clock shared with the engine.
    pub clock: ManualClock,
    /// Trigger target receiving dispatches.
    pub target: Arc<InMemoryTriggerTarget>,
    /// The engine under test.
    pub engine: Engine<TracingMemoryBackend>,
}

impl TestContext {
    /// Creates a context with [`fast_config`].
    pub fn new(topology: Arc<Topology>) -> Self {
        Self::with_config(topology, fast_config())
    }

    /// Creates a context with a custom configuration.
    pub fn with_config(topology: Arc<Topology>, config: EngineConfig) -> Self {
        Self::with_storage(topology, config, TracingMemoryBackend::new())
    }

    /// Creates a context over prepared storage, e.g. one with latency.
    pub fn with_storage(
        topology: Arc<Topology>,
        config: EngineConfig,
        storage: TracingMemoryBackend,
    ) -> Self {
        crate::init_test_logging();
        let storage = Arc::new(storage);
        let clock = ManualClock::new(epoch());
        let target = Arc::new(InMemoryTriggerTarget::new("test"));
        let engine = Engine::builder(Arc::clone(&storage), topology, target.clone())
            .config(config)
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        Self {
            storage,
            clock,
            target,
            engine,
        }
    }

    /// Feeds records through the engine as one batch.
    pub async fn deliver(&self, records: &[Value]) -> weir_flow::BatchReport {
        self.engine.process_records(records).await
    }

    /// Number of trigger invocations so far.
    pub fn trigger_count(&self) -> usize {
        self.target.call_count().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_loadable_topology() {
        let topology = TopologyBuilder::new()
            .count_boundary("raw", "raw/{date}", 2)
            .count_boundary("clean", "clean/{date}", 1)
            .arc("cleanse", "raw", &["clean"])
            .build();
        assert_eq!(topology.subscribers(&boundary_id("raw")).len(), 1);
    }

    #[tokio::test]
    async fn context_completes_lot() {
        let ctx = TestContext::new(
            TopologyBuilder::new()
                .count_boundary("raw", "raw/{date}", 1)
                .count_boundary("clean", "clean/{date}", 1)
                .arc("cleanse", "raw", &["clean"])
                .build(),
        );
        let report = ctx
            .deliver(&[object_record("e1", "raw", "raw/2024-01-01/a.csv")])
            .await;
        assert_eq!(report.completed().count(), 1);
        assert_eq!(ctx.trigger_count(), 1);
    }
}
