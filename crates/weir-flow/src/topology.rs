//! Static dataflow topology: boundaries, arcs and subscriptions.
//!
//! Declarations are plain serde structs loaded from JSON or YAML. Loading
//! validates every reference and compiles patterns, filters and policies once,
//! so the hot path only does map lookups.
//!
//! ```yaml
//! boundaries:
//!   - id: raw
//!     path_pattern: raw/{date}
//!     completeness_policy: { kind: count, count: 2 }
//! arcs:
//!   - id: clean
//!     source_boundary_id: raw
//!     sink_boundary_ids: [clean]
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use weir_core::id::{ArcId, BoundaryId};

use crate::error::{Error, Result};
use crate::interval::LotInterval;
use crate::pattern::{PathFilter, PathFilterDecl, PathPattern};
use crate::policy::{CompiledPolicy, CompletenessPolicy};

/// Where a boundary's lot key comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LotSource {
    /// Placeholder values of the path pattern, joined by `/`.
    #[default]
    Path,
    /// The event time, truncated to an interval.
    EventTime {
        /// Lot width.
        interval: LotInterval,
    },
}

/// How an arc with several inputs is triggered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Trigger on completion of the source boundary's lot.
    #[default]
    SourceOnly,
    /// Trigger once the lot is complete on the source and every input.
    AllInputs,
}

/// Declared boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoundaryDecl {
    /// Boundary name.
    pub id: String,
    /// Path pattern such as `raw/{date}`.
    pub path_pattern: String,
    /// Completeness policy.
    pub completeness_policy: CompletenessPolicy,
    /// Lot key source.
    #[serde(default)]
    pub lot_source: LotSource,
    /// Object filter.
    #[serde(default)]
    pub filter: PathFilterDecl,
}

/// Declared arc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArcDecl {
    /// Arc name.
    pub id: String,
    /// Boundary whose completions trigger the arc.
    pub source_boundary_id: String,
    /// Additional boundaries read by the arc.
    #[serde(default)]
    pub input_boundary_ids: Vec<String>,
    /// Boundaries the arc writes to.
    #[serde(default)]
    pub sink_boundary_ids: Vec<String>,
    /// Trigger semantics for multi-input arcs.
    #[serde(default)]
    pub join: JoinPolicy,
}

/// A full topology declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyDecl {
    /// Declared boundaries.
    pub boundaries: Vec<BoundaryDecl>,
    /// Declared arcs.
    #[serde(default)]
    pub arcs: Vec<ArcDecl>,
}

impl TopologyDecl {
    /// Parses a JSON declaration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTopology`] if the document does not parse.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::topology(format!("parse JSON topology: {e}")))
    }

    /// Parses a YAML declaration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTopology`] if the document does not parse.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| Error::topology(format!("parse YAML topology: {e}")))
    }

    /// Reads a declaration file, choosing the format by extension
    /// (`.json`, otherwise YAML).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTopology`] if the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::topology(format!("read {}: {e}", path.display())))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            _ => Self::from_yaml_str(&raw),
        }
    }
}

/// A validated boundary.
#[derive(Debug, Clone)]
pub struct Boundary {
    id: BoundaryId,
    pattern: PathPattern,
    filter: PathFilter,
    policy: CompiledPolicy,
    lot_source: LotSource,
}

impl Boundary {
    fn from_decl(decl: &BoundaryDecl) -> Result<Self> {
        let id = BoundaryId::new(decl.id.as_str())
            .map_err(|e| Error::topology(format!("boundary: {e}")))?;
        let pattern = PathPattern::parse(&decl.path_pattern)
            .map_err(|e| Error::topology(format!("boundary '{id}': {e}")))?;
        if decl.lot_source == LotSource::Path && pattern.placeholders().next().is_none() {
            return Err(Error::topology(format!(
                "boundary '{id}': pattern '{}' needs a placeholder to derive lot keys",
                decl.path_pattern
            )));
        }
        let policy = CompiledPolicy::new(&decl.completeness_policy)
            .map_err(|e| Error::topology(format!("boundary '{id}': {e}")))?;
        let filter = PathFilter::new(&decl.filter)
            .map_err(|e| Error::topology(format!("boundary '{id}': {e}")))?;

        Ok(Self {
            id,
            pattern,
            filter,
            policy,
            lot_source: decl.lot_source,
        })
    }

    /// Boundary name.
    #[must_use]
    pub fn id(&self) -> &BoundaryId {
        &self.id
    }

    /// Compiled path pattern.
    #[must_use]
    pub fn pattern(&self) -> &PathPattern {
        &self.pattern
    }

    /// Compiled object filter.
    #[must_use]
    pub fn filter(&self) -> &PathFilter {
        &self.filter
    }

    /// Compiled completeness policy.
    #[must_use]
    pub fn policy(&self) -> &CompiledPolicy {
        &self.policy
    }

    /// Lot key source.
    #[must_use]
    pub fn lot_source(&self) -> LotSource {
        self.lot_source
    }
}

/// A validated arc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArcDef {
    id: ArcId,
    source: BoundaryId,
    inputs: Vec<BoundaryId>,
    sinks: Vec<BoundaryId>,
    join: JoinPolicy,
}

impl ArcDef {
    /// Arc name.
    #[must_use]
    pub fn id(&self) -> &ArcId {
        &self.id
    }

    /// Source boundary; dispatch records are keyed by it.
    #[must_use]
    pub fn source(&self) -> &BoundaryId {
        &self.source
    }

    /// Additional input boundaries.
    #[must_use]
    pub fn inputs(&self) -> &[BoundaryId] {
        &self.inputs
    }

    /// Output boundaries.
    #[must_use]
    pub fn sinks(&self) -> &[BoundaryId] {
        &self.sinks
    }

    /// Join policy.
    #[must_use]
    pub fn join(&self) -> JoinPolicy {
        self.join
    }

    /// Boundaries whose lot must be complete before the arc runs.
    pub fn required_boundaries(&self) -> impl Iterator<Item = &BoundaryId> {
        let inputs: &[BoundaryId] = match self.join {
            JoinPolicy::SourceOnly => &[],
            JoinPolicy::AllInputs => &self.inputs,
        };
        std::iter::once(&self.source).chain(inputs)
    }

    /// Returns true if a completion on `boundary` should trigger this arc.
    #[must_use]
    pub fn is_triggered_by(&self, boundary: &BoundaryId) -> bool {
        self.required_boundaries().any(|b| b == boundary)
    }
}

/// The validated, immutable topology.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    boundaries: BTreeMap<BoundaryId, Boundary>,
    arcs: BTreeMap<ArcId, ArcDef>,
    subscriptions: HashMap<BoundaryId, Vec<ArcId>>,
}

impl Topology {
    /// Validates a declaration and builds the subscription index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTopology`] for duplicate names, unknown
    /// boundary references, arcs writing to their own required boundaries,
    /// arcs that feed back into their own inputs through other arcs, or
    /// invalid boundary declarations.
    pub fn load(decl: &TopologyDecl) -> Result<Self> {
        let mut boundaries = BTreeMap::new();
        for boundary_decl in &decl.boundaries {
            let boundary = Boundary::from_decl(boundary_decl)?;
            let id = boundary.id.clone();
            if boundaries.insert(id.clone(), boundary).is_some() {
                return Err(Error::topology(format!("duplicate boundary '{id}'")));
            }
        }

        let resolve = |arc: &str, raw: &str| -> Result<BoundaryId> {
            let id = BoundaryId::new(raw).map_err(|e| Error::topology(format!("arc '{arc}': {e}")))?;
            if boundaries.contains_key(&id) {
                Ok(id)
            } else {
                Err(Error::topology(format!(
                    "arc '{arc}' references unknown boundary '{raw}'"
                )))
            }
        };

        let mut arcs = BTreeMap::new();
        let mut subscriptions: HashMap<BoundaryId, Vec<ArcId>> = HashMap::new();
        for arc_decl in &decl.arcs {
            let id = ArcId::new(arc_decl.id.as_str())
                .map_err(|e| Error::topology(format!("arc: {e}")))?;
            let source = resolve(&arc_decl.id, &arc_decl.source_boundary_id)?;
            let inputs = arc_decl
                .input_boundary_ids
                .iter()
                .map(|raw| resolve(&arc_decl.id, raw))
                .collect::<Result<Vec<_>>>()?;
            let sinks = arc_decl
                .sink_boundary_ids
                .iter()
                .map(|raw| resolve(&arc_decl.id, raw))
                .collect::<Result<Vec<_>>>()?;

            let mut reads = BTreeSet::new();
            for boundary in std::iter::once(&source).chain(&inputs) {
                if !reads.insert(boundary) {
                    return Err(Error::topology(format!(
                        "arc '{id}' reads boundary '{boundary}' twice"
                    )));
                }
            }
            if let Some(sink) = sinks.iter().find(|sink| reads.contains(sink)) {
                return Err(Error::topology(format!(
                    "arc '{id}' writes to boundary '{sink}' it also reads"
                )));
            }

            let arc = ArcDef {
                id: id.clone(),
                source,
                inputs,
                sinks,
                join: arc_decl.join,
            };
            for boundary in arc.required_boundaries() {
                subscriptions
                    .entry(boundary.clone())
                    .or_default()
                    .push(id.clone());
            }
            if arcs.insert(id.clone(), arc).is_some() {
                return Err(Error::topology(format!("duplicate arc '{id}'")));
            }
        }

        check_acyclic(&boundaries, &arcs)?;
        Ok(Self {
            boundaries,
            arcs,
            subscriptions,
        })
    }

    /// Reads and validates a declaration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTopology`] if the file is unreadable or invalid.
    pub fn from_path(path: &Path) -> Result<Self> {
        Self::load(&TopologyDecl::from_path(path)?)
    }

    /// Looks up a boundary.
    #[must_use]
    pub fn boundary(&self, id: &BoundaryId) -> Option<&Boundary> {
        self.boundaries.get(id)
    }

    /// Looks up an arc.
    #[must_use]
    pub fn arc(&self, id: &ArcId) -> Option<&ArcDef> {
        self.arcs.get(id)
    }

    /// Iterates boundaries in name order.
    pub fn boundaries(&self) -> impl Iterator<Item = &Boundary> {
        self.boundaries.values()
    }

    /// Iterates arcs in name order.
    pub fn arcs(&self) -> impl Iterator<Item = &ArcDef> {
        self.arcs.values()
    }

    /// Arcs triggered by a completion on `boundary`, in name order.
    #[must_use]
    pub fn subscribers(&self, boundary: &BoundaryId) -> Vec<&ArcDef> {
        let mut arcs: Vec<&ArcDef> = self
            .subscriptions
            .get(boundary)
            .into_iter()
            .flatten()
            .filter_map(|id| self.arcs.get(id))
            .collect();
        arcs.sort_by(|a, b| a.id.cmp(&b.id));
        arcs
    }
}

/// Rejects topologies where data written by an arc flows back into one of
/// the boundaries it reads.
fn check_acyclic(
    boundaries: &BTreeMap<BoundaryId, Boundary>,
    arcs: &BTreeMap<ArcId, ArcDef>,
) -> Result<()> {
    let mut graph: DiGraph<&BoundaryId, &ArcId> = DiGraph::new();
    let nodes: HashMap<&BoundaryId, NodeIndex> = boundaries
        .keys()
        .map(|id| (id, graph.add_node(id)))
        .collect();
    for arc in arcs.values() {
        for read in arc.required_boundaries() {
            for sink in &arc.sinks {
                graph.add_edge(nodes[read], nodes[sink], &arc.id);
            }
        }
    }
    toposort(&graph, None).map(|_| ()).map_err(|cycle| {
        Error::topology(format!(
            "arcs form a cycle through boundary '{}'",
            graph[cycle.node_id()]
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r"
boundaries:
  - id: raw
    path_pattern: raw/{date}
    completeness_policy: { kind: count, count: 2 }
  - id: ref
    path_pattern: ref/{date}
    completeness_policy: { kind: marker, marker: _SUCCESS }
  - id: clicks
    path_pattern: clicks/{region}
    lot_source: { kind: event_time, interval: fifteen_minutes }
    completeness_policy: { kind: timeout, quiescence_secs: 300 }
    filter: { includes: ['*.json'] }
  - id: clean
    path_pattern: clean/{date}
    completeness_policy: { kind: count, count: 1 }
arcs:
  - id: cleaner
    source_boundary_id: raw
    input_boundary_ids: [ref]
    sink_boundary_ids: [clean]
  - id: joiner
    source_boundary_id: raw
    input_boundary_ids: [ref]
    join: all_inputs
  - id: auditor
    source_boundary_id: raw
";

    fn topology() -> Topology {
        Topology::load(&TopologyDecl::from_yaml_str(YAML).unwrap()).unwrap()
    }

    #[test]
    fn loads_yaml_declaration() {
        let topology = topology();
        let clicks = topology
            .boundary(&BoundaryId::new("clicks").unwrap())
            .unwrap();
        assert_eq!(
            clicks.lot_source(),
            LotSource::EventTime {
                interval: LotInterval::FifteenMinutes
            }
        );
        assert_eq!(topology.arcs().count(), 3);
    }

    #[test]
    fn subscriptions_follow_join_policy() {
        let topology = topology();
        let names = |boundary: &str| -> Vec<String> {
            topology
                .subscribers(&BoundaryId::new(boundary).unwrap())
                .into_iter()
                .map(|arc| arc.id().to_string())
                .collect()
        };
        assert_eq!(names("raw"), vec!["auditor", "cleaner", "joiner"]);
        assert_eq!(names("ref"), vec!["joiner"]);
        assert!(names("clean").is_empty());
    }

    #[test]
    fn loads_json_declaration() {
        let decl = TopologyDecl::from_json_str(
            r#"{"boundaries":[{"id":"raw","path_pattern":"raw/{date}",
                "completeness_policy":{"kind":"count","count":2}}],
                "arcs":[{"id":"a","source_boundary_id":"raw","sink_boundary_ids":[]}]}"#,
        )
        .unwrap();
        let topology = Topology::load(&decl).unwrap();
        assert_eq!(topology.subscribers(&BoundaryId::new("raw").unwrap()).len(), 1);
    }

    fn rejects(yaml: &str) {
        let decl = TopologyDecl::from_yaml_str(yaml).unwrap();
        assert!(
            matches!(Topology::load(&decl), Err(Error::InvalidTopology { .. })),
            "expected rejection of:\n{yaml}"
        );
    }

    #[test]
    fn invalid_topologies_are_rejected() {
        let boundary = "
  - id: raw
    path_pattern: raw/{date}
    completeness_policy: { kind: count, count: 2 }";

        rejects(&format!("boundaries:{boundary}{boundary}"));
        rejects(&format!(
            "boundaries:{boundary}\narcs:\n  - id: a\n    source_boundary_id: nope"
        ));
        rejects(&format!(
            "boundaries:{boundary}\narcs:\n  - id: a\n    source_boundary_id: raw\n    sink_boundary_ids: [raw]"
        ));
        rejects(&format!(
            "boundaries:{boundary}\narcs:\n  - id: a\n    source_boundary_id: raw\n  - id: a\n    source_boundary_id: raw"
        ));
        rejects(&format!(
            "boundaries:{boundary}
  - id: clean
    path_pattern: clean/{{date}}
    completeness_policy: {{ kind: count, count: 1 }}
arcs:
  - id: forward
    source_boundary_id: raw
    sink_boundary_ids: [clean]
  - id: back
    source_boundary_id: clean
    sink_boundary_ids: [raw]"
        ));
        rejects(
            "boundaries:
  - id: flat
    path_pattern: landing
    completeness_policy: { kind: count, count: 2 }",
        );
        rejects(
            "boundaries:
  - id: raw
    path_pattern: raw/{date}
    completeness_policy: { kind: timeout, quiescence_secs: 0 }",
        );
        rejects(
            r#"boundaries:
  - id: raw
    path_pattern: raw/{date}
    completeness_policy: { kind: match_all, patterns: ["part-[.csv"] }"#,
        );
    }

    #[test]
    fn unknown_fields_fail_to_parse() {
        assert!(TopologyDecl::from_yaml_str("boundaries: []\nextra: 1").is_err());
    }
}
