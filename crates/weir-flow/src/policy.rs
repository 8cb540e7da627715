//! Completeness policies.
//!
//! Evaluation is a pure function of the observed set, the lot record and the
//! current time, so repeated or concurrent evaluation always reaches the same
//! verdict for the same inputs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use weir_core::clock::elapsed_between;

use crate::error::{Error, Result};
use crate::lot::{LotRecord, ObservedSet};
use crate::manifest::ManifestState;

/// When a lot of a boundary counts as complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompletenessPolicy {
    /// Complete once `count` distinct objects were observed.
    Count {
        /// Required number of distinct objects.
        count: u32,
        /// Accept a non-empty lot as partial this long after it opened.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        accept_partial_after_secs: Option<u64>,
    },
    /// Complete once the marker object (relative to the lot) was observed.
    Marker {
        /// Lot-relative marker path, e.g. `_SUCCESS`.
        marker: String,
    },
    /// Complete once every glob matched at least one lot-relative path.
    MatchAll {
        /// Globs such as `part-*.csv` or `schema.json`.
        patterns: Vec<String>,
    },
    /// Complete after `quiescence_secs` without new objects.
    Timeout {
        /// Quiet period that closes the lot.
        quiescence_secs: u64,
    },
}

/// Result of evaluating a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep accumulating.
    Incomplete,
    /// Close the lot with the given manifest state.
    Complete(ManifestState),
}

impl CompletenessPolicy {
    /// Checks declared parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTopology`] for a zero count, a blank or
    /// absolute marker, an empty glob list, or a zero quiescence window.
    /// Glob syntax is checked by [`CompiledPolicy::new`].
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Count { count: 0, .. } => Err(Error::topology("count policy requires count >= 1")),
            Self::Marker { marker } if marker.trim().is_empty() || marker.starts_with('/') => {
                Err(Error::topology(format!(
                    "marker '{marker}' must be a non-empty lot-relative path"
                )))
            }
            Self::MatchAll { patterns } if patterns.is_empty() => {
                Err(Error::topology("match_all policy requires at least one pattern"))
            }
            Self::Timeout { quiescence_secs: 0 } => {
                Err(Error::topology("timeout policy requires quiescence_secs >= 1"))
            }
            _ => Ok(()),
        }
    }

    /// Returns true if the policy can complete without a new observation,
    /// so open lots must be re-evaluated periodically.
    #[must_use]
    pub fn is_time_based(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Count {
                    accept_partial_after_secs: Some(_),
                    ..
                }
        )
    }

    /// Object paths to list in the manifest. Marker objects are excluded.
    #[must_use]
    pub fn manifest_paths(&self, observed: &ObservedSet) -> Vec<String> {
        observed
            .iter()
            .filter(|o| match self {
                Self::Marker { marker } => o.relative_path != *marker,
                _ => true,
            })
            .map(|o| o.path.clone())
            .collect()
    }
}

/// A validated policy with its globs compiled, built once per boundary.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    policy: CompletenessPolicy,
    matchers: Vec<GlobMatcher>,
}

impl CompiledPolicy {
    /// Validates and compiles a declared policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTopology`] if the policy is invalid or a glob
    /// does not parse.
    pub fn new(policy: &CompletenessPolicy) -> Result<Self> {
        policy.validate()?;
        let matchers = match policy {
            CompletenessPolicy::MatchAll { patterns } => patterns
                .iter()
                .map(|pattern| compile_glob(pattern))
                .collect::<Result<Vec<_>>>()?,
            _ => Vec::new(),
        };
        Ok(Self {
            policy: policy.clone(),
            matchers,
        })
    }

    /// The policy as declared.
    #[must_use]
    pub fn declared(&self) -> &CompletenessPolicy {
        &self.policy
    }

    /// See [`CompletenessPolicy::is_time_based`].
    #[must_use]
    pub fn is_time_based(&self) -> bool {
        self.policy.is_time_based()
    }

    /// See [`CompletenessPolicy::manifest_paths`].
    #[must_use]
    pub fn manifest_paths(&self, observed: &ObservedSet) -> Vec<String> {
        self.policy.manifest_paths(observed)
    }

    /// Evaluates the policy.
    #[must_use]
    pub fn evaluate(&self, observed: &ObservedSet, lot: &LotRecord, now: DateTime<Utc>) -> Verdict {
        match &self.policy {
            CompletenessPolicy::Count {
                count,
                accept_partial_after_secs,
            } => {
                let required = usize::try_from(*count).unwrap_or(usize::MAX);
                if observed.len() >= required {
                    return Verdict::Complete(ManifestState::Complete);
                }
                let partial_due = accept_partial_after_secs.is_some_and(|secs| {
                    elapsed_between(lot.opened_at, now) >= Duration::from_secs(secs)
                });
                if partial_due && !observed.is_empty() {
                    Verdict::Complete(ManifestState::Partial)
                } else {
                    Verdict::Incomplete
                }
            }
            CompletenessPolicy::Marker { marker } => {
                if !observed.contains_relative(marker) {
                    Verdict::Incomplete
                } else if observed.len() == 1 {
                    Verdict::Complete(ManifestState::Empty)
                } else {
                    Verdict::Complete(ManifestState::Complete)
                }
            }
            CompletenessPolicy::MatchAll { .. } => {
                let all_matched = self
                    .matchers
                    .iter()
                    .all(|glob| observed.iter().any(|o| glob.is_match(&o.relative_path)));
                if all_matched {
                    Verdict::Complete(ManifestState::Complete)
                } else {
                    Verdict::Incomplete
                }
            }
            CompletenessPolicy::Timeout { quiescence_secs } => {
                let quiet = elapsed_between(lot.last_observed_at, now)
                    >= Duration::from_secs(*quiescence_secs);
                if quiet && !observed.is_empty() {
                    Verdict::Complete(ManifestState::Complete)
                } else {
                    Verdict::Incomplete
                }
            }
        }
    }
}

fn compile_glob(pattern: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| Error::topology(format!("invalid glob '{pattern}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lot::ObservedObject;
    use chrono::TimeZone;
    use weir_core::id::{BoundaryId, EventId, LotKey};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn lot() -> LotRecord {
        LotRecord::open(
            BoundaryId::new("raw").unwrap(),
            LotKey::new("2024-01-01").unwrap(),
            t0(),
        )
    }

    fn set(names: &[&str]) -> ObservedSet {
        names
            .iter()
            .map(|name| ObservedObject {
                path: format!("raw/2024-01-01/{name}"),
                relative_path: (*name).to_string(),
                size: 1,
                event_time: t0(),
                event_id: EventId::new(format!("evt-{name}")).unwrap(),
                observed_at: t0(),
            })
            .collect()
    }

    fn compile(policy: CompletenessPolicy) -> CompiledPolicy {
        CompiledPolicy::new(&policy).unwrap()
    }

    fn secs(n: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::seconds(n)
    }

    #[test]
    fn count_policy() {
        let policy = compile(CompletenessPolicy::Count {
            count: 2,
            accept_partial_after_secs: None,
        });
        assert_eq!(policy.evaluate(&set(&["a"]), &lot(), t0()), Verdict::Incomplete);
        assert_eq!(
            policy.evaluate(&set(&["a", "b"]), &lot(), t0()),
            Verdict::Complete(ManifestState::Complete)
        );
        assert_eq!(
            policy.evaluate(&set(&["a"]), &lot(), secs(1_000_000)),
            Verdict::Incomplete
        );
    }

    #[test]
    fn count_policy_accepts_partial_after_window() {
        let policy = compile(CompletenessPolicy::Count {
            count: 3,
            accept_partial_after_secs: Some(60),
        });
        assert_eq!(policy.evaluate(&set(&["a"]), &lot(), secs(59)), Verdict::Incomplete);
        assert_eq!(
            policy.evaluate(&set(&["a"]), &lot(), secs(60)),
            Verdict::Complete(ManifestState::Partial)
        );
        assert_eq!(policy.evaluate(&set(&[]), &lot(), secs(60)), Verdict::Incomplete);
        assert!(policy.is_time_based());
    }

    #[test]
    fn marker_policy_ignores_count() {
        let policy = compile(CompletenessPolicy::Marker {
            marker: "_SUCCESS".into(),
        });
        assert_eq!(
            policy.evaluate(&set(&["a", "b", "c"]), &lot(), t0()),
            Verdict::Incomplete
        );
        assert_eq!(
            policy.evaluate(&set(&["a", "_SUCCESS"]), &lot(), t0()),
            Verdict::Complete(ManifestState::Complete)
        );
        assert_eq!(
            policy.evaluate(&set(&["_SUCCESS"]), &lot(), t0()),
            Verdict::Complete(ManifestState::Empty)
        );
        assert_eq!(
            policy.manifest_paths(&set(&["a", "_SUCCESS"])),
            vec!["raw/2024-01-01/a".to_string()]
        );
        assert!(!policy.is_time_based());
    }

    #[test]
    fn match_all_needs_every_pattern() {
        let policy = compile(CompletenessPolicy::MatchAll {
            patterns: vec!["part-*.csv".into(), "schema.json".into()],
        });
        assert_eq!(
            policy.evaluate(&set(&["part-0.csv", "part-1.csv"]), &lot(), t0()),
            Verdict::Incomplete
        );
        assert_eq!(
            policy.evaluate(&set(&["part-0.csv", "schema.json"]), &lot(), t0()),
            Verdict::Complete(ManifestState::Complete)
        );
        assert!(CompletenessPolicy::MatchAll { patterns: vec![] }
            .validate()
            .is_err());
        assert!(CompiledPolicy::new(&CompletenessPolicy::MatchAll {
            patterns: vec!["[".into()]
        })
        .is_err());
        assert_eq!(
            policy.evaluate(&set(&["nested/part-0.csv", "schema.json"]), &lot(), t0()),
            Verdict::Incomplete
        );
    }

    #[test]
    fn timeout_policy_waits_for_quiescence() {
        let policy = compile(CompletenessPolicy::Timeout { quiescence_secs: 30 });
        let mut record = lot();
        record.last_observed_at = secs(100);

        assert_eq!(policy.evaluate(&set(&["a"]), &record, secs(129)), Verdict::Incomplete);
        assert_eq!(
            policy.evaluate(&set(&["a"]), &record, secs(130)),
            Verdict::Complete(ManifestState::Complete)
        );
    }

    #[test]
    fn evaluation_is_repeatable() {
        let policy = compile(CompletenessPolicy::Count {
            count: 2,
            accept_partial_after_secs: None,
        });
        let observed = set(&["a", "b"]);
        let first = policy.evaluate(&observed, &lot(), t0());
        for _ in 0..3 {
            assert_eq!(policy.evaluate(&observed, &lot(), t0()), first);
        }
    }

    #[test]
    fn validation_and_declaration_shape() {
        let policy: CompletenessPolicy =
            serde_json::from_str(r#"{"kind":"count","count":2}"#).unwrap();
        assert!(policy.validate().is_ok());

        let zero: CompletenessPolicy = serde_json::from_str(r#"{"kind":"count","count":0}"#).unwrap();
        assert!(zero.validate().is_err());
        assert!(CompletenessPolicy::Marker { marker: "/abs".into() }.validate().is_err());
        assert!(CompletenessPolicy::Timeout { quiescence_secs: 0 }.validate().is_err());
        assert!(serde_json::from_str::<CompletenessPolicy>(r#"{"kind":"sometimes"}"#).is_err());
    }
}
