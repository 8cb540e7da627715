//! Boundary path patterns and object filters.
//!
//! A pattern such as `raw/{date}` or `events/dt={day}/hour={hour}` names the
//! directory that holds a lot. Each segment is a literal, a `*` wildcard, or
//! a placeholder with an optional literal prefix and suffix. A path matches
//! when its leading segments match the pattern and at least one segment (the
//! object name) remains.

use std::collections::HashSet;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use weir_core::id::LotKey;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
    Capture {
        name: String,
        prefix: String,
        suffix: String,
    },
}

impl Segment {
    fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::topology("path pattern has an empty segment"));
        }
        if raw == "*" {
            return Ok(Self::Wildcard);
        }
        let Some(open) = raw.find('{') else {
            if raw.contains('}') {
                return Err(Error::topology(format!("unbalanced '}}' in segment '{raw}'")));
            }
            return Ok(Self::Literal(raw.to_string()));
        };
        let close = raw[open..]
            .find('}')
            .map(|offset| open + offset)
            .ok_or_else(|| Error::topology(format!("unclosed placeholder in segment '{raw}'")))?;

        let prefix = &raw[..open];
        let name = &raw[open + 1..close];
        let suffix = &raw[close + 1..];
        if prefix.contains('}') || suffix.contains(['{', '}']) {
            return Err(Error::topology(format!(
                "segment '{raw}' may hold at most one placeholder"
            )));
        }
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            return Err(Error::topology(format!(
                "invalid placeholder name '{name}' in segment '{raw}'"
            )));
        }
        Ok(Self::Capture {
            name: name.to_string(),
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        })
    }

    fn matches<'p>(&self, part: &'p str) -> Option<Option<&'p str>> {
        match self {
            Self::Literal(literal) => (literal == part).then_some(None),
            Self::Wildcard => Some(None),
            Self::Capture { prefix, suffix, .. } => {
                if part.len() <= prefix.len() + suffix.len()
                    || !part.starts_with(prefix.as_str())
                    || !part.ends_with(suffix.as_str())
                {
                    return None;
                }
                Some(Some(&part[prefix.len()..part.len() - suffix.len()]))
            }
        }
    }
}

/// A parsed boundary path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

/// Values captured by a successful pattern match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    /// Placeholder values in pattern order, as `(name, value)`.
    pub captures: Vec<(String, String)>,
    /// Path below the matched directory, e.g. `a.csv` or `part/b.csv`.
    pub relative_path: String,
}

impl PatternMatch {
    /// Joins the captured values with `/` into a lot key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTopology`] if the pattern has no placeholders,
    /// or a core error if the joined value is not a valid lot key.
    pub fn lot_key(&self) -> Result<LotKey> {
        if self.captures.is_empty() {
            return Err(Error::topology("pattern has no placeholders to derive a lot key"));
        }
        let joined = self
            .captures
            .iter()
            .map(|(_, value)| value.as_str())
            .collect::<Vec<_>>()
            .join("/");
        Ok(LotKey::new(joined)?)
    }
}

impl PathPattern {
    /// Parses a pattern such as `raw/{date}`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTopology`] for empty patterns, empty segments,
    /// malformed or duplicate placeholders.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            return Err(Error::topology("path pattern must not be empty"));
        }
        let segments = trimmed
            .split('/')
            .map(Segment::parse)
            .collect::<Result<Vec<_>>>()?;

        let mut seen = HashSet::new();
        for segment in &segments {
            if let Segment::Capture { name, .. } = segment {
                if !seen.insert(name.as_str()) {
                    return Err(Error::topology(format!(
                        "placeholder '{name}' appears twice in '{raw}'"
                    )));
                }
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// Returns the pattern as declared.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns placeholder names in declaration order.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Capture { name, .. } => Some(name.as_str()),
            _ => None,
        })
    }

    /// Matches a canonical object path against the pattern.
    ///
    /// Returns `None` when the path lies outside the pattern or names the
    /// lot directory itself.
    #[must_use]
    pub fn match_path(&self, path: &str) -> Option<PatternMatch> {
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() <= self.segments.len() {
            return None;
        }

        let mut captures = Vec::new();
        for (segment, part) in self.segments.iter().zip(&parts) {
            if let Some(value) = segment.matches(part)? {
                if let Segment::Capture { name, .. } = segment {
                    captures.push((name.clone(), value.to_string()));
                }
            }
        }

        Some(PatternMatch {
            captures,
            relative_path: parts[self.segments.len()..].join("/"),
        })
    }
}

/// Include/exclude globs declared on a boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathFilterDecl {
    /// Keep only objects matching one of these globs (all objects when empty).
    pub includes: Vec<String>,
    /// Drop objects matching any of these globs.
    pub excludes: Vec<String>,
    /// Match globs case-insensitively.
    pub ignore_case: bool,
}

/// Globs split by anchoring: relative ones match the path below the lot
/// directory, ones starting with `/` match the full object path.
#[derive(Debug, Clone)]
struct GlobGroup {
    relative: GlobSet,
    absolute: GlobSet,
}

impl GlobGroup {
    fn build(patterns: &[String], ignore_case: bool) -> Result<Option<Self>> {
        if patterns.is_empty() {
            return Ok(None);
        }
        let mut relative = GlobSetBuilder::new();
        let mut absolute = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = GlobBuilder::new(pattern)
                .case_insensitive(ignore_case)
                .literal_separator(true)
                .build()
                .map_err(|e| Error::topology(format!("invalid glob '{pattern}': {e}")))?;
            if pattern.starts_with('/') {
                absolute.add(glob);
            } else {
                relative.add(glob);
            }
        }
        let build = |builder: GlobSetBuilder| {
            builder
                .build()
                .map_err(|e| Error::topology(format!("invalid glob set: {e}")))
        };
        Ok(Some(Self {
            relative: build(relative)?,
            absolute: build(absolute)?,
        }))
    }

    fn matches(&self, full_path: &str, relative_path: &str) -> bool {
        self.relative.is_match(relative_path) || self.absolute.is_match(format!("/{full_path}"))
    }
}

/// Compiled include/exclude filter for a boundary.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    includes: Option<GlobGroup>,
    excludes: Option<GlobGroup>,
}

impl PathFilter {
    /// Compiles a filter declaration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTopology`] if a glob does not parse.
    pub fn new(decl: &PathFilterDecl) -> Result<Self> {
        Ok(Self {
            includes: GlobGroup::build(&decl.includes, decl.ignore_case)?,
            excludes: GlobGroup::build(&decl.excludes, decl.ignore_case)?,
        })
    }

    /// Returns true if the object should be tracked.
    #[must_use]
    pub fn allows(&self, full_path: &str, relative_path: &str) -> bool {
        let included = self
            .includes
            .as_ref()
            .map_or(true, |group| group.matches(full_path, relative_path));
        let excluded = self
            .excludes
            .as_ref()
            .is_some_and(|group| group.matches(full_path, relative_path));
        included && !excluded
    }
}
