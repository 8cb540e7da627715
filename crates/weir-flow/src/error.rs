//! Error types for the completion and triggering engine.
//!
//! Outcomes that are part of normal control flow are deliberately absent
//! here: an existing manifest is [`CompletionResult::AlreadyExists`] and a
//! held lease is [`AcquireResult::AlreadyLeased`].
//!
//! [`CompletionResult::AlreadyExists`]: crate::manifest::CompletionResult::AlreadyExists
//! [`AcquireResult::AlreadyLeased`]: crate::lease::AcquireResult::AlreadyLeased

use std::fmt;

/// The result type used throughout `weir-flow`.
pub type Result<T> = std::result::Result<T, Error>;

/// Why an object event could not be mapped to a lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnresolvedReason {
    /// The event names a boundary absent from the topology.
    UnknownBoundary,
    /// The path does not match the boundary's path pattern.
    PatternMismatch,
    /// The path matched but was excluded by the boundary's filter.
    Filtered,
}

impl UnresolvedReason {
    /// Returns the label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownBoundary => "unknown_boundary",
            Self::PatternMismatch => "pattern_mismatch",
            Self::Filtered => "filtered",
        }
    }
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A raw notification record could not be turned into an object event.
    #[error("malformed event: {reason}")]
    MalformedEvent {
        /// What was wrong with the record.
        reason: String,
    },

    /// An object event could not be mapped to a lot of its boundary.
    #[error("unresolved lot for '{path}' on boundary '{boundary_id}': {reason}")]
    UnresolvedLot {
        /// Boundary named by the event.
        boundary_id: String,
        /// Canonical object path.
        path: String,
        /// Why resolution failed.
        reason: UnresolvedReason,
    },

    /// A dispatch exhausted its retry budget and was surfaced to operators.
    #[error("dispatch of arc '{arc_id}' for lot '{lot_key}' exhausted after {attempts} attempts: {last_error}")]
    DispatchExhausted {
        /// Arc being dispatched.
        arc_id: String,
        /// Lot being dispatched.
        lot_key: String,
        /// Attempts made.
        attempts: u32,
        /// Last dispatch failure.
        last_error: String,
    },

    /// The topology declaration is inconsistent.
    #[error("invalid topology: {message}")]
    InvalidTopology {
        /// Description of the problem.
        message: String,
    },

    /// Engine configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// A lot record was asked to move backwards in its lifecycle.
    #[error("invalid lot transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// A finished arc reported sink results that do not fit its declaration.
    #[error("invalid result for arc '{arc_id}': {message}")]
    InvalidArcResult {
        /// Reporting arc.
        arc_id: String,
        /// Description of the problem.
        message: String,
    },

    /// A compare-and-swap loop kept losing to concurrent writers.
    #[error("contention on '{key}' after {attempts} attempts")]
    Contention {
        /// Storage key under contention.
        key: String,
        /// Attempts made.
        attempts: u32,
    },

    /// An error from the core primitives.
    #[error(transparent)]
    Core(#[from] weir_core::Error),
}

impl Error {
    /// Returns true when retrying the failed operation may succeed.
    ///
    /// Storage failures and CAS contention are transient. Malformed input,
    /// unresolved paths and invalid declarations never are.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Core(inner) => inner.is_transient(),
            Self::Contention { .. } => true,
            _ => false,
        }
    }

    /// Creates a malformed-event error.
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            reason: reason.into(),
        }
    }

    /// Creates an invalid-topology error.
    #[must_use]
    pub fn topology(message: impl Into<String>) -> Self {
        Self::InvalidTopology {
            message: message.into(),
        }
    }

    /// Creates an invalid-configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::from(weir_core::Error::storage("503")).is_transient());
        assert!(Error::Contention {
            key: "k".into(),
            attempts: 3
        }
        .is_transient());
        assert!(!Error::malformed("bad json").is_transient());
        assert!(!Error::from(weir_core::Error::NotFound("x".into())).is_transient());
    }

    #[test]
    fn unresolved_lot_message_names_reason() {
        let err = Error::UnresolvedLot {
            boundary_id: "raw".into(),
            path: "tmp/x".into(),
            reason: UnresolvedReason::PatternMismatch,
        };
        assert!(err.to_string().ends_with("pattern_mismatch"));
    }
}
