//! Problem-construction error types.

use thiserror::Error;

/// Errors raised while turning a declarative problem description into an
/// optimization problem.
///
/// Construction is atomic: when any term fails to hatch, no partial problem
/// is returned.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// A term type string had no registered factory.
    #[error("unknown term type: {0}")]
    UnknownTermType(String),

    /// A term was requested with a kind it does not support.
    #[error("term '{term}' does not support being added as a {kind}")]
    UnsupportedTermKind {
        /// Name of the offending term.
        term: String,
        /// The requested kind ("cost" or "constraint").
        kind: String,
    },

    /// A coefficient or target vector did not match the problem DOF.
    #[error("term '{term}' field '{field}' has length {actual}, expected {expected}")]
    SizeMismatch {
        /// Name of the offending term.
        term: String,
        /// Which field was mis-sized.
        field: String,
        /// Required length.
        expected: usize,
        /// Provided length.
        actual: usize,
    },

    /// A step range fell outside `[0, n_steps - 1]`.
    #[error("term '{term}' step range [{first}, {last}] is invalid for {n_steps} steps")]
    StepRangeOutOfBounds {
        /// Name of the offending term.
        term: String,
        /// First step of the range.
        first: i64,
        /// Last step of the range.
        last: i64,
        /// Number of steps in the problem.
        n_steps: usize,
    },

    /// A term requiring the `1/dt` column was added to a timeless problem.
    #[error("term '{0}' requires use_time but the problem has no time column")]
    MissingTimeColumn(String),

    /// A provided value was structurally invalid.
    #[error("invalid configuration: {reason}")]
    InvalidValue {
        /// Description of the problem.
        reason: String,
    },
}

impl ConfigError {
    /// Create an [`ConfigError::InvalidValue`] from anything stringy.
    #[must_use]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            reason: reason.into(),
        }
    }

    /// Create an [`ConfigError::UnsupportedTermKind`].
    #[must_use]
    pub fn unsupported_kind(term: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::UnsupportedTermKind {
            term: term.into(),
            kind: kind.into(),
        }
    }
}
