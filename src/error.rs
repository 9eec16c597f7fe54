//! Error types shared by every operator.
//!
//! All failures are synchronous and surface before any output tensor or
//! caller-owned buffer is touched. Nothing is retried internally.

use thiserror::Error;

/// Failure raised by an operator or stage.
///
/// Each variant records the name of the operation that rejected its inputs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    /// Tensor shapes are incompatible with each other or with the parameters.
    #[error("shape mismatch in '{op}': {detail}")]
    ShapeMismatch {
        /// Operation that failed.
        op: &'static str,
        /// What did not line up.
        detail: String,
    },

    /// A parameter, tag, or gradient request is malformed.
    #[error("invalid argument in '{op}': {reason}")]
    InvalidArgument {
        /// Operation that failed.
        op: &'static str,
        /// Why the argument was rejected.
        reason: String,
    },

    /// Inputs use a precision combination the operator does not support.
    #[error("numeric policy violation in '{op}': {reason}")]
    NumericPolicyViolation {
        /// Operation that failed.
        op: &'static str,
        /// Which precisions clashed.
        reason: String,
    },
}

impl OpError {
    pub(crate) fn shape(op: &'static str, detail: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            op,
            detail: detail.into(),
        }
    }

    /// Shape mismatch between an expected and an actual shape.
    pub(crate) fn shapes(op: &'static str, what: &str, expected: &[usize], got: &[usize]) -> Self {
        Self::shape(op, format!("{what}: expected {expected:?}, got {got:?}"))
    }

    pub(crate) fn invalid(op: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            op,
            reason: reason.into(),
        }
    }

    pub(crate) fn precision(op: &'static str, reason: impl Into<String>) -> Self {
        Self::NumericPolicyViolation {
            op,
            reason: reason.into(),
        }
    }

    /// Name of the operation that produced the error.
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            Self::ShapeMismatch { op, .. }
            | Self::InvalidArgument { op, .. }
            | Self::NumericPolicyViolation { op, .. } => op,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = core::result::Result<T, OpError>;
