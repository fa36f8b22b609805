//! Error types for period analysis.

use thiserror::Error;

/// Result type for period analysis operations.
pub type Result<T> = std::result::Result<T, PeriodError>;

/// Broad class of a [`PeriodError`].
///
/// Configuration and convergence errors abort the current operation.
/// Numeric degeneracies are normally absorbed by the scan (the offending
/// candidate gets zero power) and only surface from operations that have no
/// candidate to discard, such as model reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    NumericDegeneracy,
    Convergence,
}

/// Error types for period analysis operations.
#[derive(Error, Debug)]
pub enum PeriodError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient data: need at least {needed} observations, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("Invalid parameter '{param}' = '{value}': {reason}")]
    InvalidParameter {
        param: String,
        value: String,
        reason: String,
    },

    #[error("Degenerate frequencies: {0}")]
    DegenerateFrequencies(String),

    #[error("Zero variance: the magnitudes carry no signal")]
    ZeroVariance,

    #[error("Singular normal matrix of dimension {dim}")]
    SingularMatrix { dim: usize },

    #[error("Convergence failure: {0}")]
    ConvergenceFailure(String),
}

impl PeriodError {
    /// Shorthand for an [`PeriodError::InvalidParameter`].
    pub(crate) fn invalid_parameter(
        param: &str,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        PeriodError::InvalidParameter {
            param: param.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Classify the error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            PeriodError::InvalidInput(_)
            | PeriodError::InsufficientData { .. }
            | PeriodError::InvalidParameter { .. } => ErrorCategory::Configuration,
            PeriodError::DegenerateFrequencies(_)
            | PeriodError::ZeroVariance
            | PeriodError::SingularMatrix { .. } => ErrorCategory::NumericDegeneracy,
            PeriodError::ConvergenceFailure(_) => ErrorCategory::Convergence,
        }
    }

    /// Convert to a stable integer error code.
    pub fn to_code(&self) -> i32 {
        match self {
            PeriodError::InvalidInput(_) => 1,
            PeriodError::InsufficientData { .. } => 2,
            PeriodError::InvalidParameter { .. } => 3,
            PeriodError::DegenerateFrequencies(_) => 4,
            PeriodError::ZeroVariance => 5,
            PeriodError::SingularMatrix { .. } => 6,
            PeriodError::ConvergenceFailure(_) => 7,
        }
    }
}
