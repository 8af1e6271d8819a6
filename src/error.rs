use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tool tracker error types
///
/// These are hard failures surfaced to the caller. Numerical trouble inside a
/// cycle is reported as a [`NumericalCondition`] instead, so the estimator keeps
/// producing an estimate every cycle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackingError {
    #[error("Malformed state vector: expected {expected} elements, got {actual}")]
    MalformedState { expected: usize, actual: usize },

    #[error("Dimension mismatch in {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Measurement oracle failed: {0}")]
    Oracle(String),

    #[error("Estimation cycle cancelled")]
    Cancelled,

    #[error("Evaluation worker panicked")]
    WorkerPanicked,

    #[error("Estimator not initialized")]
    NotInitialized,
}

/// Result type for tracker operations
pub type TrackResult<T> = Result<T, TrackingError>;

/// Recoverable conditions raised during a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NumericalCondition {
    /// Covariance was not positive-definite; offending Cholesky terms were clamped
    NumericalInstability,

    /// Innovation covariance singular; correction skipped for the cycle
    DegenerateInnovationCovariance,

    /// Particle weights collapsed; fell back to uniform weights
    DegenerateWeights,

    /// Measurement sigma points disagreed on dimension; correction skipped
    MeasurementDimensionMismatch,

    /// A stereo projection matrix was still all zeros; vision step skipped
    ProjectionUnset,
}

impl NumericalCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            NumericalCondition::NumericalInstability => "numerical_instability",
            NumericalCondition::DegenerateInnovationCovariance => "degenerate_innovation_covariance",
            NumericalCondition::DegenerateWeights => "degenerate_weights",
            NumericalCondition::MeasurementDimensionMismatch => "measurement_dimension_mismatch",
            NumericalCondition::ProjectionUnset => "projection_unset",
        }
    }
}

/// Push a condition once per cycle.
pub(crate) fn raise(conditions: &mut Vec<NumericalCondition>, condition: NumericalCondition) {
    if !conditions.contains(&condition) {
        conditions.push(condition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_state_message() {
        let err = TrackingError::MalformedState {
            expected: 9,
            actual: 7,
        };
        assert_eq!(
            err.to_string(),
            "Malformed state vector: expected 9 elements, got 7"
        );
    }

    #[test]
    fn test_raise_deduplicates() {
        let mut conditions = Vec::new();
        raise(&mut conditions, NumericalCondition::NumericalInstability);
        raise(&mut conditions, NumericalCondition::NumericalInstability);
        raise(&mut conditions, NumericalCondition::DegenerateWeights);
        assert_eq!(conditions.len(), 2);
    }
}
