//! Linear algebra type system for the tool tracker
//!
//! The state dimension is fixed per estimator instance but not at compile
//! time (single-arm and dual-arm layouts share one estimator type), so the
//! estimators work on nalgebra's dynamically sized vectors and matrices.

use nalgebra::{DMatrix, DVector};

// ===== State Dimensions =====
pub const POSITION_DIM: usize = 3;
pub const ORIENTATION_DIM: usize = 3;
pub const JOINT_ANGLE_DIM: usize = 3;

/// One arm: position + axis-angle + three wrist joint angles.
pub const STATE_DIM_SINGLE_ARM: usize = POSITION_DIM + ORIENTATION_DIM + JOINT_ANGLE_DIM; // 9

/// Two arms, six pose parameters each, no joint angles.
pub const STATE_DIM_DUAL_ARM: usize = 2 * (POSITION_DIM + ORIENTATION_DIM); // 12

/// Two arms with joint angles.
pub const STATE_DIM_DUAL_ARM_JOINTS: usize = 2 * STATE_DIM_SINGLE_ARM; // 18

// ===== Filter Types =====
pub type StateVec = DVector<f64>;
pub type StateCov = DMatrix<f64>;

/// Measurement vectors are sized per cycle (rendered correspondence count).
pub type MeasurementVec = DVector<f64>;
pub type MeasurementCov = DMatrix<f64>;

/// Cross covariance between state and measurement space (L x m).
pub type CrossCov = DMatrix<f64>;
pub type KalmanGain = DMatrix<f64>;

// ===== Sigma Point Types (for UKF) =====
pub type SigmaWeightVec = DVector<f64>;

/// 2L + 1
pub const fn sigma_count(state_dim: usize) -> usize {
    2 * state_dim + 1
}

/// Force symmetry: (P + P^T) / 2
pub fn symmetrize(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    (matrix + matrix.transpose()) * 0.5
}

/// Largest absolute difference between `P` and `P^T`.
pub fn asymmetry(matrix: &DMatrix<f64>) -> f64 {
    let mut worst: f64 = 0.0;
    for i in 0..matrix.nrows() {
        for j in (i + 1)..matrix.ncols() {
            worst = worst.max((matrix[(i, j)] - matrix[(j, i)]).abs());
        }
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimensions() {
        assert_eq!(STATE_DIM_SINGLE_ARM, 9);
        assert_eq!(STATE_DIM_DUAL_ARM, 12);
        assert_eq!(sigma_count(STATE_DIM_SINGLE_ARM), 19);
        assert_eq!(sigma_count(1), 3);
    }

    #[test]
    fn test_symmetrize() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 4.0, 3.0]);
        let s = symmetrize(&m);
        assert_eq!(s[(0, 1)], 3.0);
        assert_eq!(s[(1, 0)], 3.0);
        assert_eq!(asymmetry(&s), 0.0);
        assert_eq!(asymmetry(&m), 2.0);
    }
}
