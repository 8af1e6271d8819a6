//! Unscented transform core
//!
//! Sigma-point generation from a (mean, covariance) pair, the scaled weight
//! sets, and the weighted recombination shared by prediction (state space)
//! and correction (measurement space).

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{NumericalCondition, TrackResult, TrackingError};
use crate::types::{sigma_count, symmetrize, CrossCov, SigmaWeightVec, StateCov, StateVec};

/// Negative pivots smaller than this are rounding noise of a PSD matrix, not instability.
const PIVOT_TOLERANCE: f64 = 1e-12;

/// Unscented transform parameters
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnscentedParams {
    /// Spread of sigma points
    pub alpha: f64,
    /// Secondary scaling (0.0 or 3 - L)
    pub kappa: f64,
    /// Prior knowledge (2.0 for Gaussian)
    pub beta: f64,
}

impl Default for UnscentedParams {
    fn default() -> Self {
        Self {
            alpha: 0.005,
            kappa: 0.0,
            beta: 2.0,
        }
    }
}

impl UnscentedParams {
    /// lambda = alpha^2 (L + kappa) - L
    pub fn lambda(&self, state_dim: usize) -> f64 {
        let l = state_dim as f64;
        self.alpha * self.alpha * (l + self.kappa) - l
    }

    pub fn validate(&self, state_dim: usize) -> TrackResult<()> {
        if state_dim == 0 {
            return Err(TrackingError::InvalidConfig(
                "state dimension must be >= 1".to_string(),
            ));
        }
        if !(self.alpha > 0.0 && self.alpha.is_finite()) {
            return Err(TrackingError::InvalidConfig(format!(
                "alpha must be positive, got {}",
                self.alpha
            )));
        }
        if !(self.kappa.is_finite() && self.beta.is_finite()) {
            return Err(TrackingError::InvalidConfig(
                "kappa and beta must be finite".to_string(),
            ));
        }
        // L + lambda = alpha^2 (L + kappa) has to stay positive for gamma to exist
        if state_dim as f64 + self.kappa <= 0.0 {
            return Err(TrackingError::InvalidConfig(format!(
                "L + kappa must be positive, got {}",
                state_dim as f64 + self.kappa
            )));
        }
        Ok(())
    }
}

/// Mean and covariance weights for 2L + 1 sigma points
#[derive(Clone, Debug, PartialEq)]
pub struct SigmaWeights {
    pub mean: SigmaWeightVec,
    pub covariance: SigmaWeightVec,
    pub lambda: f64,
    /// sqrt(L + lambda)
    pub gamma: f64,
}

impl SigmaWeights {
    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }
}

pub fn compute_weights(state_dim: usize, params: &UnscentedParams) -> TrackResult<SigmaWeights> {
    params.validate(state_dim)?;

    let count = sigma_count(state_dim);
    let lambda = params.lambda(state_dim);
    let spread = state_dim as f64 + lambda;

    let mut mean = SigmaWeightVec::zeros(count);
    let mut covariance = SigmaWeightVec::zeros(count);

    mean[0] = lambda / spread;
    covariance[0] = lambda / spread + (1.0 - params.alpha * params.alpha + params.beta);
    for i in 1..count {
        mean[i] = 1.0 / (2.0 * spread);
        covariance[i] = 1.0 / (2.0 * spread);
    }

    Ok(SigmaWeights {
        mean,
        covariance,
        lambda,
        gamma: spread.sqrt(),
    })
}

/// Lower-triangular square root with the indices whose pivots had to be clamped.
#[derive(Clone, Debug)]
pub struct SquareRoot {
    pub factor: DMatrix<f64>,
    pub clamped: Vec<usize>,
}

impl SquareRoot {
    pub fn condition(&self) -> Option<NumericalCondition> {
        (!self.clamped.is_empty()).then_some(NumericalCondition::NumericalInstability)
    }
}

/// Cholesky factorization `A = S S^T` that never emits NaN.
///
/// A negative pivot is clamped to zero before its root is taken and the index is
/// recorded; the column below a zero pivot is zeroed. A zero matrix is a valid
/// input and yields a zero factor without any clamping.
pub fn cholesky_clamped(a: &DMatrix<f64>) -> TrackResult<SquareRoot> {
    if !a.is_square() {
        return Err(TrackingError::DimensionMismatch {
            what: "covariance columns",
            expected: a.nrows(),
            actual: a.ncols(),
        });
    }

    let n = a.nrows();
    let mut s = DMatrix::<f64>::zeros(n, n);
    let mut clamped = Vec::new();

    for j in 0..n {
        let mut pivot = a[(j, j)];
        for k in 0..j {
            pivot -= s[(j, k)] * s[(j, k)];
        }
        if pivot < -PIVOT_TOLERANCE || !pivot.is_finite() {
            clamped.push(j);
        }
        let root = if pivot.is_finite() { pivot.max(0.0).sqrt() } else { 0.0 };
        s[(j, j)] = root;

        if root <= 0.0 {
            continue;
        }
        for i in (j + 1)..n {
            let mut sum = a[(i, j)];
            for k in 0..j {
                sum -= s[(i, k)] * s[(j, k)];
            }
            s[(i, j)] = sum / root;
        }
    }

    Ok(SquareRoot { factor: s, clamped })
}

/// Sigma points of one cycle
#[derive(Clone, Debug)]
pub struct SigmaPoints {
    pub points: Vec<StateVec>,
    /// Covariance diagonal indices clamped while taking the square root
    pub clamped: Vec<usize>,
}

impl SigmaPoints {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn condition(&self) -> Option<NumericalCondition> {
        (!self.clamped.is_empty()).then_some(NumericalCondition::NumericalInstability)
    }
}

/// Point 0 is the mean; points i and i + L move +/- gamma along column i of sqrt(P).
pub fn generate_sigma_points(
    mean: &StateVec,
    covariance: &StateCov,
    gamma: f64,
) -> TrackResult<SigmaPoints> {
    let l = mean.len();
    if covariance.nrows() != l || covariance.ncols() != l {
        return Err(TrackingError::DimensionMismatch {
            what: "covariance",
            expected: l,
            actual: covariance.nrows().max(covariance.ncols()),
        });
    }

    let root = cholesky_clamped(covariance)?;

    let mut points = Vec::with_capacity(sigma_count(l));
    points.push(mean.clone());
    for i in 0..l {
        let offset = root.factor.column(i) * gamma;
        points.push(mean + &offset);
    }
    for i in 0..l {
        let offset = root.factor.column(i) * gamma;
        points.push(mean - &offset);
    }

    Ok(SigmaPoints {
        points,
        clamped: root.clamped,
    })
}

/// Weighted mean and covariance of a point set, plus optional additive noise.
pub fn recombine(
    points: &[DVector<f64>],
    weights: &SigmaWeights,
    additive_noise: Option<&DMatrix<f64>>,
) -> TrackResult<(DVector<f64>, DMatrix<f64>)> {
    if points.len() != weights.len() {
        return Err(TrackingError::DimensionMismatch {
            what: "sigma point count",
            expected: weights.len(),
            actual: points.len(),
        });
    }
    let dim = points.first().map(|p| p.len()).unwrap_or(0);
    if let Some(bad) = points.iter().find(|p| p.len() != dim) {
        return Err(TrackingError::DimensionMismatch {
            what: "sigma point length",
            expected: dim,
            actual: bad.len(),
        });
    }

    let mut mean = DVector::<f64>::zeros(dim);
    for (point, &w) in points.iter().zip(weights.mean.iter()) {
        mean.axpy(w, point, 1.0);
    }

    let mut covariance = DMatrix::<f64>::zeros(dim, dim);
    for (point, &w) in points.iter().zip(weights.covariance.iter()) {
        let residual = point - &mean;
        covariance.ger(w, &residual, &residual, 1.0);
    }

    if let Some(noise) = additive_noise {
        if noise.nrows() != dim || noise.ncols() != dim {
            return Err(TrackingError::DimensionMismatch {
                what: "additive noise",
                expected: dim,
                actual: noise.nrows(),
            });
        }
        covariance += noise;
    }

    Ok((mean, symmetrize(&covariance)))
}

/// Sum of w_c[i] (x_i - x_mean)(z_i - z_mean)^T
pub fn cross_covariance(
    x_points: &[DVector<f64>],
    x_mean: &DVector<f64>,
    z_points: &[DVector<f64>],
    z_mean: &DVector<f64>,
    weights: &SigmaWeights,
) -> TrackResult<CrossCov> {
    if x_points.len() != weights.len() || z_points.len() != weights.len() {
        return Err(TrackingError::DimensionMismatch {
            what: "sigma point count",
            expected: weights.len(),
            actual: x_points.len().min(z_points.len()),
        });
    }

    let mut sigma_xz = CrossCov::zeros(x_mean.len(), z_mean.len());
    for ((x, z), &w) in x_points.iter().zip(z_points).zip(weights.covariance.iter()) {
        let dx = x - x_mean;
        let dz = z - z_mean;
        sigma_xz.ger(w, &dx, &dz, 1.0);
    }
    Ok(sigma_xz)
}

/// Weights and dimension bound together for one estimator instance
#[derive(Clone, Debug)]
pub struct UnscentedTransform {
    dim: usize,
    params: UnscentedParams,
    weights: SigmaWeights,
}

impl UnscentedTransform {
    pub fn new(dim: usize, params: UnscentedParams) -> TrackResult<Self> {
        let weights = compute_weights(dim, &params)?;
        Ok(Self {
            dim,
            params,
            weights,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn params(&self) -> &UnscentedParams {
        &self.params
    }

    pub fn weights(&self) -> &SigmaWeights {
        &self.weights
    }

    pub fn sigma_points(&self, mean: &StateVec, covariance: &StateCov) -> TrackResult<SigmaPoints> {
        if mean.len() != self.dim {
            return Err(TrackingError::MalformedState {
                expected: self.dim,
                actual: mean.len(),
            });
        }
        generate_sigma_points(mean, covariance, self.weights.gamma)
    }

    pub fn recombine(
        &self,
        points: &[DVector<f64>],
        additive_noise: Option<&DMatrix<f64>>,
    ) -> TrackResult<(DVector<f64>, DMatrix<f64>)> {
        recombine(points, &self.weights, additive_noise)
    }

    pub fn cross_covariance(
        &self,
        x_points: &[DVector<f64>],
        x_mean: &DVector<f64>,
        z_points: &[DVector<f64>],
        z_mean: &DVector<f64>,
    ) -> TrackResult<CrossCov> {
        cross_covariance(x_points, x_mean, z_points, z_mean, &self.weights)
    }
}
