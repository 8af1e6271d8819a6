pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

/// Joint-encoder snapshot for one arm, as delivered by the robot interface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JointReading {
    pub timestamp: f64,
    pub arm: usize,
    pub positions: Vec<f64>,
}

/// Committed estimate published after every cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Estimate {
    /// Cycle counter of the estimator that produced this estimate
    pub cycle: u64,

    /// Flat state vector (layout defined by the pose codec)
    pub mean: StateVec,

    /// Posterior covariance (UKF) or weighted particle spread (PF)
    pub covariance: Option<StateCov>,
}

impl Estimate {
    pub fn covariance_trace(&self) -> Option<f64> {
        self.covariance.as_ref().map(|p| p.diagonal().sum())
    }
}
