//! Motion models
//!
//! State in, kinematic hint in, predicted state out. The prediction is biased
//! toward the forward-kinematics coarse guess; process noise is additive and
//! tuned per parameter group (position, orientation, joint angle).

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::config::{PerGroup, TrackerConfig};
use crate::error::{TrackResult, TrackingError};
use crate::pose::StateLayout;
use crate::types::{StateCov, StateVec};

/// Process-noise variances per parameter group
pub type ProcessNoise = PerGroup;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionModelKind {
    /// Blend the prior toward the current coarse guess
    CoarseGuessBias,
    /// Apply the coarse-guess motion since the previous cycle to the prior
    KinematicIncrement,
}

/// Coarse guess from joint encoders, encoded in the estimator's state layout.
#[derive(Clone, Debug, PartialEq)]
pub struct KinematicHint {
    pub current: StateVec,
    pub previous: Option<StateVec>,
}

impl KinematicHint {
    pub fn new(current: StateVec) -> Self {
        Self {
            current,
            previous: None,
        }
    }

    pub fn with_previous(current: StateVec, previous: Option<StateVec>) -> Self {
        Self { current, previous }
    }

    pub fn check(&self, dim: usize) -> TrackResult<()> {
        for v in std::iter::once(&self.current).chain(self.previous.as_ref()) {
            if v.len() != dim {
                return Err(TrackingError::MalformedState {
                    expected: dim,
                    actual: v.len(),
                });
            }
        }
        Ok(())
    }
}

pub trait MotionModel: Send + Sync {
    /// Deterministic part of the prediction.
    fn propagate(&self, prior: &StateVec, hint: &KinematicHint) -> StateVec;

    /// Additive process-noise covariance Q (L x L).
    fn process_noise(&self) -> &StateCov;

    /// Propagate and inject independent Gaussian noise drawn from Q's diagonal.
    fn predict<R: Rng + ?Sized>(&self, prior: &StateVec, hint: &KinematicHint, rng: &mut R) -> StateVec
    where
        Self: Sized,
    {
        let mut predicted = self.propagate(prior, hint);
        let q = self.process_noise();
        for i in 0..predicted.len() {
            let std = q[(i, i)].max(0.0).sqrt();
            if std > 0.0 {
                let draw: f64 = StandardNormal.sample(rng);
                predicted[i] += std * draw;
            }
        }
        predicted
    }
}

fn blend(prior: &StateVec, target: &StateVec, weight: f64) -> StateVec {
    prior + (target - prior) * weight
}

/// predicted = prior + w (hint - prior)
#[derive(Clone, Debug)]
pub struct CoarseGuessBias {
    weight: f64,
    noise: StateCov,
}

impl CoarseGuessBias {
    pub fn new(layout: &StateLayout, weight: f64, noise: &ProcessNoise) -> Self {
        Self {
            weight: weight.clamp(0.0, 1.0),
            noise: layout.group_diagonal(noise.position, noise.orientation, noise.joint_angle),
        }
    }
}

impl MotionModel for CoarseGuessBias {
    fn propagate(&self, prior: &StateVec, hint: &KinematicHint) -> StateVec {
        blend(prior, &hint.current, self.weight)
    }

    fn process_noise(&self) -> &StateCov {
        &self.noise
    }
}

/// predicted = prior + (hint_now - hint_prev); falls back to the bias model on the first cycle.
#[derive(Clone, Debug)]
pub struct KinematicIncrement {
    fallback_weight: f64,
    noise: StateCov,
}

impl KinematicIncrement {
    pub fn new(layout: &StateLayout, fallback_weight: f64, noise: &ProcessNoise) -> Self {
        Self {
            fallback_weight: fallback_weight.clamp(0.0, 1.0),
            noise: layout.group_diagonal(noise.position, noise.orientation, noise.joint_angle),
        }
    }
}

impl MotionModel for KinematicIncrement {
    fn propagate(&self, prior: &StateVec, hint: &KinematicHint) -> StateVec {
        match &hint.previous {
            Some(previous) => prior + (&hint.current - previous),
            None => blend(prior, &hint.current, self.fallback_weight),
        }
    }

    fn process_noise(&self) -> &StateCov {
        &self.noise
    }
}

/// Config-selected motion model
#[derive(Clone, Debug)]
pub enum AnyMotionModel {
    CoarseGuessBias(CoarseGuessBias),
    KinematicIncrement(KinematicIncrement),
}

impl AnyMotionModel {
    pub fn from_config(config: &TrackerConfig, layout: &StateLayout) -> Self {
        match config.motion_model {
            MotionModelKind::CoarseGuessBias => AnyMotionModel::CoarseGuessBias(CoarseGuessBias::new(
                layout,
                config.kinematic_weight,
                &config.process_noise,
            )),
            MotionModelKind::KinematicIncrement => AnyMotionModel::KinematicIncrement(
                KinematicIncrement::new(layout, config.kinematic_weight, &config.process_noise),
            ),
        }
    }
}

impl MotionModel for AnyMotionModel {
    fn propagate(&self, prior: &StateVec, hint: &KinematicHint) -> StateVec {
        match self {
            AnyMotionModel::CoarseGuessBias(m) => m.propagate(prior, hint),
            AnyMotionModel::KinematicIncrement(m) => m.propagate(prior, hint),
        }
    }

    fn process_noise(&self) -> &StateCov {
        match self {
            AnyMotionModel::CoarseGuessBias(m) => m.process_noise(),
            AnyMotionModel::KinematicIncrement(m) => m.process_noise(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn noise() -> ProcessNoise {
        PerGroup::new(0.0006, 0.0008, 0.0001)
    }

    #[test]
    fn test_bias_blends_toward_hint() {
        let layout = StateLayout::single_arm();
        let model = CoarseGuessBias::new(&layout, 0.25, &noise());
        let prior = StateVec::zeros(9);
        let hint = KinematicHint::new(StateVec::from_element(9, 4.0));
        let predicted = model.propagate(&prior, &hint);
        assert_relative_eq!(predicted, StateVec::from_element(9, 1.0), epsilon = 1e-12);

        let full = CoarseGuessBias::new(&layout, 1.0, &noise());
        assert_eq!(full.propagate(&prior, &hint), hint.current);
    }

    #[test]
    fn test_process_noise_is_group_diagonal() {
        let model = CoarseGuessBias::new(&StateLayout::single_arm(), 0.5, &noise());
        let q = model.process_noise();
        assert_eq!(q[(0, 0)], 0.0006);
        assert_eq!(q[(5, 5)], 0.0008);
        assert_eq!(q[(7, 7)], 0.0001);
        assert_eq!(q[(1, 0)], 0.0);
    }

    #[test]
    fn test_increment_applies_kinematic_delta() {
        let layout = StateLayout::dual_arm();
        let model = KinematicIncrement::new(&layout, 0.5, &noise());
        let prior = StateVec::from_element(12, 1.0);
        let hint = KinematicHint::with_previous(
            StateVec::from_element(12, 3.0),
            Some(StateVec::from_element(12, 2.5)),
        );
        assert_relative_eq!(
            model.propagate(&prior, &hint),
            StateVec::from_element(12, 1.5),
            epsilon = 1e-12
        );

        // First cycle: no previous hint, bias with the fallback weight
        let first = KinematicHint::new(StateVec::from_element(12, 3.0));
        assert_relative_eq!(
            model.propagate(&prior, &first),
            StateVec::from_element(12, 2.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_noisy_prediction_statistics() {
        let layout = StateLayout::single_arm();
        let model = CoarseGuessBias::new(&layout, 1.0, &PerGroup::new(0.01, 0.0, 0.0));
        let hint = KinematicHint::new(StateVec::zeros(9));
        let mut rng = StdRng::seed_from_u64(42);

        let n = 4000;
        let mut sum_sq = 0.0;
        for _ in 0..n {
            let x = model.predict(&StateVec::zeros(9), &hint, &mut rng);
            // Zero-variance groups stay exactly on the hint
            assert_eq!(x[4], 0.0);
            assert_eq!(x[8], 0.0);
            sum_sq += x[0] * x[0];
        }
        let variance = sum_sq / n as f64;
        assert!((variance - 0.01).abs() < 0.002, "variance {variance}");
    }

    #[test]
    fn test_hint_check() {
        let hint = KinematicHint::with_previous(StateVec::zeros(9), Some(StateVec::zeros(8)));
        assert!(hint.check(9).is_err());
        assert!(KinematicHint::new(StateVec::zeros(9)).check(9).is_ok());
    }

    #[test]
    fn test_from_config() {
        let mut config = TrackerConfig::default();
        config.motion_model = MotionModelKind::KinematicIncrement;
        let layout = config.layout().unwrap();
        let model = AnyMotionModel::from_config(&config, &layout);
        assert!(matches!(model, AnyMotionModel::KinematicIncrement(_)));
        assert_eq!(model.process_noise().nrows(), 9);
    }
}
