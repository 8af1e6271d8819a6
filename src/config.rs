// config.rs: Tracker configuration
//
// One flat struct with serde defaults, so a JSON file only needs to name the
// values it overrides. Every tunable of the estimators lives here.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::collaborators::MeasurementKind;
use crate::error::{TrackResult, TrackingError};
use crate::filters::particle::{PointEstimate, ScoreWeighting};
use crate::filters::resample::ResamplePolicy;
use crate::filters::unscented::UnscentedParams;
use crate::motion_model::MotionModelKind;
use crate::pose::StateLayout;

/// One value per semantic parameter group.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerGroup {
    pub position: f64,
    pub orientation: f64,
    pub joint_angle: f64,
}

impl PerGroup {
    pub fn new(position: f64, orientation: f64, joint_angle: f64) -> Self {
        Self {
            position,
            orientation,
            joint_angle,
        }
    }

    fn any_negative(&self) -> bool {
        !(self.position >= 0.0 && self.orientation >= 0.0 && self.joint_angle >= 0.0)
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    // ── State layout ──
    pub arms: usize,
    pub joint_angles: bool,

    // ── Unscented transform ──
    pub alpha: f64,
    pub kappa: f64,
    pub beta: f64,

    // ── UKF noise ──
    /// Diagonal variances used when (re)initializing from a coarse guess
    pub initial_covariance: PerGroup,
    /// Additive process-noise variances
    pub process_noise: PerGroup,
    /// Measurement noise R = scale * I, sized per cycle
    pub measurement_noise_scale: f64,
    /// |det(S)| below this skips the correction
    pub innovation_tolerance: f64,
    /// Eigenvalue floor when repairing a diverged covariance
    pub min_variance: f64,
    /// Measurement the UKF corrects against
    pub ukf_measurement: MeasurementKind,

    // ── Motion model ──
    pub motion_model: MotionModelKind,
    /// Blend toward the kinematic coarse guess, 0 = ignore hint, 1 = jump to hint
    pub kinematic_weight: f64,

    // ── Particle filter ──
    pub num_particles: usize,
    /// Standard deviations used to seed particles around the coarse guess
    pub particle_init_std: PerGroup,
    pub weighting: ScoreWeighting,
    pub resample: ResamplePolicy,
    pub point_estimate: PointEstimate,

    // ── Execution ──
    /// Worker threads for oracle evaluation, 0 = available parallelism
    pub workers: usize,
    pub seed: Option<u64>,

    // ── Health ──
    /// Consecutive cycles with the same condition before it is reported as persistent
    pub streak_warning: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            arms: 1,
            joint_angles: true,
            alpha: 0.005,
            kappa: 0.0,
            beta: 2.0,
            initial_covariance: PerGroup::new(0.003, 0.003, 0.002),
            process_noise: PerGroup::new(0.0006, 0.0008, 0.0001),
            measurement_noise_scale: 1.0,
            innovation_tolerance: 1e-12,
            min_variance: 1e-9,
            ukf_measurement: MeasurementKind::RenderedEdges,
            motion_model: MotionModelKind::CoarseGuessBias,
            kinematic_weight: 0.8,
            num_particles: 100,
            particle_init_std: PerGroup::new(0.003, 0.003, 0.002),
            weighting: ScoreWeighting::Inverse,
            resample: ResamplePolicy::EffectiveSampleSize { threshold: 0.5 },
            point_estimate: PointEstimate::BestParticle,
            workers: 0,
            seed: None,
            streak_warning: 10,
        }
    }
}

impl TrackerConfig {
    /// Dual-arm preset: 12-D state, no joint angles.
    pub fn dual_arm() -> Self {
        Self {
            arms: 2,
            joint_angles: false,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> TrackResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TrackingError::InvalidConfig(format!("parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> TrackResult<Self> {
        let json = fs::read_to_string(path)
            .map_err(|e| TrackingError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn layout(&self) -> TrackResult<StateLayout> {
        StateLayout::new(self.arms, self.joint_angles)
    }

    pub fn unscented_params(&self) -> UnscentedParams {
        UnscentedParams {
            alpha: self.alpha,
            kappa: self.kappa,
            beta: self.beta,
        }
    }

    /// Resolved worker count (at least 1).
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn validate(&self) -> TrackResult<()> {
        let invalid = |msg: &str| Err(TrackingError::InvalidConfig(msg.to_string()));

        if self.arms == 0 {
            return invalid("arms must be >= 1");
        }
        self.unscented_params().validate(self.layout()?.dim())?;
        if self.initial_covariance.any_negative() {
            return invalid("initial_covariance must be non-negative");
        }
        if self.process_noise.any_negative() {
            return invalid("process_noise must be non-negative");
        }
        if self.particle_init_std.any_negative() {
            return invalid("particle_init_std must be non-negative");
        }
        if !(self.measurement_noise_scale >= 0.0) {
            return invalid("measurement_noise_scale must be non-negative");
        }
        if !(self.min_variance > 0.0) {
            return invalid("min_variance must be positive");
        }
        if !(0.0..=1.0).contains(&self.kinematic_weight) {
            return invalid("kinematic_weight must be within [0, 1]");
        }
        if self.num_particles == 0 {
            return invalid("num_particles must be >= 1");
        }
        if let ScoreWeighting::NegativeExponential { temperature } = self.weighting {
            if !(temperature > 0.0) {
                return invalid("weighting temperature must be positive");
            }
        }
        if let ResamplePolicy::EffectiveSampleSize { threshold } = self.resample {
            if !(threshold > 0.0 && threshold <= 1.0) {
                return invalid("resample threshold must be within (0, 1]");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = TrackerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.layout().unwrap().dim(), 9);
        assert_eq!(TrackerConfig::dual_arm().layout().unwrap().dim(), 12);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = TrackerConfig::from_json_str(
            r#"{ "num_particles": 250, "resample": { "kind": "always" }, "seed": 7 }"#,
        )
        .unwrap();
        assert_eq!(config.num_particles, 250);
        assert_eq!(config.resample, ResamplePolicy::Always);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.alpha, 0.005);
        assert_eq!(config.ukf_measurement, MeasurementKind::RenderedEdges);

        let config = TrackerConfig::from_json_str(r#"{ "ukf_measurement": "matching_score" }"#).unwrap();
        assert_eq!(config.ukf_measurement, MeasurementKind::MatchingScore);
    }

    #[test]
    fn test_weighting_from_json() {
        let config = TrackerConfig::from_json_str(
            r#"{ "weighting": { "kind": "negative_exponential", "temperature": 2.5 } }"#,
        )
        .unwrap();
        assert_eq!(
            config.weighting,
            ScoreWeighting::NegativeExponential { temperature: 2.5 }
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = TrackerConfig::default();
        config.alpha = 0.0;
        assert!(config.validate().is_err());

        let mut config = TrackerConfig::default();
        config.num_particles = 0;
        assert!(config.validate().is_err());

        let mut config = TrackerConfig::default();
        config.process_noise.orientation = -1.0;
        assert!(config.validate().is_err());

        let mut config = TrackerConfig::default();
        config.resample = ResamplePolicy::EffectiveSampleSize { threshold: 1.5 };
        assert!(config.validate().is_err());

        assert!(TrackerConfig::from_json_str("{ not json").is_err());
    }
}
