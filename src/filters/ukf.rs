//! Unscented Kalman filter over the tool-pose state
//!
//! One estimator type for every layout: L comes from the pose codec, the
//! motion and measurement models are injected. Each cycle runs predict then
//! correct on local copies; mean and covariance are committed only when the
//! whole cycle succeeded.

use nalgebra::DMatrix;

use super::unscented::{cholesky_clamped, UnscentedTransform};
use crate::collaborators::{MeasurementModel, ObservationContext};
use crate::config::TrackerConfig;
use crate::error::{raise, NumericalCondition, TrackResult, TrackingError};
use crate::motion_model::{KinematicHint, MotionModel};
use crate::parallel::{evaluate_all, CancelToken};
use crate::pose::PoseCodec;
use crate::types::{symmetrize, Estimate, KalmanGain, MeasurementCov, MeasurementVec, StateCov, StateVec};

/// Predicted sigma points and their recombined moments.
#[derive(Clone, Debug)]
pub struct Prediction {
    pub sigma_points: Vec<StateVec>,
    pub mean: StateVec,
    pub covariance: StateCov,
    pub conditions: Vec<NumericalCondition>,
}

/// Posterior of one correction attempt. When `corrected` is false the
/// moments are the prediction's.
#[derive(Clone, Debug)]
pub struct Correction {
    pub mean: StateVec,
    pub covariance: StateCov,
    pub corrected: bool,
    /// Normalized innovation squared
    pub nis: Option<f64>,
    pub measurement_dim: Option<usize>,
    pub conditions: Vec<NumericalCondition>,
}

#[derive(Clone, Debug)]
pub struct UkfReport {
    pub cycle: u64,
    pub estimate: Estimate,
    pub corrected: bool,
    pub nis: Option<f64>,
    pub measurement_dim: Option<usize>,
    pub conditions: Vec<NumericalCondition>,
}

/// Floor the eigenvalues of a symmetric matrix.
pub fn repair_covariance(covariance: &StateCov, min_variance: f64) -> StateCov {
    let mut eigen = symmetrize(covariance).symmetric_eigen();
    for v in eigen.eigenvalues.iter_mut() {
        if !(*v >= min_variance) {
            *v = min_variance;
        }
    }
    symmetrize(&eigen.recompose())
}

#[derive(Clone, Debug)]
pub struct UkfCheckpoint {
    mean: StateVec,
    covariance: StateCov,
    initialized: bool,
    cycle: u64,
}

pub struct UnscentedKalmanFilter<M, H> {
    codec: PoseCodec,
    transform: UnscentedTransform,
    motion: M,
    measurement: H,

    /// State estimate [L]
    mean: StateVec,
    /// Covariance [L x L]
    covariance: StateCov,
    initial_covariance: StateCov,
    initialized: bool,

    measurement_noise_scale: f64,
    innovation_tolerance: f64,
    min_variance: f64,
    workers: usize,

    cycle: u64,
}

impl<M: MotionModel, H: MeasurementModel> UnscentedKalmanFilter<M, H> {
    pub fn new(config: &TrackerConfig, motion: M, measurement: H) -> TrackResult<Self> {
        config.validate()?;
        let layout = config.layout()?;
        let dim = layout.dim();
        let init = &config.initial_covariance;
        let initial_covariance = layout.group_diagonal(init.position, init.orientation, init.joint_angle);

        Ok(Self {
            codec: PoseCodec::new(layout),
            transform: UnscentedTransform::new(dim, config.unscented_params())?,
            motion,
            measurement,
            mean: StateVec::zeros(dim),
            covariance: initial_covariance.clone(),
            initial_covariance,
            initialized: false,
            measurement_noise_scale: config.measurement_noise_scale,
            innovation_tolerance: config.innovation_tolerance,
            min_variance: config.min_variance,
            workers: config.worker_count(),
            cycle: 0,
        })
    }

    pub fn codec(&self) -> &PoseCodec {
        &self.codec
    }

    pub fn mean(&self) -> &StateVec {
        &self.mean
    }

    pub fn covariance(&self) -> &StateCov {
        &self.covariance
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn estimate(&self) -> Estimate {
        Estimate {
            cycle: self.cycle,
            mean: self.mean.clone(),
            covariance: Some(self.covariance.clone()),
        }
    }

    /// Committed state, for rolling back a frame abandoned after this filter stepped.
    pub fn checkpoint(&self) -> UkfCheckpoint {
        UkfCheckpoint {
            mean: self.mean.clone(),
            covariance: self.covariance.clone(),
            initialized: self.initialized,
            cycle: self.cycle,
        }
    }

    pub fn restore(&mut self, checkpoint: UkfCheckpoint) {
        self.mean = checkpoint.mean;
        self.covariance = checkpoint.covariance;
        self.initialized = checkpoint.initialized;
        self.cycle = checkpoint.cycle;
    }

    /// Reset mean to the coarse guess and covariance to the configured group diagonal.
    pub fn initialize(&mut self, coarse_guess: &StateVec) -> TrackResult<()> {
        self.codec.check(coarse_guess)?;
        self.mean = coarse_guess.clone();
        self.covariance = self.initial_covariance.clone();
        self.initialized = true;
        self.cycle = 0;
        Ok(())
    }

    /// Set state manually (for testing/initialization)
    pub fn set_state(&mut self, mean: StateVec, covariance: StateCov) -> TrackResult<()> {
        self.codec.check(&mean)?;
        let dim = self.codec.dim();
        if covariance.nrows() != dim || covariance.ncols() != dim {
            return Err(TrackingError::DimensionMismatch {
                what: "covariance",
                expected: dim,
                actual: covariance.nrows().max(covariance.ncols()),
            });
        }
        self.mean = mean;
        self.covariance = covariance;
        self.initialized = true;
        Ok(())
    }

    /// Sigma points of the committed estimate through the motion model, recombined with Q.
    pub fn predict(&self, hint: &KinematicHint) -> TrackResult<Prediction> {
        hint.check(self.codec.dim())?;
        let mut conditions = Vec::new();

        let sigma = self.transform.sigma_points(&self.mean, &self.covariance)?;
        if let Some(c) = sigma.condition() {
            raise(&mut conditions, c);
        }

        let sigma_points: Vec<StateVec> = sigma
            .points
            .iter()
            .map(|x| self.motion.propagate(x, hint))
            .collect();
        let (mean, covariance) = self
            .transform
            .recombine(&sigma_points, Some(self.motion.process_noise()))?;

        Ok(Prediction {
            sigma_points,
            mean,
            covariance,
            conditions,
        })
    }

    /// Kalman update of a prediction against this cycle's observation.
    ///
    /// The measurement dimension is taken from the oracle every call; R, z_hat,
    /// S and Sigma_xz are sized to it.
    pub fn correct(
        &self,
        prediction: &Prediction,
        ctx: &ObservationContext,
        cancel: &CancelToken,
    ) -> TrackResult<Correction> {
        let mut conditions = prediction.conditions.clone();
        let skip = |conditions: Vec<NumericalCondition>, measurement_dim: Option<usize>| Correction {
            mean: prediction.mean.clone(),
            covariance: prediction.covariance.clone(),
            corrected: false,
            nis: None,
            measurement_dim,
            conditions,
        };

        if !ctx.projection.is_set() {
            raise(&mut conditions, NumericalCondition::ProjectionUnset);
            return Ok(skip(conditions, None));
        }

        let observed = self.measurement.observe(ctx)?;
        let z_points: Vec<MeasurementVec> =
            evaluate_all(&prediction.sigma_points, self.workers, cancel, |x| {
                let poses = self.codec.decode(x)?;
                Ok(self.measurement.measure(&poses, ctx)?.0)
            })?;

        let m = observed.dim();
        if z_points.iter().any(|z| z.len() != m) {
            raise(&mut conditions, NumericalCondition::MeasurementDimensionMismatch);
            return Ok(skip(conditions, Some(m)));
        }
        if m == 0 {
            log::debug!("ukf: empty measurement, correction skipped");
            return Ok(skip(conditions, Some(0)));
        }

        let noise = MeasurementCov::identity(m, m) * self.measurement_noise_scale;
        let (z_hat, s) = self.transform.recombine(&z_points, Some(&noise))?;

        let det = s.determinant();
        let s_inv = match s.clone().try_inverse() {
            Some(inv) if det.is_finite() && det.abs() >= self.innovation_tolerance => inv,
            _ => {
                raise(&mut conditions, NumericalCondition::DegenerateInnovationCovariance);
                return Ok(skip(conditions, Some(m)));
            }
        };

        let sigma_xz = self.transform.cross_covariance(
            &prediction.sigma_points,
            &prediction.mean,
            &z_points,
            &z_hat,
        )?;
        let gain: KalmanGain = &sigma_xz * &s_inv;

        let innovation = observed.as_vector() - &z_hat;
        let nis = innovation.dot(&(&s_inv * &innovation));

        let mean = &prediction.mean + &gain * &innovation;
        if mean.iter().any(|v| !v.is_finite()) {
            raise(&mut conditions, NumericalCondition::NumericalInstability);
            return Ok(skip(conditions, Some(m)));
        }
        let covariance = symmetrize(&(&prediction.covariance - &gain * &s * gain.transpose()));

        Ok(Correction {
            mean,
            covariance,
            corrected: true,
            nis: Some(nis),
            measurement_dim: Some(m),
            conditions,
        })
    }

    /// Predict, correct and commit one cycle.
    pub fn step(
        &mut self,
        hint: &KinematicHint,
        ctx: &ObservationContext,
        cancel: &CancelToken,
    ) -> TrackResult<UkfReport> {
        if !self.initialized {
            return Err(TrackingError::NotInitialized);
        }
        cancel.check()?;

        let prediction = self.predict(hint)?;
        let Correction {
            mean,
            mut covariance,
            corrected,
            nis,
            measurement_dim,
            mut conditions,
        } = self.correct(&prediction, ctx, cancel)?;

        // Posterior must keep a valid square root; floor eigenvalues when it does not
        if cholesky_clamped(&covariance)?.condition().is_some() {
            raise(&mut conditions, NumericalCondition::NumericalInstability);
            covariance = repair_covariance(&covariance, self.min_variance);
        }

        cancel.check()?;

        // Commit
        let cycle = self.cycle + 1;
        self.mean = mean;
        self.covariance = covariance;
        self.cycle = cycle;

        for c in &conditions {
            log::warn!("ukf cycle {}: {}", cycle, c.as_str());
        }
        if let Some(nis) = nis {
            log::debug!("ukf cycle {}: nis {:.3} (m = {:?})", cycle, nis, measurement_dim);
        }

        Ok(UkfReport {
            cycle,
            estimate: self.estimate(),
            corrected,
            nis,
            measurement_dim,
            conditions,
        })
    }
}
