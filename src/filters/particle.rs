//! Particle filter estimator
//!
//! Particles are seeded around the kinematic coarse guess, propagated through
//! the motion model with per-particle process noise, weighted by the oracle's
//! matching score and resampled with the low-variance scheme. The best-scoring
//! particle is returned explicitly every cycle.
//!
//! A cycle works on copies (particles and RNG) and commits them only after
//! every evaluation has finished, so a cancelled or failed cycle leaves the
//! committed particle set untouched.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use super::resample::{effective_sample_size, low_variance_resample, ResamplePolicy};
use crate::collaborators::{MeasurementOracle, ObservationContext};
use crate::config::{PerGroup, TrackerConfig};
use crate::error::{raise, NumericalCondition, TrackResult, TrackingError};
use crate::motion_model::{KinematicHint, MotionModel};
use crate::parallel::{evaluate_all, CancelToken};
use crate::pose::PoseCodec;
use crate::types::{symmetrize, Estimate, StateCov, StateVec};

/// Scores are clamped to this before inversion.
pub const SCORE_EPSILON: f64 = 1e-9;

#[derive(Clone, Debug, PartialEq)]
pub struct Particle {
    pub state: StateVec,
    pub weight: f64,
}

/// Score-to-weight conversion; both are strictly decreasing in the score.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScoreWeighting {
    /// w = 1 / max(score, eps)
    Inverse,
    /// w = exp(-(score - min_score) / temperature)
    NegativeExponential { temperature: f64 },
}

impl ScoreWeighting {
    /// Unnormalized weights. Non-finite scores get weight 0.
    pub fn weights(&self, scores: &[f64]) -> Vec<f64> {
        match *self {
            ScoreWeighting::Inverse => scores
                .iter()
                .map(|&s| if s.is_finite() { 1.0 / s.max(SCORE_EPSILON) } else { 0.0 })
                .collect(),
            ScoreWeighting::NegativeExponential { temperature } => {
                let min = scores
                    .iter()
                    .copied()
                    .filter(|s| s.is_finite())
                    .fold(f64::INFINITY, f64::min);
                scores
                    .iter()
                    .map(|&s| {
                        if s.is_finite() {
                            (-(s - min) / temperature).exp()
                        } else {
                            0.0
                        }
                    })
                    .collect()
            }
        }
    }
}

/// What the filter reports as its point estimate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointEstimate {
    BestParticle,
    WeightedMean,
}

/// Highest-weighted particle of a cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct BestParticle {
    pub index: usize,
    pub state: StateVec,
    /// None when weighting was skipped this cycle
    pub score: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct PfReport {
    pub cycle: u64,
    pub estimate: Estimate,
    pub best: BestParticle,
    pub effective_sample_size: f64,
    pub resampled: bool,
    pub conditions: Vec<NumericalCondition>,
}

/// Normalize to sum 1, or fall back to uniform. Returns true on fallback.
///
/// Degenerate: a non-finite weight, a total at or below the smallest positive
/// float, or (for more than one particle) identical scores that carry no
/// information about which particle is better.
pub fn normalize_weights(raw: &[f64], scores: &[f64]) -> (Vec<f64>, bool) {
    let n = raw.len();
    if n == 0 {
        return (Vec::new(), false);
    }
    let uniform = || vec![1.0 / n as f64; n];

    let total: f64 = raw.iter().sum();
    let all_equal = n > 1 && scores.windows(2).all(|w| w[0] == w[1]);
    if raw.iter().any(|w| !w.is_finite()) || !(total > f64::MIN_POSITIVE) || !total.is_finite() || all_equal {
        return (uniform(), true);
    }
    (raw.iter().map(|w| w / total).collect(), false)
}

/// Weighted mean and covariance of a particle set.
pub fn weighted_moments(particles: &[Particle], dim: usize) -> (StateVec, StateCov) {
    let mut mean = StateVec::zeros(dim);
    for p in particles {
        mean.axpy(p.weight, &p.state, 1.0);
    }
    let mut cov = StateCov::zeros(dim, dim);
    for p in particles {
        let d = &p.state - &mean;
        cov.ger(p.weight, &d, &d, 1.0);
    }
    (mean, symmetrize(&cov))
}

/// Committed particle set and RNG.
#[derive(Clone, Debug)]
pub struct PfCheckpoint {
    particles: Vec<Particle>,
    rng: StdRng,
    cycle: u64,
}

pub struct ParticleFilter<M, O> {
    codec: PoseCodec,
    motion: M,
    oracle: O,

    particles: Vec<Particle>,
    rng: StdRng,

    num_particles: usize,
    init_std: PerGroup,
    weighting: ScoreWeighting,
    resample: ResamplePolicy,
    point_estimate: PointEstimate,
    workers: usize,

    cycle: u64,
}

impl<M: MotionModel, O: MeasurementOracle> ParticleFilter<M, O> {
    pub fn new(config: &TrackerConfig, motion: M, oracle: O) -> TrackResult<Self> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            codec: PoseCodec::new(config.layout()?),
            motion,
            oracle,
            particles: Vec::new(),
            rng,
            num_particles: config.num_particles,
            init_std: config.particle_init_std,
            weighting: config.weighting,
            resample: config.resample,
            point_estimate: config.point_estimate,
            workers: config.worker_count(),
            cycle: 0,
        })
    }

    pub fn codec(&self) -> &PoseCodec {
        &self.codec
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn is_initialized(&self) -> bool {
        !self.particles.is_empty()
    }

    pub fn checkpoint(&self) -> PfCheckpoint {
        PfCheckpoint {
            particles: self.particles.clone(),
            rng: self.rng.clone(),
            cycle: self.cycle,
        }
    }

    pub fn restore(&mut self, checkpoint: PfCheckpoint) {
        self.particles = checkpoint.particles;
        self.rng = checkpoint.rng;
        self.cycle = checkpoint.cycle;
    }

    /// Seed N particles by Gaussian perturbation of the coarse guess, one std-dev per parameter group.
    pub fn initialize(&mut self, coarse_guess: &StateVec) -> TrackResult<()> {
        self.codec.check(coarse_guess)?;

        let std = self
            .codec
            .layout()
            .group_diagonal(self.init_std.position, self.init_std.orientation, self.init_std.joint_angle)
            .diagonal();
        let weight = 1.0 / self.num_particles as f64;

        self.particles = (0..self.num_particles)
            .map(|_| {
                let mut state = coarse_guess.clone();
                for (x, &s) in state.iter_mut().zip(std.iter()) {
                    let draw: f64 = StandardNormal.sample(&mut self.rng);
                    *x += s * draw;
                }
                Particle { state, weight }
            })
            .collect();
        self.cycle = 0;
        log::debug!("pf: seeded {} particles", self.num_particles);
        Ok(())
    }

    /// Propagate, weight, normalize, pick the best particle and resample per policy.
    pub fn step(
        &mut self,
        hint: &KinematicHint,
        ctx: &ObservationContext,
        cancel: &CancelToken,
    ) -> TrackResult<PfReport> {
        if !self.is_initialized() {
            return Err(TrackingError::NotInitialized);
        }
        hint.check(self.codec.dim())?;
        cancel.check()?;

        let cycle = self.cycle + 1;
        let mut conditions = Vec::new();
        let mut rng = self.rng.clone();

        // Propagating
        let mut particles: Vec<Particle> = self
            .particles
            .iter()
            .map(|p| Particle {
                state: self.motion.predict(&p.state, hint, &mut rng),
                weight: p.weight,
            })
            .collect();

        // Weighting
        let scores = if ctx.projection.is_set() {
            let states: Vec<&StateVec> = particles.iter().map(|p| &p.state).collect();
            let scores = evaluate_all(&states, self.workers, cancel, |state| {
                let poses = self.codec.decode(state)?;
                self.oracle.score(&poses, ctx)
            })?;

            // Posterior is carried weight times likelihood; resampling resets carried weights to 1/N
            let raw: Vec<f64> = self
                .weighting
                .weights(&scores)
                .into_iter()
                .zip(&particles)
                .map(|(likelihood, p)| likelihood * p.weight)
                .collect();
            let (weights, degenerate) = normalize_weights(&raw, &scores);
            if degenerate {
                raise(&mut conditions, NumericalCondition::DegenerateWeights);
            }
            for (p, w) in particles.iter_mut().zip(weights) {
                p.weight = w;
            }
            Some(scores)
        } else {
            // Keep the carried weights; without projections there is nothing to score against
            raise(&mut conditions, NumericalCondition::ProjectionUnset);
            None
        };

        let best_index = particles
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.weight.total_cmp(&b.1.weight))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let best = BestParticle {
            index: best_index,
            state: particles[best_index].state.clone(),
            score: scores.as_ref().map(|s| s[best_index]),
        };

        let dim = self.codec.dim();
        let (weighted_mean, spread) = weighted_moments(&particles, dim);
        let mean = match self.point_estimate {
            PointEstimate::BestParticle => best.state.clone(),
            PointEstimate::WeightedMean => weighted_mean,
        };

        // Resampling
        let weights: Vec<f64> = particles.iter().map(|p| p.weight).collect();
        let ess = effective_sample_size(&weights);
        let resampled = scores.is_some() && self.resample.should_resample(&weights);
        if resampled {
            particles = low_variance_resample(&particles, &mut rng);
        }

        cancel.check()?;

        // Commit
        self.particles = particles;
        self.rng = rng;
        self.cycle = cycle;

        for c in &conditions {
            log::warn!("pf cycle {}: {}", cycle, c.as_str());
        }
        log::debug!(
            "pf cycle {}: ess {:.1}/{} resampled={} best={}",
            cycle,
            ess,
            self.num_particles,
            resampled,
            best.index
        );

        Ok(PfReport {
            cycle,
            estimate: Estimate {
                cycle,
                mean,
                covariance: Some(spread),
            },
            best,
            effective_sample_size: ess,
            resampled,
            conditions,
        })
    }
}
