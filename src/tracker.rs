// tracker.rs: Pure computation layer for the tool tracker
//
// Everything in this module is independent of:
//   - tokio / async runtime
//   - session files, status files, Rerun logging
//
// Joint readings and stereo frames go in, committed estimates and events come
// out. One frame drives one cycle of every enabled estimator; the latest
// committed snapshot is published through an EstimateHandle that any thread
// can read without blocking the cycle.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::collaborators::{
    coarse_guess, AnyMeasurement, ForwardKinematics, MeasurementOracle, ObservationContext, ProjectionCell,
    StereoExtrinsics, StereoFrame,
};
use crate::config::TrackerConfig;
use crate::error::{NumericalCondition, TrackResult, TrackingError};
use crate::filters::particle::{ParticleFilter, PfCheckpoint, PfReport};
use crate::filters::ukf::{UkfCheckpoint, UkfReport, UnscentedKalmanFilter};
use crate::health_monitor::{EstimatorKind, HealthMonitor, PersistentCondition};
use crate::motion_model::{AnyMotionModel, KinematicHint};
use crate::parallel::CancelToken;
use crate::pose::{PoseCodec, ToolPose};
use crate::types::{Estimate, JointReading, StateVec};

// ─── Mode ────────────────────────────────────────────────────────────────────

/// Which estimators run each frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorMode {
    Ukf,
    #[value(name = "pf")]
    #[serde(rename = "pf")]
    Particle,
    Both,
}

impl EstimatorMode {
    pub fn runs_ukf(&self) -> bool {
        matches!(self, EstimatorMode::Ukf | EstimatorMode::Both)
    }

    pub fn runs_particle(&self) -> bool {
        matches!(self, EstimatorMode::Particle | EstimatorMode::Both)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EstimatorMode::Ukf => "ukf",
            EstimatorMode::Particle => "pf",
            EstimatorMode::Both => "both",
        }
    }
}

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum TrackingEvent {
    Initialized {
        estimator: EstimatorKind,
        timestamp: f64,
    },
    Condition {
        estimator: EstimatorKind,
        cycle: u64,
        condition: NumericalCondition,
    },
    PersistentCondition(PersistentCondition),
    Resampled {
        cycle: u64,
        effective_sample_size: f64,
    },
    FrameSkipped {
        timestamp: f64,
        reason: String,
    },
    CycleFailed {
        estimator: EstimatorKind,
        error: TrackingError,
    },
}

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// Last committed output of one estimator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EstimatorOutput {
    pub estimate: Estimate,
    pub poses: Vec<ToolPose>,
    pub conditions: Vec<NumericalCondition>,
    /// UKF only, when a correction was applied
    pub nis: Option<f64>,
    /// PF only
    pub effective_sample_size: Option<f64>,
    /// PF only, when weighting ran
    pub best_score: Option<f64>,
}

impl EstimatorOutput {
    fn from_ukf(report: &UkfReport, codec: &PoseCodec) -> TrackResult<Self> {
        Ok(Self {
            poses: codec.decode(&report.estimate.mean)?,
            estimate: report.estimate.clone(),
            conditions: report.conditions.clone(),
            nis: report.nis,
            effective_sample_size: None,
            best_score: None,
        })
    }

    fn from_particle(report: &PfReport, codec: &PoseCodec) -> TrackResult<Self> {
        Ok(Self {
            poses: codec.decode(&report.estimate.mean)?,
            estimate: report.estimate.clone(),
            conditions: report.conditions.clone(),
            nis: None,
            effective_sample_size: Some(report.effective_sample_size),
            best_score: report.best.score,
        })
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrackingSnapshot {
    /// Timestamp of the last processed frame
    pub timestamp: f64,
    pub frames: u64,
    pub skipped_frames: u64,
    pub ukf: Option<EstimatorOutput>,
    pub particle: Option<EstimatorOutput>,
}

impl TrackingSnapshot {
    pub fn output(&self, kind: EstimatorKind) -> Option<&EstimatorOutput> {
        match kind {
            EstimatorKind::Ukf => self.ukf.as_ref(),
            EstimatorKind::Particle => self.particle.as_ref(),
        }
    }
}

/// Shared read side of the tracker. Readers get a clone of the last published snapshot.
#[derive(Clone, Debug, Default)]
pub struct EstimateHandle {
    inner: Arc<RwLock<TrackingSnapshot>>,
}

impl EstimateHandle {
    fn publish(&self, snapshot: TrackingSnapshot) {
        match self.inner.write() {
            Ok(mut s) => *s = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    pub fn latest(&self) -> TrackingSnapshot {
        match self.inner.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

// ─── The main tracker struct ─────────────────────────────────────────────────

/// Errors that fail one estimator's cycle without stopping the tracker.
fn is_cycle_failure(error: &TrackingError) -> bool {
    matches!(error, TrackingError::Oracle(_) | TrackingError::WorkerPanicked)
}

fn push_conditions(
    events: &mut Vec<TrackingEvent>,
    estimator: EstimatorKind,
    cycle: u64,
    conditions: &[NumericalCondition],
    persistent: Vec<PersistentCondition>,
) {
    events.extend(conditions.iter().map(|&condition| TrackingEvent::Condition {
        estimator,
        cycle,
        condition,
    }));
    events.extend(persistent.into_iter().map(TrackingEvent::PersistentCondition));
}

pub struct ToolTracker<K, O> {
    config: TrackerConfig,
    mode: EstimatorMode,
    codec: PoseCodec,
    kinematics: K,

    ukf: Option<UnscentedKalmanFilter<AnyMotionModel, AnyMeasurement<Arc<O>>>>,
    particle: Option<ParticleFilter<AnyMotionModel, Arc<O>>>,

    // Camera inputs
    projection: ProjectionCell,
    extrinsics: Vec<StereoExtrinsics>,

    // Latest joint reading per arm
    joints: Vec<Option<JointReading>>,
    previous_guess: Option<StateVec>,

    health: HealthMonitor,
    snapshot: TrackingSnapshot,
    handle: EstimateHandle,
    cancel: CancelToken,
}

impl<K: ForwardKinematics, O: MeasurementOracle> ToolTracker<K, O> {
    pub fn new(config: TrackerConfig, mode: EstimatorMode, kinematics: K, oracle: Arc<O>) -> TrackResult<Self> {
        config.validate()?;
        let layout = config.layout()?;
        let motion = AnyMotionModel::from_config(&config, &layout);

        let ukf = if mode.runs_ukf() {
            let measurement = AnyMeasurement::new(config.ukf_measurement, Arc::clone(&oracle));
            Some(UnscentedKalmanFilter::new(&config, motion.clone(), measurement)?)
        } else {
            None
        };
        let particle = if mode.runs_particle() {
            Some(ParticleFilter::new(&config, motion, oracle)?)
        } else {
            None
        };

        log::info!(
            "tracker: mode {} with {} arm(s), state dim {}",
            mode.as_str(),
            layout.arm_count(),
            layout.dim()
        );

        let arms = layout.arm_count();
        Ok(Self {
            health: HealthMonitor::new(config.streak_warning),
            config,
            mode,
            codec: PoseCodec::new(layout),
            kinematics,
            ukf,
            particle,
            projection: ProjectionCell::default(),
            extrinsics: vec![StereoExtrinsics::default(); arms],
            joints: vec![None; arms],
            previous_guess: None,
            snapshot: TrackingSnapshot::default(),
            handle: EstimateHandle::default(),
            cancel: CancelToken::new(),
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn mode(&self) -> EstimatorMode {
        self.mode
    }

    pub fn codec(&self) -> &PoseCodec {
        &self.codec
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Writable projection feed; clones share the same matrices.
    pub fn projection_cell(&self) -> ProjectionCell {
        self.projection.clone()
    }

    pub fn handle(&self) -> EstimateHandle {
        self.handle.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn get_snapshot(&self) -> TrackingSnapshot {
        self.snapshot.clone()
    }

    pub fn set_extrinsics(&mut self, arm: usize, extrinsics: StereoExtrinsics) -> TrackResult<()> {
        let arms = self.extrinsics.len();
        let slot = self.extrinsics.get_mut(arm).ok_or(TrackingError::DimensionMismatch {
            what: "arm index",
            expected: arms,
            actual: arm,
        })?;
        *slot = extrinsics;
        Ok(())
    }

    /// Keep the newest reading per arm; stale readings are dropped.
    pub fn feed_joints(&mut self, reading: JointReading) -> TrackResult<()> {
        let arms = self.joints.len();
        let slot = self.joints.get_mut(reading.arm).ok_or(TrackingError::DimensionMismatch {
            what: "arm index",
            expected: arms,
            actual: reading.arm,
        })?;
        match slot {
            Some(latest) if latest.timestamp > reading.timestamp => {
                log::debug!("tracker: stale joint reading for arm {} dropped", reading.arm);
            }
            _ => *slot = Some(reading),
        }
        Ok(())
    }

    /// Run one cycle of every enabled estimator on a frame.
    ///
    /// Oracle failures and worker panics fail only the affected estimator's
    /// cycle and are reported as events. Cancellation and malformed inputs are
    /// returned as errors; every estimator is rolled back to its state before
    /// the frame, so nothing is committed for it.
    pub fn process_frame(&mut self, timestamp: f64, frame: StereoFrame) -> TrackResult<Vec<TrackingEvent>> {
        let mut events = Vec::new();

        let missing: Vec<usize> = self
            .joints
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_none())
            .map(|(arm, _)| arm)
            .collect();
        if !missing.is_empty() {
            log::debug!("tracker: frame {:.3} skipped, no joints for arms {:?}", timestamp, missing);
            self.snapshot.skipped_frames += 1;
            events.push(TrackingEvent::FrameSkipped {
                timestamp,
                reason: format!("no joint reading for arm(s) {:?}", missing),
            });
            self.handle.publish(self.snapshot.clone());
            return Ok(events);
        }

        let readings: Vec<JointReading> = self.joints.iter().flatten().cloned().collect();
        let guess = coarse_guess(&self.kinematics, &readings, &self.codec)?;
        let hint = KinematicHint::with_previous(guess.clone(), self.previous_guess.clone());
        let ctx = ObservationContext {
            timestamp,
            projection: self.projection.snapshot(),
            extrinsics: self.extrinsics.clone(),
            frame,
        };

        let checkpoint = FrameCheckpoint {
            ukf: self.ukf.as_ref().map(|f| f.checkpoint()),
            particle: self.particle.as_ref().map(|f| f.checkpoint()),
            health: self.health.clone(),
            snapshot: self.snapshot.clone(),
        };
        if let Err(e) = self.run_estimators(&guess, &hint, &ctx, &mut events) {
            self.rollback(checkpoint);
            return Err(e);
        }

        self.previous_guess = Some(guess);
        self.snapshot.timestamp = timestamp;
        self.snapshot.frames += 1;
        self.handle.publish(self.snapshot.clone());
        Ok(events)
    }

    /// Step every enabled estimator; an error leaves partial commits for the caller to roll back.
    fn run_estimators(
        &mut self,
        guess: &StateVec,
        hint: &KinematicHint,
        ctx: &ObservationContext,
        events: &mut Vec<TrackingEvent>,
    ) -> TrackResult<()> {
        // ── UKF ──
        if let Some(ukf) = self.ukf.as_mut() {
            if !ukf.is_initialized() {
                ukf.initialize(guess)?;
                events.push(TrackingEvent::Initialized {
                    estimator: EstimatorKind::Ukf,
                    timestamp: ctx.timestamp,
                });
            }
            match ukf.step(hint, ctx, &self.cancel) {
                Ok(report) => {
                    let persistent = self.health.record(EstimatorKind::Ukf, report.cycle, &report.conditions);
                    push_conditions(events, EstimatorKind::Ukf, report.cycle, &report.conditions, persistent);
                    self.snapshot.ukf = Some(EstimatorOutput::from_ukf(&report, &self.codec)?);
                }
                Err(e) if is_cycle_failure(&e) => {
                    self.health.record_failure(EstimatorKind::Ukf, &e);
                    events.push(TrackingEvent::CycleFailed {
                        estimator: EstimatorKind::Ukf,
                        error: e,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        // ── Particle filter ──
        if let Some(particle) = self.particle.as_mut() {
            if !particle.is_initialized() {
                particle.initialize(guess)?;
                events.push(TrackingEvent::Initialized {
                    estimator: EstimatorKind::Particle,
                    timestamp: ctx.timestamp,
                });
            }
            match particle.step(hint, ctx, &self.cancel) {
                Ok(report) => {
                    let persistent =
                        self.health
                            .record(EstimatorKind::Particle, report.cycle, &report.conditions);
                    push_conditions(
                        events,
                        EstimatorKind::Particle,
                        report.cycle,
                        &report.conditions,
                        persistent,
                    );
                    if report.resampled {
                        events.push(TrackingEvent::Resampled {
                            cycle: report.cycle,
                            effective_sample_size: report.effective_sample_size,
                        });
                    }
                    self.snapshot.particle = Some(EstimatorOutput::from_particle(&report, &self.codec)?);
                }
                Err(e) if is_cycle_failure(&e) => {
                    self.health.record_failure(EstimatorKind::Particle, &e);
                    events.push(TrackingEvent::CycleFailed {
                        estimator: EstimatorKind::Particle,
                        error: e,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn rollback(&mut self, checkpoint: FrameCheckpoint) {
        if let (Some(ukf), Some(saved)) = (self.ukf.as_mut(), checkpoint.ukf) {
            ukf.restore(saved);
        }
        if let (Some(particle), Some(saved)) = (self.particle.as_mut(), checkpoint.particle) {
            particle.restore(saved);
        }
        self.health = checkpoint.health;
        self.snapshot = checkpoint.snapshot;
    }
}

/// Committed state of a tracker before a frame's estimators run.
struct FrameCheckpoint {
    ukf: Option<UkfCheckpoint>,
    particle: Option<PfCheckpoint>,
    health: HealthMonitor,
    snapshot: TrackingSnapshot,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
