// replay.rs: Recorded sessions and the synthetic collaborators used to replay them
//
// A session is a time-ordered list of records (joint readings, camera-info
// updates, frames with reference poses). Sessions are JSON, optionally
// gzip-compressed. The reference poses drive a synthetic render-and-score
// oracle so both estimators can be exercised and scored without a renderer.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use flate2::read::GzDecoder;
use nalgebra::{Isometry3, Matrix3x4, Point3, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::collaborators::{
    Correspondence, ForwardKinematics, MeasurementOracle, ObservationContext, StereoExtrinsics, StereoFrame,
    StereoProjection,
};
use crate::config::TrackerConfig;
use crate::error::{TrackResult, TrackingError};
use crate::pose::ToolPose;
use crate::tracker::{EstimatorMode, ToolTracker, TrackingEvent, TrackingSnapshot};
use crate::types::JointReading;

// ─── Session format ──────────────────────────────────────────────────────────

fn default_width() -> usize {
    640
}

fn default_height() -> usize {
    480
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionRecord {
    Joints(JointReading),
    Projection {
        left: Matrix3x4<f64>,
        right: Matrix3x4<f64>,
    },
    Frame {
        timestamp: f64,
        reference: Vec<ToolPose>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    #[serde(default = "default_width")]
    pub image_width: usize,
    #[serde(default = "default_height")]
    pub image_height: usize,
    /// One entry per arm; identity when missing
    #[serde(default)]
    pub extrinsics: Vec<StereoExtrinsics>,
    pub records: Vec<SessionRecord>,
}

impl Session {
    pub fn frame_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r, SessionRecord::Frame { .. }))
            .count()
    }
}

pub fn load_session(path: &Path) -> anyhow::Result<Session> {
    let file = File::open(path).with_context(|| format!("opening session {}", path.display()))?;
    let session = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let reader = BufReader::new(GzDecoder::new(file));
        serde_json::from_reader(reader)
    } else {
        serde_json::from_reader(BufReader::new(file))
    };
    session.with_context(|| format!("parsing session {}", path.display()))
}

// ─── Synthetic collaborators ─────────────────────────────────────────────────

/// Encoder feed that already carries the tool pose per arm:
/// `[tx, ty, tz, rx, ry, rz]` optionally followed by three wrist angles.
#[derive(Clone, Copy, Debug, Default)]
pub struct EncodedPoseKinematics;

impl ForwardKinematics for EncodedPoseKinematics {
    fn tool_pose(&self, _arm: usize, joints: &[f64]) -> TrackResult<ToolPose> {
        let joint_angles = match joints.len() {
            6 => None,
            9 => Some(Vector3::new(joints[6], joints[7], joints[8])),
            n => {
                return Err(TrackingError::DimensionMismatch {
                    what: "encoded pose",
                    expected: 9,
                    actual: n,
                })
            }
        };
        Ok(ToolPose::new(
            Vector3::new(joints[0], joints[1], joints[2]),
            Vector3::new(joints[3], joints[4], joints[5]),
            joint_angles,
        ))
    }
}

/// Render-and-score stand-in that knows the true poses of the current frame.
///
/// Each tool contributes two keypoints (tip and a point up the shaft) projected
/// into both cameras. The score is the mean pixel distance between candidate
/// and reference keypoints; rendered edges are the keypoints with axis normals.
#[derive(Debug)]
pub struct ReferenceOracle {
    reference: RwLock<Vec<ToolPose>>,
    shaft_length: f64,
}

impl ReferenceOracle {
    pub fn new(shaft_length: f64) -> Self {
        Self {
            reference: RwLock::new(Vec::new()),
            shaft_length,
        }
    }

    pub fn set_reference(&self, poses: Vec<ToolPose>) {
        match self.reference.write() {
            Ok(mut r) => *r = poses,
            Err(poisoned) => *poisoned.into_inner() = poses,
        }
    }

    fn reference(&self) -> TrackResult<Vec<ToolPose>> {
        let poses = match self.reference.read() {
            Ok(r) => r.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if poses.is_empty() {
            return Err(TrackingError::Oracle("no reference pose for this frame".into()));
        }
        Ok(poses)
    }

    fn keypoints(&self, poses: &[ToolPose], ctx: &ObservationContext) -> TrackResult<Vec<Vector2<f64>>> {
        let mut pixels = Vec::with_capacity(poses.len() * 4);
        for (arm, pose) in poses.iter().enumerate() {
            let extrinsics = ctx.extrinsics.get(arm).cloned().unwrap_or_default();
            let tool = pose.isometry();
            for local in [Point3::origin(), Point3::new(0.0, 0.0, -self.shaft_length)] {
                let point = tool * local;
                pixels.push(project(&ctx.projection.left, &extrinsics.left, &point)?);
                pixels.push(project(&ctx.projection.right, &extrinsics.right, &point)?);
            }
        }
        Ok(pixels)
    }

    fn edges(pixels: &[Vector2<f64>]) -> Vec<Correspondence> {
        pixels
            .iter()
            .flat_map(|&p| {
                [
                    Correspondence::new(p, Vector2::new(1.0, 0.0)),
                    Correspondence::new(p, Vector2::new(0.0, 1.0)),
                ]
            })
            .collect()
    }
}

fn project(projection: &Matrix3x4<f64>, base_to_camera: &Isometry3<f64>, point: &Point3<f64>) -> TrackResult<Vector2<f64>> {
    let camera_point = base_to_camera * point;
    let image = projection * camera_point.to_homogeneous();
    if !(image.z > 1e-9) {
        return Err(TrackingError::Oracle("tool point behind the camera".into()));
    }
    Ok(Vector2::new(image.x / image.z, image.y / image.z))
}

impl MeasurementOracle for ReferenceOracle {
    fn score(&self, poses: &[ToolPose], ctx: &ObservationContext) -> TrackResult<f64> {
        let reference = self.reference()?;
        let candidate = self.keypoints(poses, ctx)?;
        let expected = self.keypoints(&reference, ctx)?;
        if candidate.len() != expected.len() {
            return Err(TrackingError::DimensionMismatch {
                what: "tool count",
                expected: reference.len(),
                actual: poses.len(),
            });
        }
        let total: f64 = candidate.iter().zip(&expected).map(|(a, b)| (a - b).norm()).sum();
        Ok(total / candidate.len() as f64)
    }

    fn render(&self, poses: &[ToolPose], ctx: &ObservationContext) -> TrackResult<Vec<Correspondence>> {
        Ok(Self::edges(&self.keypoints(poses, ctx)?))
    }

    fn observed_edges(&self, ctx: &ObservationContext) -> TrackResult<Vec<Correspondence>> {
        let reference = self.reference()?;
        Ok(Self::edges(&self.keypoints(&reference, ctx)?))
    }
}

/// Pinhole pair with a horizontal baseline [m].
pub fn pinhole_pair(focal: f64, cx: f64, cy: f64, baseline: f64) -> StereoProjection {
    let left = Matrix3x4::new(focal, 0.0, cx, 0.0, 0.0, focal, cy, 0.0, 0.0, 0.0, 1.0, 0.0);
    let mut right = left;
    right[(0, 3)] = -focal * baseline;
    StereoProjection::new(left, right)
}

// ─── Synthetic sessions ──────────────────────────────────────────────────────

/// Parameters for a generated session.
#[derive(Clone, Debug)]
pub struct SyntheticParams {
    pub frames: usize,
    pub arms: usize,
    pub joint_angles: bool,
    pub rate_hz: f64,
    /// Constant kinematic translation error per arm [m]
    pub encoder_bias: f64,
    /// White noise on every encoded value
    pub encoder_noise: f64,
    /// Frames before the camera info arrives
    pub projection_delay: usize,
    pub seed: u64,
}

impl Default for SyntheticParams {
    fn default() -> Self {
        Self {
            frames: 100,
            arms: 1,
            joint_angles: true,
            rate_hz: 30.0,
            encoder_bias: 0.003,
            encoder_noise: 0.0002,
            projection_delay: 0,
            seed: 7,
        }
    }
}

fn reference_pose(arm: usize, t: f64, joint_angles: bool) -> ToolPose {
    let w = 0.8;
    let translation = Vector3::new(
        0.015 * arm as f64 + 0.01 * (w * t).cos(),
        0.01 * (w * t).sin(),
        0.12 + 0.005 * (0.5 * w * t).sin(),
    );
    let rotation = Vector3::new(0.1 * (w * t).sin(), 0.1 * (w * t).cos(), 0.05 * t);
    let joints = joint_angles.then(|| Vector3::new(0.2 * (w * t).sin(), 0.1, -0.1 * (w * t).cos()));
    ToolPose::new(translation, rotation, joints)
}

fn encode_joints(pose: &ToolPose) -> Vec<f64> {
    let mut values: Vec<f64> = pose.translation.iter().chain(pose.rotation.iter()).copied().collect();
    if let Some(j) = &pose.joint_angles {
        values.extend(j.iter());
    }
    values
}

/// Generate a session: one joint reading per arm, then a frame, at every tick.
pub fn synthesize_session(params: &SyntheticParams) -> TrackResult<Session> {
    let noise = Normal::new(0.0, params.encoder_noise)
        .map_err(|e| TrackingError::InvalidConfig(format!("encoder noise: {e}")))?;
    let mut rng = StdRng::seed_from_u64(params.seed);
    let projection = pinhole_pair(800.0, 320.0, 240.0, 0.005);
    let bias: Vec<Vector3<f64>> = (0..params.arms)
        .map(|arm| {
            let angle = 1.3 + arm as f64;
            Vector3::new(angle.cos(), angle.sin(), 0.5).normalize() * params.encoder_bias
        })
        .collect();

    let mut records = Vec::with_capacity(params.frames * (params.arms + 1) + 1);
    for k in 0..params.frames {
        let t = k as f64 / params.rate_hz;
        if k == params.projection_delay {
            records.push(SessionRecord::Projection {
                left: projection.left,
                right: projection.right,
            });
        }

        let reference: Vec<ToolPose> = (0..params.arms)
            .map(|arm| reference_pose(arm, t, params.joint_angles))
            .collect();
        for (arm, pose) in reference.iter().enumerate() {
            let mut measured = pose.clone();
            measured.translation += bias[arm];
            let positions = encode_joints(&measured)
                .into_iter()
                .map(|v| v + noise.sample(&mut rng))
                .collect();
            records.push(SessionRecord::Joints(JointReading {
                timestamp: t,
                arm,
                positions,
            }));
        }
        records.push(SessionRecord::Frame { timestamp: t, reference });
    }

    Ok(Session {
        image_width: default_width(),
        image_height: default_height(),
        extrinsics: vec![StereoExtrinsics::default(); params.arms],
        records,
    })
}

// ─── Scoring ─────────────────────────────────────────────────────────────────

/// Mean tool translation error over arms [mm].
pub fn position_error_mm(estimate: &[ToolPose], reference: &[ToolPose]) -> Option<f64> {
    if estimate.is_empty() || estimate.len() != reference.len() {
        return None;
    }
    let total: f64 = estimate
        .iter()
        .zip(reference)
        .map(|(e, r)| (e.translation - r.translation).norm() * 1000.0)
        .sum();
    Some(total / estimate.len() as f64)
}

pub fn rmse(errors: &[f64]) -> Option<f64> {
    if errors.is_empty() {
        return None;
    }
    let sum_sq: f64 = errors.iter().map(|e| e * e).sum();
    Some((sum_sq / errors.len() as f64).sqrt())
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub frames: u64,
    pub skipped_frames: u64,
    pub kinematic_rmse_mm: Option<f64>,
    pub ukf_rmse_mm: Option<f64>,
    pub particle_rmse_mm: Option<f64>,
    pub ukf_failures: u64,
    pub particle_failures: u64,
}

/// Everything produced by one frame record.
#[derive(Clone, Debug)]
pub struct FrameOutcome {
    pub timestamp: f64,
    pub events: Vec<TrackingEvent>,
    pub snapshot: TrackingSnapshot,
    pub reference: Vec<ToolPose>,
    pub kinematic_error_mm: Option<f64>,
    pub ukf_error_mm: Option<f64>,
    pub particle_error_mm: Option<f64>,
}

// ─── Player ──────────────────────────────────────────────────────────────────

/// Shaft keypoint distance used by the synthetic oracle [m]
pub const SHAFT_KEYPOINT: f64 = 0.03;

/// Feeds session records into a tracker and scores it against the reference.
pub struct SessionPlayer {
    tracker: ToolTracker<EncodedPoseKinematics, ReferenceOracle>,
    oracle: Arc<ReferenceOracle>,
    latest_joints: Vec<Option<JointReading>>,
    image_width: usize,
    image_height: usize,
    kinematic_errors: Vec<f64>,
    ukf_errors: Vec<f64>,
    particle_errors: Vec<f64>,
}

impl SessionPlayer {
    pub fn new(config: TrackerConfig, mode: EstimatorMode, session: &Session) -> TrackResult<Self> {
        let oracle = Arc::new(ReferenceOracle::new(SHAFT_KEYPOINT));
        let arms = config.arms;
        let mut tracker = ToolTracker::new(config, mode, EncodedPoseKinematics, Arc::clone(&oracle))?;
        for (arm, extrinsics) in session.extrinsics.iter().enumerate().take(arms) {
            tracker.set_extrinsics(arm, extrinsics.clone())?;
        }
        Ok(Self {
            tracker,
            oracle,
            latest_joints: vec![None; arms],
            image_width: session.image_width,
            image_height: session.image_height,
            kinematic_errors: Vec::new(),
            ukf_errors: Vec::new(),
            particle_errors: Vec::new(),
        })
    }

    pub fn tracker(&self) -> &ToolTracker<EncodedPoseKinematics, ReferenceOracle> {
        &self.tracker
    }

    fn kinematic_poses(&self) -> Option<Vec<ToolPose>> {
        self.latest_joints
            .iter()
            .map(|r| {
                r.as_ref()
                    .and_then(|r| EncodedPoseKinematics.tool_pose(r.arm, &r.positions).ok())
            })
            .collect()
    }

    /// Apply one record; frames return their outcome.
    pub fn apply(&mut self, record: SessionRecord) -> TrackResult<Option<FrameOutcome>> {
        match record {
            SessionRecord::Joints(reading) => {
                if let Some(slot) = self.latest_joints.get_mut(reading.arm) {
                    *slot = Some(reading.clone());
                }
                self.tracker.feed_joints(reading)?;
                Ok(None)
            }
            SessionRecord::Projection { left, right } => {
                let cell = self.tracker.projection_cell();
                cell.set_left(left);
                cell.set_right(right);
                log::info!("replay: camera info received");
                Ok(None)
            }
            SessionRecord::Frame { timestamp, reference } => {
                self.oracle.set_reference(reference.clone());
                let frame = StereoFrame::blank(self.image_width, self.image_height);
                let events = self.tracker.process_frame(timestamp, frame)?;
                let snapshot = self.tracker.get_snapshot();
                let skipped = events
                    .iter()
                    .any(|e| matches!(e, TrackingEvent::FrameSkipped { .. }));

                let mut outcome = FrameOutcome {
                    timestamp,
                    events,
                    snapshot,
                    reference,
                    kinematic_error_mm: None,
                    ukf_error_mm: None,
                    particle_error_mm: None,
                };
                if !skipped {
                    outcome.kinematic_error_mm = self
                        .kinematic_poses()
                        .and_then(|poses| position_error_mm(&poses, &outcome.reference));
                    outcome.ukf_error_mm = outcome
                        .snapshot
                        .ukf
                        .as_ref()
                        .and_then(|o| position_error_mm(&o.poses, &outcome.reference));
                    outcome.particle_error_mm = outcome
                        .snapshot
                        .particle
                        .as_ref()
                        .and_then(|o| position_error_mm(&o.poses, &outcome.reference));
                }
                self.kinematic_errors.extend(outcome.kinematic_error_mm);
                self.ukf_errors.extend(outcome.ukf_error_mm);
                self.particle_errors.extend(outcome.particle_error_mm);
                Ok(Some(outcome))
            }
        }
    }

    pub fn summary(&self) -> ReplaySummary {
        let snapshot = self.tracker.get_snapshot();
        let health = self.tracker.health();
        ReplaySummary {
            frames: snapshot.frames,
            skipped_frames: snapshot.skipped_frames,
            kinematic_rmse_mm: rmse(&self.kinematic_errors),
            ukf_rmse_mm: rmse(&self.ukf_errors),
            particle_rmse_mm: rmse(&self.particle_errors),
            ukf_failures: health.ukf.failures,
            particle_failures: health.particle.failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerGroup;
    use crate::error::NumericalCondition;
    use approx::assert_relative_eq;

    fn config() -> TrackerConfig {
        TrackerConfig {
            process_noise: PerGroup::new(1e-6, 1e-6, 1e-6),
            particle_init_std: PerGroup::new(0.002, 0.01, 0.01),
            num_particles: 200,
            workers: 2,
            seed: Some(17),
            ..TrackerConfig::default()
        }
    }

    fn play(session: Session, mode: EstimatorMode) -> (SessionPlayer, Vec<FrameOutcome>) {
        let mut player = SessionPlayer::new(config(), mode, &session).unwrap();
        let outcomes: Vec<FrameOutcome> = session
            .records
            .into_iter()
            .filter_map(|r| player.apply(r).unwrap())
            .collect();
        (player, outcomes)
    }

    #[test]
    fn test_rmse_and_position_error() {
        assert_eq!(rmse(&[]), None);
        assert_relative_eq!(rmse(&[3.0, 4.0]).unwrap(), (12.5f64).sqrt());

        let a = ToolPose::new(Vector3::new(0.0, 0.0, 0.1), Vector3::zeros(), None);
        let b = ToolPose::new(Vector3::new(0.003, 0.004, 0.1), Vector3::zeros(), None);
        assert_relative_eq!(position_error_mm(&[a.clone()], &[b]).unwrap(), 5.0, epsilon = 1e-9);
        assert_eq!(position_error_mm(&[a], &[]), None);
    }

    #[test]
    fn test_kinematics_accepts_six_or_nine_values() {
        let pose = EncodedPoseKinematics.tool_pose(0, &[0.0; 6]).unwrap();
        assert!(pose.joint_angles.is_none());
        let pose = EncodedPoseKinematics.tool_pose(0, &[1.0; 9]).unwrap();
        assert_eq!(pose.joint_angles, Some(Vector3::new(1.0, 1.0, 1.0)));
        assert!(EncodedPoseKinematics.tool_pose(0, &[0.0; 7]).is_err());
    }

    #[test]
    fn test_reference_oracle_scores_zero_at_reference() {
        let oracle = ReferenceOracle::new(SHAFT_KEYPOINT);
        let ctx = ObservationContext {
            timestamp: 0.0,
            projection: pinhole_pair(800.0, 320.0, 240.0, 0.005),
            extrinsics: vec![StereoExtrinsics::default()],
            frame: StereoFrame::blank(4, 4),
        };
        let truth = reference_pose(0, 0.0, true);
        assert!(matches!(oracle.score(&[truth.clone()], &ctx), Err(TrackingError::Oracle(_))));

        oracle.set_reference(vec![truth.clone()]);
        assert_relative_eq!(oracle.score(&[truth.clone()], &ctx).unwrap(), 0.0);

        let mut moved = truth.clone();
        moved.translation.x += 0.001;
        assert!(oracle.score(&[moved.clone()], &ctx).unwrap() > 1.0);

        // 2 keypoints x 2 cameras x 2 normals
        assert_eq!(oracle.render(&[moved], &ctx).unwrap().len(), 8);
        assert_eq!(oracle.observed_edges(&ctx).unwrap().len(), 8);
    }

    #[test]
    fn test_point_behind_camera_is_an_oracle_error() {
        let projection = pinhole_pair(800.0, 320.0, 240.0, 0.005);
        let behind = Point3::new(0.0, 0.0, -0.1);
        assert!(project(&projection.left, &Isometry3::identity(), &behind).is_err());
    }

    #[test]
    fn test_synthetic_session_layout() {
        let params = SyntheticParams {
            frames: 5,
            arms: 2,
            projection_delay: 2,
            ..SyntheticParams::default()
        };
        let session = synthesize_session(&params).unwrap();
        assert_eq!(session.frame_count(), 5);
        assert_eq!(session.records.len(), 5 * 3 + 1);
        assert!(matches!(session.records[6], SessionRecord::Projection { .. }));

        let json = serde_json::to_string(&session).unwrap();
        let parsed: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.frame_count(), 5);
    }

    #[test]
    fn test_load_gzip_session() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let session = synthesize_session(&SyntheticParams {
            frames: 3,
            ..SyntheticParams::default()
        })
        .unwrap();
        let path = std::env::temp_dir().join(format!("tool_tracker_session_{}.json.gz", std::process::id()));
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder
            .write_all(serde_json::to_string(&session).unwrap().as_bytes())
            .unwrap();
        encoder.finish().unwrap();

        let loaded = load_session(&path).unwrap();
        assert_eq!(loaded.frame_count(), 3);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_ukf_beats_biased_kinematics() {
        let session = synthesize_session(&SyntheticParams {
            frames: 40,
            ..SyntheticParams::default()
        })
        .unwrap();
        let (player, outcomes) = play(session, EstimatorMode::Ukf);
        let summary = player.summary();

        assert_eq!(summary.frames, 40);
        assert_eq!(summary.ukf_failures, 0);
        assert!(outcomes.iter().all(|o| o.snapshot.ukf.is_some()));

        let kinematic = summary.kinematic_rmse_mm.unwrap();
        let ukf = summary.ukf_rmse_mm.unwrap();
        assert!(kinematic > 2.0, "kinematic rmse {kinematic}");
        // The 0.8 blend pulls every prediction back onto the biased kinematics and
        // depth moves the keypoints by ~0.3 px/mm through a 5 mm baseline, so the
        // depth share of the bias is only partly removed each frame.
        assert!(ukf < 0.6 * kinematic, "ukf {ukf} vs kinematic {kinematic}");
    }

    #[test]
    fn test_delayed_camera_info_runs_prediction_only() {
        let session = synthesize_session(&SyntheticParams {
            frames: 6,
            projection_delay: 3,
            ..SyntheticParams::default()
        })
        .unwrap();
        let (player, outcomes) = play(session, EstimatorMode::Both);

        let unset: Vec<bool> = outcomes
            .iter()
            .map(|o| {
                o.events.iter().any(|e| {
                    matches!(
                        e,
                        TrackingEvent::Condition { condition: NumericalCondition::ProjectionUnset, .. }
                    )
                })
            })
            .collect();
        assert_eq!(unset, vec![true, true, true, false, false, false]);
        assert_eq!(player.summary().particle_failures, 0);
        assert!(outcomes[5].snapshot.particle.as_ref().unwrap().best_score.is_some());
    }
}
