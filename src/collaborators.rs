// collaborators.rs: Seams to the systems the estimators consume but do not own
//
// Rendering + chamfer scoring, forward kinematics, and the camera projection
// feed are all external. The estimators only see the traits and read-only
// snapshots defined here.

use std::sync::{Arc, RwLock};

use nalgebra::{Isometry3, Matrix3x4, Vector2};
use serde::{Deserialize, Serialize};

use crate::error::{TrackResult, TrackingError};
use crate::pose::{PoseCodec, ToolPose};
use crate::types::{JointReading, MeasurementVec, StateVec};

// ─── Camera inputs ───────────────────────────────────────────────────────────

/// Left/right 3x4 projection matrices. All zeros until the first camera info arrives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StereoProjection {
    pub left: Matrix3x4<f64>,
    pub right: Matrix3x4<f64>,
}

impl Default for StereoProjection {
    fn default() -> Self {
        Self {
            left: Matrix3x4::zeros(),
            right: Matrix3x4::zeros(),
        }
    }
}

impl StereoProjection {
    pub fn new(left: Matrix3x4<f64>, right: Matrix3x4<f64>) -> Self {
        Self { left, right }
    }

    pub fn is_set(&self) -> bool {
        self.left.iter().any(|&v| v != 0.0) && self.right.iter().any(|&v| v != 0.0)
    }
}

/// Projection matrices updated asynchronously by the camera-info feed.
#[derive(Clone, Debug, Default)]
pub struct ProjectionCell {
    inner: Arc<RwLock<StereoProjection>>,
}

impl ProjectionCell {
    pub fn set_left(&self, left: Matrix3x4<f64>) {
        if let Ok(mut p) = self.inner.write() {
            p.left = left;
        }
    }

    pub fn set_right(&self, right: Matrix3x4<f64>) {
        if let Ok(mut p) = self.inner.write() {
            p.right = right;
        }
    }

    /// Copy of the latest matrices; may still be unset.
    pub fn snapshot(&self) -> StereoProjection {
        match self.inner.read() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Arm base frame expressed in the left and right camera frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StereoExtrinsics {
    pub left: Isometry3<f64>,
    pub right: Isometry3<f64>,
}

impl Default for StereoExtrinsics {
    fn default() -> Self {
        Self {
            left: Isometry3::identity(),
            right: Isometry3::identity(),
        }
    }
}

/// Edge map produced by the external segmentation step. Pixel data is shared, never mutated.
#[derive(Clone, Debug)]
pub struct SegmentedImage {
    width: usize,
    height: usize,
    pixels: Arc<[f32]>,
}

impl SegmentedImage {
    pub fn new(width: usize, height: usize, pixels: Vec<f32>) -> TrackResult<Self> {
        if pixels.len() != width * height {
            return Err(TrackingError::DimensionMismatch {
                what: "segmented image pixels",
                expected: width * height,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels: pixels.into(),
        })
    }

    pub fn blank(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0.0; width * height].into(),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn get(&self, x: usize, y: usize) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get(y * self.width + x).copied()
    }
}

#[derive(Clone, Debug)]
pub struct StereoFrame {
    pub left: SegmentedImage,
    pub right: SegmentedImage,
}

impl StereoFrame {
    pub fn blank(width: usize, height: usize) -> Self {
        Self {
            left: SegmentedImage::blank(width, height),
            right: SegmentedImage::blank(width, height),
        }
    }
}

/// Read-only inputs of one estimation cycle.
#[derive(Clone, Debug)]
pub struct ObservationContext {
    pub timestamp: f64,
    pub projection: StereoProjection,
    /// One entry per arm, in state-layout order
    pub extrinsics: Vec<StereoExtrinsics>,
    pub frame: StereoFrame,
}

// ─── Measurement oracle ──────────────────────────────────────────────────────

/// Rendered contour point with its image-space normal.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    pub point: Vector2<f64>,
    pub normal: Vector2<f64>,
}

impl Correspondence {
    pub fn new(point: Vector2<f64>, normal: Vector2<f64>) -> Self {
        Self { point, normal }
    }

    /// n^T p
    pub fn projection(&self) -> f64 {
        self.normal.dot(&self.point)
    }
}

/// Measurement vector whose length is decided per cycle by the renderer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement(pub MeasurementVec);

impl Measurement {
    pub fn from_correspondences(correspondences: &[Correspondence]) -> Self {
        Self(MeasurementVec::from_iterator(
            correspondences.len(),
            correspondences.iter().map(Correspondence::projection),
        ))
    }

    pub fn scalar(value: f64) -> Self {
        Self(MeasurementVec::from_element(1, value))
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn as_vector(&self) -> &MeasurementVec {
        &self.0
    }
}

/// Render-and-score collaborator. Implementations must be safe to call from
/// several worker threads at once (each call renders into its own buffers).
pub trait MeasurementOracle: Send + Sync {
    /// Chamfer-style matching score of the rendered poses against the frame; lower is better.
    fn score(&self, poses: &[ToolPose], ctx: &ObservationContext) -> TrackResult<f64>;

    /// Rendered contour correspondences for the poses.
    fn render(&self, poses: &[ToolPose], ctx: &ObservationContext) -> TrackResult<Vec<Correspondence>>;

    /// Edge correspondences detected in the segmented frame, matched to the rendered contour.
    fn observed_edges(&self, _ctx: &ObservationContext) -> TrackResult<Vec<Correspondence>> {
        Err(TrackingError::Oracle(
            "oracle does not provide edge observations".to_string(),
        ))
    }
}

impl<O: MeasurementOracle + ?Sized> MeasurementOracle for Arc<O> {
    fn score(&self, poses: &[ToolPose], ctx: &ObservationContext) -> TrackResult<f64> {
        (**self).score(poses, ctx)
    }

    fn render(&self, poses: &[ToolPose], ctx: &ObservationContext) -> TrackResult<Vec<Correspondence>> {
        (**self).render(poses, ctx)
    }

    fn observed_edges(&self, ctx: &ObservationContext) -> TrackResult<Vec<Correspondence>> {
        (**self).observed_edges(ctx)
    }
}

/// State-to-measurement map used by the UKF correction.
pub trait MeasurementModel: Send + Sync {
    /// Predicted measurement for one candidate state.
    fn measure(&self, poses: &[ToolPose], ctx: &ObservationContext) -> TrackResult<Measurement>;

    /// Measurement actually observed this cycle.
    fn observe(&self, ctx: &ObservationContext) -> TrackResult<Measurement>;
}

/// z_i = n_i^T p_i over the rendered correspondences.
#[derive(Clone, Debug)]
pub struct RenderedEdges<O>(pub O);

impl<O: MeasurementOracle> MeasurementModel for RenderedEdges<O> {
    fn measure(&self, poses: &[ToolPose], ctx: &ObservationContext) -> TrackResult<Measurement> {
        let correspondences = self.0.render(poses, ctx)?;
        Ok(Measurement::from_correspondences(&correspondences))
    }

    fn observe(&self, ctx: &ObservationContext) -> TrackResult<Measurement> {
        let correspondences = self.0.observed_edges(ctx)?;
        Ok(Measurement::from_correspondences(&correspondences))
    }
}

/// z = [score]; the observation to correct against is a perfect match, [0].
#[derive(Clone, Debug)]
pub struct MatchingScore<O>(pub O);

impl<O> MatchingScore<O> {
    pub fn target() -> Measurement {
        Measurement::scalar(0.0)
    }
}

impl<O: MeasurementOracle> MeasurementModel for MatchingScore<O> {
    fn measure(&self, poses: &[ToolPose], ctx: &ObservationContext) -> TrackResult<Measurement> {
        Ok(Measurement::scalar(self.0.score(poses, ctx)?))
    }

    fn observe(&self, _ctx: &ObservationContext) -> TrackResult<Measurement> {
        Ok(Self::target())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    RenderedEdges,
    MatchingScore,
}

/// Config-selected measurement model over a shared oracle
#[derive(Clone, Debug)]
pub enum AnyMeasurement<O> {
    RenderedEdges(RenderedEdges<O>),
    MatchingScore(MatchingScore<O>),
}

impl<O: MeasurementOracle> AnyMeasurement<O> {
    pub fn new(kind: MeasurementKind, oracle: O) -> Self {
        match kind {
            MeasurementKind::RenderedEdges => AnyMeasurement::RenderedEdges(RenderedEdges(oracle)),
            MeasurementKind::MatchingScore => AnyMeasurement::MatchingScore(MatchingScore(oracle)),
        }
    }
}

impl<O: MeasurementOracle> MeasurementModel for AnyMeasurement<O> {
    fn measure(&self, poses: &[ToolPose], ctx: &ObservationContext) -> TrackResult<Measurement> {
        match self {
            AnyMeasurement::RenderedEdges(m) => m.measure(poses, ctx),
            AnyMeasurement::MatchingScore(m) => m.measure(poses, ctx),
        }
    }

    fn observe(&self, ctx: &ObservationContext) -> TrackResult<Measurement> {
        match self {
            AnyMeasurement::RenderedEdges(m) => m.observe(ctx),
            AnyMeasurement::MatchingScore(m) => m.observe(ctx),
        }
    }
}

// ─── Kinematics ──────────────────────────────────────────────────────────────

/// Forward kinematics: joint-encoder vector of one arm to its tool pose.
pub trait ForwardKinematics: Send + Sync {
    fn tool_pose(&self, arm: usize, joints: &[f64]) -> TrackResult<ToolPose>;
}

/// Encode the coarse guess for every arm of the codec's layout from the latest joint readings.
pub fn coarse_guess<K: ForwardKinematics + ?Sized>(
    kinematics: &K,
    readings: &[JointReading],
    codec: &PoseCodec,
) -> TrackResult<StateVec> {
    let arms = codec.layout().arm_count();
    let mut poses = Vec::with_capacity(arms);
    for arm in 0..arms {
        let reading = readings
            .iter()
            .filter(|r| r.arm == arm)
            .max_by(|a, b| a.timestamp.total_cmp(&b.timestamp))
            .ok_or(TrackingError::DimensionMismatch {
                what: "joint readings per arm",
                expected: arms,
                actual: readings.len(),
            })?;
        poses.push(kinematics.tool_pose(arm, &reading.positions)?);
    }
    codec.encode(&poses)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nalgebra::Vector3;

    use super::*;

    pub fn context(arms: usize, projection_set: bool) -> ObservationContext {
        let projection = if projection_set {
            StereoProjection::new(Matrix3x4::identity(), Matrix3x4::identity())
        } else {
            StereoProjection::default()
        };
        ObservationContext {
            timestamp: 0.0,
            projection,
            extrinsics: vec![StereoExtrinsics::default(); arms],
            frame: StereoFrame::blank(4, 4),
        }
    }

    /// Scores by distance to fixed target translations [mm]; counts calls.
    pub struct TargetOracle {
        pub targets: Vec<Vector3<f64>>,
        pub calls: AtomicUsize,
    }

    impl TargetOracle {
        pub fn new(targets: Vec<Vector3<f64>>) -> Self {
            Self {
                targets,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn edges(translations: impl Iterator<Item = Vector3<f64>>) -> Vec<Correspondence> {
            translations
                .flat_map(|t| {
                    let p = Vector2::new(t.x, t.y) * 1000.0;
                    [
                        Correspondence::new(p, Vector2::new(1.0, 0.0)),
                        Correspondence::new(p, Vector2::new(0.0, 1.0)),
                        Correspondence::new(Vector2::new(t.z * 1000.0, 0.0), Vector2::new(1.0, 0.0)),
                    ]
                })
                .collect()
        }
    }

    impl MeasurementOracle for TargetOracle {
        fn score(&self, poses: &[ToolPose], _ctx: &ObservationContext) -> TrackResult<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(poses
                .iter()
                .zip(&self.targets)
                .map(|(pose, target)| (pose.translation - target).norm() * 1000.0)
                .sum())
        }

        fn render(&self, poses: &[ToolPose], _ctx: &ObservationContext) -> TrackResult<Vec<Correspondence>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Self::edges(poses.iter().map(|p| p.translation)))
        }

        fn observed_edges(&self, _ctx: &ObservationContext) -> TrackResult<Vec<Correspondence>> {
            Ok(Self::edges(self.targets.iter().copied()))
        }
    }

    /// Every pose matches equally well.
    pub struct FlatOracle;

    impl MeasurementOracle for FlatOracle {
        fn score(&self, _poses: &[ToolPose], _ctx: &ObservationContext) -> TrackResult<f64> {
            Ok(0.0)
        }

        fn render(&self, _poses: &[ToolPose], _ctx: &ObservationContext) -> TrackResult<Vec<Correspondence>> {
            Ok(Vec::new())
        }
    }
}
