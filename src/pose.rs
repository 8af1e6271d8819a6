//! Pose/state codec
//!
//! Maps the estimator's flat state vector to structured tool poses and back.
//! Per arm the layout is `[tx, ty, tz, rx, ry, rz, (q1, q2, q3)]`: translation,
//! axis-angle (Rodrigues) rotation, and optionally the three wrist joint angles.
//! Arms are stored back to back in arm order.

use nalgebra::{DMatrix, Isometry3, Rotation3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{TrackResult, TrackingError};
use crate::types::{StateVec, JOINT_ANGLE_DIM, ORIENTATION_DIM, POSITION_DIM};

/// Semantic group of a state element; noise is tuned per group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterGroup {
    Position,
    Orientation,
    JointAngle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmLayout {
    pub joint_angles: bool,
}

impl ArmLayout {
    pub fn dim(&self) -> usize {
        POSITION_DIM + ORIENTATION_DIM + if self.joint_angles { JOINT_ANGLE_DIM } else { 0 }
    }

    fn group_of(&self, local: usize) -> ParameterGroup {
        if local < POSITION_DIM {
            ParameterGroup::Position
        } else if local < POSITION_DIM + ORIENTATION_DIM {
            ParameterGroup::Orientation
        } else {
            ParameterGroup::JointAngle
        }
    }
}

/// Ordered arm layouts making up one estimator state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateLayout {
    arms: Vec<ArmLayout>,
}

impl StateLayout {
    pub fn new(arms: usize, joint_angles: bool) -> TrackResult<Self> {
        if arms == 0 {
            return Err(TrackingError::InvalidConfig(
                "state layout needs at least one arm".to_string(),
            ));
        }
        Ok(Self {
            arms: vec![ArmLayout { joint_angles }; arms],
        })
    }

    /// L = 9
    pub fn single_arm() -> Self {
        Self {
            arms: vec![ArmLayout { joint_angles: true }],
        }
    }

    /// L = 12
    pub fn dual_arm() -> Self {
        Self {
            arms: vec![ArmLayout { joint_angles: false }; 2],
        }
    }

    pub fn arms(&self) -> &[ArmLayout] {
        &self.arms
    }

    pub fn arm_count(&self) -> usize {
        self.arms.len()
    }

    pub fn dim(&self) -> usize {
        self.arms.iter().map(ArmLayout::dim).sum()
    }

    /// Index of the first state element belonging to `arm`.
    pub fn arm_offset(&self, arm: usize) -> usize {
        self.arms.iter().take(arm).map(ArmLayout::dim).sum()
    }

    pub fn group_of(&self, index: usize) -> Option<ParameterGroup> {
        let mut offset = 0;
        for arm in &self.arms {
            if index < offset + arm.dim() {
                return Some(arm.group_of(index - offset));
            }
            offset += arm.dim();
        }
        None
    }

    /// Group of every state element, in order.
    pub fn groups(&self) -> Vec<ParameterGroup> {
        self.arms
            .iter()
            .flat_map(|arm| (0..arm.dim()).map(move |i| arm.group_of(i)))
            .collect()
    }

    /// Diagonal matrix with one value per parameter group.
    pub fn group_diagonal(&self, position: f64, orientation: f64, joint_angle: f64) -> DMatrix<f64> {
        let values: Vec<f64> = self
            .groups()
            .into_iter()
            .map(|g| match g {
                ParameterGroup::Position => position,
                ParameterGroup::Orientation => orientation,
                ParameterGroup::JointAngle => joint_angle,
            })
            .collect();
        DMatrix::from_diagonal(&StateVec::from_vec(values))
    }
}

/// Structured pose of one tool, as consumed by the kinematics and rendering collaborators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolPose {
    /// Tool origin in the arm base frame [m]
    pub translation: Vector3<f64>,

    /// Axis-angle (Rodrigues) rotation [rad]
    pub rotation: Vector3<f64>,

    /// Wrist joint angles [rad], when the layout carries them
    pub joint_angles: Option<Vector3<f64>>,
}

impl ToolPose {
    pub fn new(translation: Vector3<f64>, rotation: Vector3<f64>, joint_angles: Option<Vector3<f64>>) -> Self {
        Self {
            translation,
            rotation,
            joint_angles,
        }
    }

    /// Build from a forward-kinematics transform; the rotation becomes its Rodrigues vector.
    pub fn from_isometry(transform: &Isometry3<f64>, joint_angles: Option<Vector3<f64>>) -> Self {
        Self {
            translation: transform.translation.vector,
            rotation: transform.rotation.scaled_axis(),
            joint_angles,
        }
    }

    pub fn rotation_matrix(&self) -> Rotation3<f64> {
        Rotation3::new(self.rotation)
    }

    pub fn isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::from(self.translation),
            UnitQuaternion::from_scaled_axis(self.rotation),
        )
    }
}

/// Bidirectional, lossless state <-> pose mapping for a fixed layout.
#[derive(Clone, Debug)]
pub struct PoseCodec {
    layout: StateLayout,
}

impl PoseCodec {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn dim(&self) -> usize {
        self.layout.dim()
    }

    /// Reject vectors of the wrong length before they enter a filter.
    pub fn check(&self, state: &StateVec) -> TrackResult<()> {
        if state.len() != self.dim() {
            return Err(TrackingError::MalformedState {
                expected: self.dim(),
                actual: state.len(),
            });
        }
        Ok(())
    }

    pub fn encode(&self, poses: &[ToolPose]) -> TrackResult<StateVec> {
        if poses.len() != self.layout.arm_count() {
            return Err(TrackingError::DimensionMismatch {
                what: "arm count",
                expected: self.layout.arm_count(),
                actual: poses.len(),
            });
        }

        let mut values = Vec::with_capacity(self.dim());
        for (arm, pose) in self.layout.arms().iter().zip(poses) {
            values.extend(pose.translation.iter());
            values.extend(pose.rotation.iter());
            match (arm.joint_angles, &pose.joint_angles) {
                (true, Some(joints)) => values.extend(joints.iter()),
                (false, None) => {}
                (true, None) => {
                    return Err(TrackingError::DimensionMismatch {
                        what: "joint angles",
                        expected: JOINT_ANGLE_DIM,
                        actual: 0,
                    })
                }
                (false, Some(_)) => {
                    return Err(TrackingError::DimensionMismatch {
                        what: "joint angles",
                        expected: 0,
                        actual: JOINT_ANGLE_DIM,
                    })
                }
            }
        }
        Ok(StateVec::from_vec(values))
    }

    pub fn decode(&self, state: &StateVec) -> TrackResult<Vec<ToolPose>> {
        self.decode_slice(state.as_slice())
    }

    pub fn decode_slice(&self, state: &[f64]) -> TrackResult<Vec<ToolPose>> {
        if state.len() != self.dim() {
            return Err(TrackingError::MalformedState {
                expected: self.dim(),
                actual: state.len(),
            });
        }

        let mut poses = Vec::with_capacity(self.layout.arm_count());
        let mut offset = 0;
        for arm in self.layout.arms() {
            let s = &state[offset..offset + arm.dim()];
            let joint_angles = arm
                .joint_angles
                .then(|| Vector3::new(s[6], s[7], s[8]));
            poses.push(ToolPose {
                translation: Vector3::new(s[0], s[1], s[2]),
                rotation: Vector3::new(s[3], s[4], s[5]),
                joint_angles,
            });
            offset += arm.dim();
        }
        Ok(poses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> ToolPose {
        ToolPose::new(
            Vector3::new(0.01, -0.02, 0.15),
            Vector3::new(0.1, 0.2, -0.3),
            Some(Vector3::new(0.4, -0.5, 0.6)),
        )
    }

    #[test]
    fn test_single_arm_layout() {
        let layout = StateLayout::single_arm();
        assert_eq!(layout.dim(), 9);
        assert_eq!(layout.group_of(0), Some(ParameterGroup::Position));
        assert_eq!(layout.group_of(4), Some(ParameterGroup::Orientation));
        assert_eq!(layout.group_of(8), Some(ParameterGroup::JointAngle));
        assert_eq!(layout.group_of(9), None);
    }

    #[test]
    fn test_dual_arm_layout() {
        let layout = StateLayout::dual_arm();
        assert_eq!(layout.dim(), 12);
        assert_eq!(layout.arm_offset(1), 6);
        assert_eq!(layout.group_of(6), Some(ParameterGroup::Position));
        assert_eq!(layout.group_of(11), Some(ParameterGroup::Orientation));
        assert!(StateLayout::new(0, true).is_err());
        assert_eq!(StateLayout::new(2, true).unwrap().dim(), 18);
    }

    #[test]
    fn test_group_diagonal() {
        let q = StateLayout::single_arm().group_diagonal(1.0, 2.0, 3.0);
        assert_eq!(q[(2, 2)], 1.0);
        assert_eq!(q[(3, 3)], 2.0);
        assert_eq!(q[(8, 8)], 3.0);
        assert_eq!(q[(0, 1)], 0.0);
    }

    #[test]
    fn test_encode_decode_exact() {
        let codec = PoseCodec::new(StateLayout::single_arm());
        let pose = sample_pose();
        let state = codec.encode(std::slice::from_ref(&pose)).unwrap();
        assert_eq!(state.len(), 9);
        assert_eq!(state[5], -0.3);
        assert_eq!(state[8], 0.6);

        let decoded = codec.decode(&state).unwrap();
        assert_eq!(decoded, vec![pose]);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let codec = PoseCodec::new(StateLayout::single_arm());
        let err = codec.decode(&StateVec::zeros(8)).unwrap_err();
        assert_eq!(
            err,
            TrackingError::MalformedState {
                expected: 9,
                actual: 8
            }
        );
        assert!(codec.decode(&StateVec::zeros(10)).is_err());
    }

    #[test]
    fn test_encode_rejects_joint_mismatch() {
        let codec = PoseCodec::new(StateLayout::dual_arm());
        let pose = sample_pose();
        assert!(codec.encode(&[pose.clone(), pose.clone()]).is_err());
        assert!(codec.encode(&[pose]).is_err());
    }

    #[test]
    fn test_isometry_round_trip() {
        let pose = sample_pose();
        let back = ToolPose::from_isometry(&pose.isometry(), pose.joint_angles);
        assert_relative_eq!(back.translation, pose.translation, epsilon = 1e-12);
        assert_relative_eq!(back.rotation, pose.rotation, epsilon = 1e-12);
        assert_relative_eq!(
            pose.rotation_matrix().matrix(),
            pose.isometry().rotation.to_rotation_matrix().matrix(),
            epsilon = 1e-12
        );
    }
}
