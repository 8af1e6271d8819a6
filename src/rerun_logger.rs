use anyhow::Result;
use rerun::{
    archetypes::{Points3D, Scalar},
    RecordingStreamBuilder,
};

use crate::pose::ToolPose;
use crate::tracker::{EstimatorOutput, TrackingSnapshot};

/// Rerun recording of tracked tool poses and filter diagnostics
/// Supports Rerun v0.15+ API with archetype-based logging
pub struct RerunLogger {
    rec: rerun::RecordingStream,
}

impl RerunLogger {
    /// Initialize Rerun recording to file
    /// Takes output path (e.g., "tracker_output/rerun_20261019_120000.rrd")
    pub fn new(output_path: &str) -> Result<Self> {
        let rec = RecordingStreamBuilder::new("tool_tracker")
            .save(output_path)
            .map_err(|e| anyhow::anyhow!("Failed to create Rerun recording: {}", e))?;

        log::info!("[RERUN] Recording initialized to: {}", output_path);

        Ok(RerunLogger { rec })
    }

    /// Set the current time for all subsequent logs
    pub fn set_time(&self, session_secs: f64) {
        self.rec.set_time_seconds("session_time", session_secs);
    }

    /// Log a scalar value (generic for any measurement)
    pub fn log_scalar(&self, path: &str, value: f64) {
        let _ = self.rec.log(path, &Scalar::new(value));
    }

    /// Log tool tips as 3D points [mm]
    pub fn log_poses(&self, path: &str, poses: &[ToolPose], color: [u8; 3]) {
        let points: Vec<[f32; 3]> = poses
            .iter()
            .map(|p| {
                let t = p.translation * 1000.0;
                [t.x as f32, t.y as f32, t.z as f32]
            })
            .collect();
        let _ = self.rec.log(
            path,
            &Points3D::new(points).with_colors([color]).with_radii([1.0f32]),
        );
    }

    fn log_estimator(&self, name: &str, output: &EstimatorOutput, color: [u8; 3]) {
        self.log_poses(&format!("world/{}/tools", name), &output.poses, color);
        if let Some(trace) = output.estimate.covariance_trace() {
            self.log_scalar(&format!("filter/{}/covariance_trace", name), trace);
        }
        if let Some(nis) = output.nis {
            self.log_scalar(&format!("filter/{}/nis", name), nis);
        }
        if let Some(ess) = output.effective_sample_size {
            self.log_scalar(&format!("filter/{}/ess", name), ess);
        }
        if let Some(score) = output.best_score {
            self.log_scalar(&format!("filter/{}/best_score", name), score);
        }
        self.log_scalar(&format!("filter/{}/conditions", name), output.conditions.len() as f64);
    }

    /// Log everything committed in a tracker snapshot
    pub fn log_snapshot(&self, snapshot: &TrackingSnapshot) {
        self.set_time(snapshot.timestamp);
        if let Some(ukf) = &snapshot.ukf {
            self.log_estimator("ukf", ukf, [0, 160, 255]);
        }
        if let Some(pf) = &snapshot.particle {
            self.log_estimator("pf", pf, [255, 140, 0]);
        }
    }

    /// Log reference poses for comparison
    pub fn log_reference(&self, poses: &[ToolPose]) {
        self.log_poses("world/reference/tools", poses, [0, 200, 0]);
    }

    /// Per-estimator position error against the reference [mm]
    pub fn log_error(&self, estimator: &str, error_mm: f64) {
        self.log_scalar(&format!("error/{}/position_mm", estimator), error_mm);
    }
}
