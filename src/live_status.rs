use serde::{Deserialize, Serialize};
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::NumericalCondition;
use crate::health_monitor::{EstimatorHealth, HealthMonitor};
use crate::tracker::{EstimatorOutput, TrackingSnapshot};

/// Per-estimator slice of the status file
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct EstimatorStatus {
    pub enabled: bool,
    pub cycle: u64,
    pub position_mm: Vec<[f64; 3]>,
    pub covariance_trace: f64,
    pub nis: Option<f64>,
    pub effective_sample_size: Option<f64>,
    pub best_score: Option<f64>,
    pub conditions: Vec<NumericalCondition>,
    // Health monitoring
    pub healthy: bool,
    pub failures: u64,
    pub last_error: Option<String>,
}

impl EstimatorStatus {
    fn from_parts(output: Option<&EstimatorOutput>, health: &EstimatorHealth, streak_warning: u32) -> Self {
        let mut status = EstimatorStatus {
            healthy: health.is_healthy(streak_warning),
            failures: health.failures,
            last_error: health.last_error.clone(),
            ..Default::default()
        };
        if let Some(out) = output {
            status.enabled = true;
            status.cycle = out.estimate.cycle;
            status.position_mm = out
                .poses
                .iter()
                .map(|p| [p.translation.x * 1000.0, p.translation.y * 1000.0, p.translation.z * 1000.0])
                .collect();
            status.covariance_trace = out.estimate.covariance_trace().unwrap_or(0.0);
            status.nis = out.nis;
            status.effective_sample_size = out.effective_sample_size;
            status.best_score = out.best_score;
            status.conditions = out.conditions.clone();
        }
        status
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub session_time: f64,
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub uptime_seconds: u64,
    pub ukf: EstimatorStatus,
    pub particle: EstimatorStatus,
    pub health: String,
}

impl LiveStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            session_time: 0.0,
            frames_processed: 0,
            frames_skipped: 0,
            uptime_seconds: 0,
            ukf: EstimatorStatus::default(),
            particle: EstimatorStatus::default(),
            health: String::new(),
        }
    }

    /// Refresh from the latest tracker snapshot and health counters.
    pub fn update(&mut self, snapshot: &TrackingSnapshot, health: &HealthMonitor, streak_warning: u32, uptime_seconds: u64) {
        self.timestamp = current_timestamp();
        self.session_time = snapshot.timestamp;
        self.frames_processed = snapshot.frames;
        self.frames_skipped = snapshot.skipped_frames;
        self.uptime_seconds = uptime_seconds;
        self.ukf = EstimatorStatus::from_parts(snapshot.ukf.as_ref(), &health.ukf, streak_warning);
        self.particle = EstimatorStatus::from_parts(snapshot.particle.as_ref(), &health.particle, streak_warning);
        self.health = health.format_status();
    }

    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl Default for LiveStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
