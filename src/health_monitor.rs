use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{NumericalCondition, TrackingError};

/// Which estimator a health record belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    Ukf,
    Particle,
}

impl EstimatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EstimatorKind::Ukf => "UKF",
            EstimatorKind::Particle => "PF",
        }
    }
}

/// A condition that has repeated for a whole streak window
#[derive(Clone, Debug, PartialEq)]
pub struct PersistentCondition {
    pub estimator: EstimatorKind,
    pub condition: NumericalCondition,
    pub streak: u32,
}

/// Tracks condition counters for one estimator
#[derive(Clone, Debug, Default)]
pub struct EstimatorHealth {
    pub cycles: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    totals: HashMap<NumericalCondition, u64>,
    streaks: HashMap<NumericalCondition, u32>,
}

impl EstimatorHealth {
    /// Count one committed cycle. Streaks of conditions absent this cycle reset.
    pub fn record(&mut self, conditions: &[NumericalCondition]) {
        self.cycles += 1;
        self.streaks.retain(|c, _| conditions.contains(c));
        for &c in conditions {
            *self.streaks.entry(c).or_insert(0) += 1;
            *self.totals.entry(c).or_insert(0) += 1;
        }
    }

    pub fn record_failure(&mut self, error: &TrackingError) {
        self.failures += 1;
        self.last_error = Some(error.to_string());
    }

    pub fn streak(&self, condition: NumericalCondition) -> u32 {
        self.streaks.get(&condition).copied().unwrap_or(0)
    }

    pub fn total(&self, condition: NumericalCondition) -> u64 {
        self.totals.get(&condition).copied().unwrap_or(0)
    }

    pub fn worst_streak(&self) -> Option<(NumericalCondition, u32)> {
        self.streaks
            .iter()
            .max_by_key(|(_, &s)| s)
            .map(|(&c, &s)| (c, s))
    }

    pub fn is_healthy(&self, streak_warning: u32) -> bool {
        self.worst_streak()
            .map(|(_, s)| s < streak_warning)
            .unwrap_or(true)
    }
}

/// Health monitor for both estimators
#[derive(Clone, Debug)]
pub struct HealthMonitor {
    pub ukf: EstimatorHealth,
    pub particle: EstimatorHealth,
    streak_warning: u32,
}

impl HealthMonitor {
    pub fn new(streak_warning: u32) -> Self {
        HealthMonitor {
            ukf: EstimatorHealth::default(),
            particle: EstimatorHealth::default(),
            streak_warning: streak_warning.max(1),
        }
    }

    pub fn estimator(&self, kind: EstimatorKind) -> &EstimatorHealth {
        match kind {
            EstimatorKind::Ukf => &self.ukf,
            EstimatorKind::Particle => &self.particle,
        }
    }

    fn estimator_mut(&mut self, kind: EstimatorKind) -> &mut EstimatorHealth {
        match kind {
            EstimatorKind::Ukf => &mut self.ukf,
            EstimatorKind::Particle => &mut self.particle,
        }
    }

    /// Record a cycle's conditions; returns the ones that just completed a streak window.
    pub fn record(
        &mut self,
        kind: EstimatorKind,
        cycle: u64,
        conditions: &[NumericalCondition],
    ) -> Vec<PersistentCondition> {
        let threshold = self.streak_warning;
        let health = self.estimator_mut(kind);
        health.record(conditions);

        let mut persistent = Vec::new();
        for &condition in conditions {
            let streak = health.streak(condition);
            if streak % threshold == 0 {
                log::error!(
                    "[HEALTH] {} {} for {} consecutive cycles (cycle {})",
                    kind.as_str(),
                    condition.as_str(),
                    streak,
                    cycle
                );
                persistent.push(PersistentCondition {
                    estimator: kind,
                    condition,
                    streak,
                });
            }
        }
        persistent
    }

    pub fn record_failure(&mut self, kind: EstimatorKind, error: &TrackingError) {
        log::warn!("[HEALTH] {} cycle failed: {}", kind.as_str(), error);
        self.estimator_mut(kind).record_failure(error);
    }

    /// Check both estimators and report health status
    pub fn check_health(&self) -> HealthReport {
        HealthReport {
            ukf_healthy: self.ukf.is_healthy(self.streak_warning),
            ukf_worst_streak: self.ukf.worst_streak(),
            ukf_failures: self.ukf.failures,

            particle_healthy: self.particle.is_healthy(self.streak_warning),
            particle_worst_streak: self.particle.worst_streak(),
            particle_failures: self.particle.failures,
        }
    }

    /// Format health status for logging
    pub fn format_status(&self) -> String {
        let report = self.check_health();

        let status = |healthy: bool, worst: Option<(NumericalCondition, u32)>, failures: u64| {
            let mut s = if healthy {
                "✓".to_string()
            } else {
                match worst {
                    Some((c, n)) => format!("⚠ ({} x{})", c.as_str(), n),
                    None => "⚠".to_string(),
                }
            };
            if failures > 0 {
                s.push_str(&format!(" [{} failed]", failures));
            }
            s
        };

        format!(
            "Health: UKF {} | PF {}",
            status(report.ukf_healthy, report.ukf_worst_streak, report.ukf_failures),
            status(
                report.particle_healthy,
                report.particle_worst_streak,
                report.particle_failures
            )
        )
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Report of estimator health status
pub struct HealthReport {
    pub ukf_healthy: bool,
    pub ukf_worst_streak: Option<(NumericalCondition, u32)>,
    pub ukf_failures: u64,

    pub particle_healthy: bool,
    pub particle_worst_streak: Option<(NumericalCondition, u32)>,
    pub particle_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaks_reset_when_condition_clears() {
        let mut health = EstimatorHealth::default();
        let degenerate = NumericalCondition::DegenerateWeights;

        health.record(&[degenerate]);
        health.record(&[degenerate]);
        assert_eq!(health.streak(degenerate), 2);

        health.record(&[]);
        assert_eq!(health.streak(degenerate), 0);
        assert_eq!(health.total(degenerate), 2);
        assert_eq!(health.cycles, 3);
    }

    #[test]
    fn test_persistent_condition_reported_per_window() {
        let mut monitor = HealthMonitor::new(3);
        let c = NumericalCondition::DegenerateInnovationCovariance;

        let mut reported = Vec::new();
        for cycle in 1..=7 {
            reported.extend(monitor.record(EstimatorKind::Ukf, cycle, &[c]));
        }
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0].streak, 3);
        assert_eq!(reported[1].streak, 6);
        assert!(!monitor.check_health().ukf_healthy);
        assert!(monitor.check_health().particle_healthy);
    }

    #[test]
    fn test_health_monitor() {
        let mut monitor = HealthMonitor::default();
        let status = monitor.format_status();
        assert_eq!(status, "Health: UKF ✓ | PF ✓");

        for cycle in 1..=10 {
            monitor.record(EstimatorKind::Particle, cycle, &[NumericalCondition::DegenerateWeights]);
        }
        monitor.record_failure(EstimatorKind::Ukf, &TrackingError::WorkerPanicked);

        let status = monitor.format_status();
        assert!(status.contains("PF ⚠ (degenerate_weights x10)"));
        assert!(status.contains("[1 failed]"));
        assert_eq!(monitor.ukf.failures, 1);
    }
}
