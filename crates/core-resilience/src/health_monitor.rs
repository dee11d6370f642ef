//! Health Monitor: classification of subsystem health into an overall status
//!
//! Each subsystem exposes its own status through [`HealthSource`]. The
//! monitor folds a round of statuses into a [`HealthSnapshot`] and keeps a
//! short history so callers can detect regressions.
//!
//! # Design
//!
//! The health monitor is a pure-logic state machine. It receives subsystem
//! reports from the caller and produces snapshots. Polling and acting on
//! regressions is the caller's job.
//!
//! # Example
//!
//! ```
//! use warden_core_resilience::health_monitor::{
//!     HealthMonitor, HealthStatus, OverallHealth, SubsystemHealth,
//! };
//!
//! let mut monitor = HealthMonitor::new();
//!
//! let snapshot = monitor.check(vec![
//!     SubsystemHealth::new("store", HealthStatus::Failed, "backend gone"),
//!     SubsystemHealth::new("pool", HealthStatus::Healthy, ""),
//! ]);
//!
//! assert_eq!(snapshot.overall, OverallHealth::Critical);
//! ```

use serde::Serialize;
use std::collections::VecDeque;

/// Status of a single subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failed,
}

/// Status of the whole layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    /// Nothing degraded
    Healthy,
    /// At least one subsystem degraded
    Degraded,
    /// One subsystem failed, or three or more degraded
    Critical,
    /// Two or more subsystems failed
    Emergency,
}

impl OverallHealth {
    /// Classify a round of subsystem statuses
    pub fn classify(failed: usize, degraded: usize) -> Self {
        if failed >= 2 {
            OverallHealth::Emergency
        } else if failed >= 1 || degraded >= 3 {
            OverallHealth::Critical
        } else if degraded >= 1 {
            OverallHealth::Degraded
        } else {
            OverallHealth::Healthy
        }
    }

    /// Whether this level warrants a full recovery
    pub fn needs_full_recovery(&self) -> bool {
        *self >= OverallHealth::Critical
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OverallHealth::Healthy => "healthy",
            OverallHealth::Degraded => "degraded",
            OverallHealth::Critical => "critical",
            OverallHealth::Emergency => "emergency",
        }
    }
}

/// Report from one subsystem
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubsystemHealth {
    pub name: String,
    pub status: HealthStatus,
    pub detail: String,
}

impl SubsystemHealth {
    pub fn new(name: impl Into<String>, status: HealthStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            detail: detail.into(),
        }
    }
}

/// Anything that can report its own health
pub trait HealthSource: Send + Sync {
    /// Stable subsystem name used in snapshots
    fn name(&self) -> &str;

    /// Current status
    fn health(&self) -> SubsystemHealth;
}

/// One round of health classification
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Monotonic poll sequence number
    pub sequence: u64,
    pub subsystems: Vec<SubsystemHealth>,
    pub overall: OverallHealth,
    pub failed: usize,
    pub degraded: usize,
}

impl HealthSnapshot {
    /// Status of a named subsystem, if it reported
    pub fn status_of(&self, name: &str) -> Option<HealthStatus> {
        self.subsystems
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.status)
    }
}

/// Folds subsystem reports into snapshots and tracks regressions.
#[derive(Debug)]
pub struct HealthMonitor {
    history: VecDeque<OverallHealth>,
    max_history: usize,
    check_count: u64,
    regression_count: u64,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(64),
            max_history: 60,
            check_count: 0,
            regression_count: 0,
        }
    }

    /// Classify a round of reports
    pub fn check(&mut self, subsystems: Vec<SubsystemHealth>) -> HealthSnapshot {
        self.check_count += 1;

        let failed = subsystems
            .iter()
            .filter(|s| s.status == HealthStatus::Failed)
            .count();
        let degraded = subsystems
            .iter()
            .filter(|s| s.status == HealthStatus::Degraded)
            .count();
        let overall = OverallHealth::classify(failed, degraded);

        if self.is_regression_to(overall) {
            self.regression_count += 1;
        }

        self.history.push_back(overall);
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }

        HealthSnapshot {
            sequence: self.check_count,
            subsystems,
            overall,
            failed,
            degraded,
        }
    }

    /// Overall status of the previous check
    pub fn previous(&self) -> Option<OverallHealth> {
        self.history.back().copied()
    }

    /// Whether moving to `next` is a regression into critical territory
    pub fn is_regression_to(&self, next: OverallHealth) -> bool {
        let previous = self.previous().unwrap_or(OverallHealth::Healthy);
        next.needs_full_recovery() && next > previous
    }

    /// Get monitoring statistics
    pub fn stats(&self) -> HealthMonitorStats {
        HealthMonitorStats {
            check_count: self.check_count,
            regression_count: self.regression_count,
        }
    }
}

/// Statistics for the health monitor
#[derive(Debug, Clone)]
pub struct HealthMonitorStats {
    /// Total checks performed
    pub check_count: u64,
    /// Checks that regressed into critical or emergency
    pub regression_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(statuses: &[HealthStatus]) -> Vec<SubsystemHealth> {
        statuses
            .iter()
            .enumerate()
            .map(|(i, s)| SubsystemHealth::new(format!("s{}", i), *s, ""))
            .collect()
    }

    #[test]
    fn test_classification_thresholds() {
        use HealthStatus::*;
        let mut monitor = HealthMonitor::new();

        let cases = [
            (vec![Healthy, Healthy], OverallHealth::Healthy),
            (vec![Degraded, Healthy], OverallHealth::Degraded),
            (vec![Degraded, Degraded, Healthy], OverallHealth::Degraded),
            (vec![Degraded, Degraded, Degraded], OverallHealth::Critical),
            (vec![Failed, Healthy], OverallHealth::Critical),
            (vec![Failed, Failed], OverallHealth::Emergency),
        ];

        for (statuses, expected) in cases {
            assert_eq!(monitor.check(report(&statuses)).overall, expected);
        }
    }

    #[test]
    fn test_regression_detection() {
        use HealthStatus::*;
        let mut monitor = HealthMonitor::new();

        monitor.check(report(&[Degraded]));
        assert!(monitor.is_regression_to(OverallHealth::Critical));
        assert!(!monitor.is_regression_to(OverallHealth::Degraded));

        monitor.check(report(&[Failed]));
        assert_eq!(monitor.stats().regression_count, 1);

        // Staying critical is not a new regression
        monitor.check(report(&[Failed]));
        assert_eq!(monitor.stats().regression_count, 1);

        monitor.check(report(&[Failed, Failed]));
        assert_eq!(monitor.stats().regression_count, 2);
    }

    #[test]
    fn test_snapshot_lookup() {
        let mut monitor = HealthMonitor::new();
        let snapshot = monitor.check(vec![
            SubsystemHealth::new("store", HealthStatus::Degraded, "memory only"),
            SubsystemHealth::new("pool", HealthStatus::Healthy, ""),
        ]);

        assert_eq!(snapshot.sequence, 1);
        assert_eq!(snapshot.status_of("store"), Some(HealthStatus::Degraded));
        assert_eq!(snapshot.status_of("missing"), None);
    }
}
