//! Structured outcome of a scheduler run.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use error_handling_rs::ErrorIncident;

use crate::unit::{UnitState, WorkUnit};

/// How a unit ended the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitOutcome {
    Completed,
    Failed,
    /// Not executed because a dependency did not complete
    Skipped,
    /// Abandoned in flight by a cancelled run
    Cancelled,
    /// Never dispatched because the run was cancelled first
    Pending,
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitOutcome::Completed => "completed",
            UnitOutcome::Failed => "failed",
            UnitOutcome::Skipped => "skipped",
            UnitOutcome::Cancelled => "cancelled",
            UnitOutcome::Pending => "pending",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub unit_id: String,
    pub outcome: UnitOutcome,
    /// The unit's own state; skipped units stay `pending`
    pub state: UnitState,
    pub attempts: u32,
    pub output: Option<String>,
    pub errors: Vec<String>,
    /// Dependencies that did not complete, for skipped units
    pub blocked_by: Vec<String>,
    pub healing_applied: Vec<String>,
    pub recovered: bool,
    pub duration_ms: u64,
}

impl UnitReport {
    pub(crate) fn new(unit: &WorkUnit, outcome: UnitOutcome, blocked_by: Vec<String>) -> Self {
        Self {
            unit_id: unit.id.clone(),
            outcome,
            state: unit.state,
            attempts: unit.metrics.attempts,
            output: match outcome {
                UnitOutcome::Completed => unit.metrics.last_output.clone(),
                _ => None,
            },
            errors: unit.metrics.errors.clone(),
            blocked_by,
            healing_applied: unit.metrics.healing_applied.clone(),
            recovered: unit.metrics.recovered,
            duration_ms: unit.metrics.duration_ms,
        }
    }

    /// Human-readable reason for a skipped unit
    pub fn skip_reason(&self) -> Option<String> {
        (self.outcome == UnitOutcome::Skipped)
            .then(|| format!("skipped due to unmet dependency: {}", self.blocked_by.join(", ")))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunMetrics {
    pub total_units: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub pending: usize,
    pub total_attempts: u32,
    /// completed / (completed + failed); 0 when nothing was attempted
    pub success_rate: f64,
    pub wall_time_ms: u64,
}

impl RunMetrics {
    pub(crate) fn from_reports(reports: &[UnitReport], wall_time_ms: u64) -> Self {
        let count = |outcome: UnitOutcome| reports.iter().filter(|r| r.outcome == outcome).count();
        let completed = count(UnitOutcome::Completed);
        let failed = count(UnitOutcome::Failed);
        let attempted = completed + failed;

        Self {
            total_units: reports.len(),
            completed,
            failed,
            skipped: count(UnitOutcome::Skipped),
            cancelled: count(UnitOutcome::Cancelled),
            pending: count(UnitOutcome::Pending),
            total_attempts: reports.iter().map(|r| r.attempts).sum(),
            success_rate: if attempted == 0 {
                0.0
            } else {
                completed as f64 / attempted as f64
            },
            wall_time_ms,
        }
    }
}

/// Everything a caller needs to tell partial failure from success
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    /// In execution order
    pub units: Vec<UnitReport>,
    /// Incidents raised for units handed to the recovery coordinator
    pub incidents: Vec<ErrorIncident>,
    pub metrics: RunMetrics,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    pub fn unit(&self, unit_id: &str) -> Option<&UnitReport> {
        self.units.iter().find(|r| r.unit_id == unit_id)
    }

    pub fn outcome(&self, unit_id: &str) -> Option<UnitOutcome> {
        self.unit(unit_id).map(|r| r.outcome)
    }

    /// Every unit completed
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.units.iter().all(|r| r.outcome == UnitOutcome::Completed)
    }

    pub fn units_with(&self, outcome: UnitOutcome) -> Vec<&str> {
        self.units
            .iter()
            .filter(|r| r.outcome == outcome)
            .map(|r| r.unit_id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(id: &str, outcome: UnitOutcome, attempts: u32) -> UnitReport {
        let mut unit = WorkUnit::new(id, "echo", id);
        unit.metrics.attempts = attempts;
        UnitReport::new(&unit, outcome, Vec::new())
    }

    #[test]
    fn test_success_rate_ignores_skipped_units() {
        let reports = vec![
            report("a", UnitOutcome::Completed, 1),
            report("b", UnitOutcome::Failed, 3),
            report("c", UnitOutcome::Skipped, 0),
        ];
        let metrics = RunMetrics::from_reports(&reports, 12);
        assert_eq!(metrics.total_units, 3);
        assert_eq!(metrics.skipped, 1);
        assert_eq!(metrics.total_attempts, 4);
        assert_eq!(metrics.success_rate, 0.5);
        assert_eq!(metrics.wall_time_ms, 12);
    }

    #[test]
    fn test_success_rate_with_nothing_attempted() {
        let metrics = RunMetrics::from_reports(&[report("a", UnitOutcome::Pending, 0)], 0);
        assert_eq!(metrics.success_rate, 0.0);
    }

    #[test]
    fn test_skip_reason() {
        let unit = WorkUnit::new("c", "echo", "c");
        let skipped = UnitReport::new(&unit, UnitOutcome::Skipped, vec!["b".to_string()]);
        assert_eq!(skipped.skip_reason().unwrap(), "skipped due to unmet dependency: b");
        assert_eq!(skipped.state, UnitState::Pending);
        assert!(report("a", UnitOutcome::Completed, 1).skip_reason().is_none());
    }
}
