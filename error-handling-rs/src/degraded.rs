//! # Degraded Mode
//!
//! Registry of named reduced-feature modes. Graceful degradation recovery
//! activates a mode here; hosts check `is_active` to decide whether to skip
//! optional work.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

/// Severity of degraded mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradedSeverity {
    /// Minor degradation, most functionality works
    Minor,
    /// Moderate degradation, core functionality works
    Moderate,
    /// Severe degradation, limited functionality
    Severe,
    /// Critical degradation, minimal functionality
    Critical,
}

#[derive(Debug, Clone)]
struct ModeEntry {
    active: bool,
    activated_at: Instant,
    activated_wall: DateTime<Utc>,
    reason: String,
    severity: DegradedSeverity,
}

/// Public view of one mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradedModeInfo {
    pub name: String,
    pub active: bool,
    pub reason: String,
    pub severity: DegradedSeverity,
    pub activated_at: DateTime<Utc>,
}

/// Degraded mode management
#[derive(Debug, Default)]
pub struct DegradedMode {
    modes: RwLock<HashMap<String, ModeEntry>>,
}

impl DegradedMode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activates (or re-activates) a degraded mode
    pub fn activate<S1, S2>(&self, mode: S1, reason: S2, severity: DegradedSeverity)
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        let mode_name = mode.into();
        let reason = reason.into();

        warn!(
            mode = %mode_name,
            reason = %reason,
            severity = ?severity,
            "Activated degraded mode"
        );
        counter!("degraded_mode.activations", 1, "mode" => mode_name.clone());

        self.modes.write().unwrap_or_else(PoisonError::into_inner).insert(
            mode_name,
            ModeEntry {
                active: true,
                activated_at: Instant::now(),
                activated_wall: Utc::now(),
                reason,
                severity,
            },
        );
    }

    /// Deactivates a degraded mode; returns how long it was active
    pub fn deactivate(&self, mode: &str) -> Option<Duration> {
        let mut modes = self.modes.write().unwrap_or_else(PoisonError::into_inner);
        let entry = modes.get_mut(mode).filter(|entry| entry.active)?;
        entry.active = false;

        let duration = entry.activated_at.elapsed();
        info!(mode = %mode, duration_secs = %duration.as_secs(), "Deactivated degraded mode");
        gauge!("degraded_mode.duration_secs", duration.as_secs_f64(), "mode" => mode.to_string());
        Some(duration)
    }

    pub fn is_active(&self, mode: &str) -> bool {
        self.modes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(mode)
            .map(|entry| entry.active)
            .unwrap_or(false)
    }

    pub fn info(&self, mode: &str) -> Option<DegradedModeInfo> {
        self.modes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(mode)
            .map(|entry| to_info(mode, entry))
    }

    /// Names of all active modes, sorted
    pub fn active_modes(&self) -> Vec<String> {
        let modes = self.modes.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = modes
            .iter()
            .filter(|(_, entry)| entry.active)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

fn to_info(name: &str, entry: &ModeEntry) -> DegradedModeInfo {
    DegradedModeInfo {
        name: name.to_string(),
        active: entry.active,
        reason: entry.reason.clone(),
        severity: entry.severity,
        activated_at: entry.activated_wall,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activate_and_deactivate() {
        let degraded = DegradedMode::new();
        assert!(!degraded.is_active("search"));

        degraded.activate("search", "backend flapping", DegradedSeverity::Moderate);
        assert!(degraded.is_active("search"));
        assert_eq!(degraded.active_modes(), vec!["search".to_string()]);

        let info = degraded.info("search").unwrap();
        assert_eq!(info.reason, "backend flapping");
        assert_eq!(info.severity, DegradedSeverity::Moderate);

        assert!(degraded.deactivate("search").is_some());
        assert!(!degraded.is_active("search"));
        assert!(degraded.deactivate("search").is_none());
        assert!(degraded.active_modes().is_empty());
    }
}
