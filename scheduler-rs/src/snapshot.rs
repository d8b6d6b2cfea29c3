//! JSON snapshot of scheduler state for external reporting tools.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use backend_registry::BackendHealth;
use error_handling_rs::{BreakerSnapshot, ErrorIncident, Result};

use crate::unit::WorkUnit;

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub units: Vec<WorkUnit>,
    pub backends: Vec<BackendHealth>,
    pub breakers: Vec<BreakerSnapshot>,
    pub incidents: Vec<ErrorIncident>,
    pub timestamp: DateTime<Utc>,
}

impl Snapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Writes the pretty-printed JSON to `path`, replacing any existing file
    pub async fn write_to(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        tokio::fs::write(path, json).await?;
        tracing::debug!(path = %path.display(), "Snapshot written");
        Ok(())
    }
}
