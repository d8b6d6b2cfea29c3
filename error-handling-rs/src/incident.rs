//! Incident records produced by the recovery coordinator.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pattern::StrategyKind;
use crate::types::{Error, ErrorCategory, Severity};

/// Lifecycle of one incident:
/// `Detected -> Analyzing -> Recovering -> Resolved | Failed | Escalated`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Detected,
    Analyzing,
    Recovering,
    Resolved,
    Failed,
    Escalated,
}

impl IncidentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IncidentStatus::Resolved | IncidentStatus::Failed | IncidentStatus::Escalated
        )
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IncidentStatus::Detected => "detected",
            IncidentStatus::Analyzing => "analyzing",
            IncidentStatus::Recovering => "recovering",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Failed => "failed",
            IncidentStatus::Escalated => "escalated",
        };
        f.write_str(name)
    }
}

/// Result of matching an incident against the pattern library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Highest-scoring pattern, `None` when nothing matched and no pattern
    /// was created
    pub pattern_id: Option<String>,
    /// Every pattern that cleared the confidence floor, best first
    pub matched_pattern_ids: Vec<String>,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub confidence: f64,
    /// Strategies gathered from all matched patterns, de-duplicated
    pub strategies: Vec<StrategyKind>,
    pub max_retries: u32,
    pub retry_delay_base: Duration,
    pub auto_created: bool,
}

/// One strategy execution against an incident
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub strategy: StrategyKind,
    pub success: bool,
    pub detail: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// One failure occurrence and everything done about it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorIncident {
    pub id: String,
    pub message: String,
    /// Stable failure kind, see `Error::kind_name`
    pub error_kind: String,
    pub stack_context: Option<String>,
    pub context: BTreeMap<String, String>,
    /// Circuit breaker name guarding the failing resource
    pub resource_id: Option<String>,
    pub classification: Option<Classification>,
    pub attempts: Vec<RecoveryAttempt>,
    pub status: IncidentStatus,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl ErrorIncident {
    pub fn new<M: Into<String>, K: Into<String>>(message: M, error_kind: K) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message: message.into(),
            error_kind: error_kind.into(),
            stack_context: None,
            context: BTreeMap::new(),
            resource_id: None,
            classification: None,
            attempts: Vec::new(),
            status: IncidentStatus::Detected,
            created_at: Utc::now(),
            closed_at: None,
        }
    }

    /// Incident for a raised error, using its display text and kind name
    pub fn from_error(error: &Error) -> Self {
        Self::new(error.to_string(), error.kind_name())
    }

    pub fn with_context<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_resource<S: Into<String>>(mut self, resource_id: S) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_stack_context<S: Into<String>>(mut self, stack: S) -> Self {
        self.stack_context = Some(stack.into());
        self
    }

    pub fn category(&self) -> Option<ErrorCategory> {
        self.classification.as_ref().map(|c| c.category)
    }

    pub fn severity(&self) -> Severity {
        self.classification.as_ref().map(|c| c.severity).unwrap_or_default()
    }
}

/// Structured record emitted when an incident is escalated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub incident_id: String,
    pub pattern_id: Option<String>,
    pub category: Option<ErrorCategory>,
    pub severity: Severity,
    pub message: String,
    pub attempts: Vec<StrategyKind>,
    /// `true` when escalation followed exhaustion rather than an explicit
    /// ESCALATE strategy
    pub after_exhaustion: bool,
    pub timestamp: DateTime<Utc>,
}

impl EscalationRecord {
    pub fn for_incident(incident: &ErrorIncident, after_exhaustion: bool) -> Self {
        Self {
            incident_id: incident.id.clone(),
            pattern_id: incident.classification.as_ref().and_then(|c| c.pattern_id.clone()),
            category: incident.category(),
            severity: incident.severity(),
            message: incident.message.clone(),
            attempts: incident.attempts.iter().map(|a| a.strategy).collect(),
            after_exhaustion,
            timestamp: Utc::now(),
        }
    }
}
