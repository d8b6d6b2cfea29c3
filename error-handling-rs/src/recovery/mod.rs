//! # Recovery Coordinator
//!
//! Drives one incident through
//! `detected -> analyzing -> recovering -> resolved | failed -> escalated`.
//!
//! Strategies come from the classification, ranked by their historical
//! success rate, and run in order until one succeeds. Exhaustion never
//! raises: the caller gets a [`RecoveryOutcome`] carrying
//! `Error::RecoveryExhausted`.

pub mod strategies;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::classifier::{ClassifierConfig, ErrorClassifier, PatternStats};
use crate::degraded::DegradedMode;
use crate::incident::{EscalationRecord, ErrorIncident, IncidentStatus, RecoveryAttempt};
use crate::logging::log_incident;
use crate::pattern::{ErrorPattern, StrategyKind};
use crate::types::{Error, ErrorCategory, Result};

pub use strategies::{
    default_strategies, RecoverableOperation, RecoveryStrategy, StrategyContext, StrategyOutcome,
    CHECKPOINT_KEY, COMPONENT_KEY, FEATURE_KEY,
};

/// Success rate assumed for a strategy that has never run
pub const DEFAULT_SUCCESS_RATE: f64 = 0.5;

/// Recovery coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub confidence_floor: f64,
    pub auto_create_patterns: bool,
    /// Incidents kept in history
    pub history_capacity: usize,
    /// Retry budget for auto-created patterns
    pub default_max_retries: u32,
    pub default_base_delay: Duration,
    /// Wait after RESET before reporting success
    pub reset_settle_delay: Duration,
    /// Cap on any single retry delay
    pub max_delay: Duration,
    /// Escalation records kept
    pub escalation_capacity: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.3,
            auto_create_patterns: true,
            history_capacity: 1000,
            default_max_retries: 3,
            default_base_delay: Duration::from_secs(1),
            reset_settle_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            escalation_capacity: 100,
        }
    }
}

impl RecoveryConfig {
    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig {
            confidence_floor: self.confidence_floor,
            auto_create_patterns: self.auto_create_patterns,
            default_max_retries: self.default_max_retries,
            default_base_delay: self.default_base_delay,
        }
    }
}

impl TryFrom<config::Config> for RecoveryConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        let mut base = RecoveryConfig::default();

        if let Ok(floor) = cfg.get::<f64>("recovery.confidence_floor") {
            if !(0.0..=1.0).contains(&floor) {
                return Err(config::ConfigError::Message(format!(
                    "recovery.confidence_floor must be within [0, 1], got {}",
                    floor
                )));
            }
            base.confidence_floor = floor;
        }
        if let Ok(auto) = cfg.get::<bool>("recovery.auto_create_patterns") {
            base.auto_create_patterns = auto;
        }
        if let Ok(capacity) = cfg.get::<usize>("recovery.history_capacity") {
            base.history_capacity = capacity.max(1);
        }
        if let Ok(retries) = cfg.get::<u32>("recovery.default_max_retries") {
            base.default_max_retries = retries;
        }
        if let Some(delay) = config_rs::get_duration_ms(&cfg, "recovery.default_base_delay_ms") {
            base.default_base_delay = delay;
        }
        if let Some(delay) = config_rs::get_duration_ms(&cfg, "recovery.reset_settle_delay_ms") {
            base.reset_settle_delay = delay;
        }
        if let Some(delay) = config_rs::get_duration_ms(&cfg, "recovery.max_delay_ms") {
            base.max_delay = delay;
        }
        if let Ok(capacity) = cfg.get::<usize>("recovery.escalation_capacity") {
            base.escalation_capacity = capacity.max(1);
        }

        Ok(base)
    }
}

/// Effectiveness history of one strategy kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyStats {
    pub strategy: StrategyKind,
    pub attempts: u64,
    pub successes: u64,
    pub success_rate: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct StrategyCounter {
    attempts: u64,
    successes: u64,
}

impl StrategyCounter {
    fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            DEFAULT_SUCCESS_RATE
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

/// What the caller gets back from [`RecoveryCoordinator::handle_error`]
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    /// The closed incident, as stored in history
    pub incident: ErrorIncident,
    /// Output produced by a RETRY or FALLBACK that recovered the operation
    pub output: Option<String>,
    /// Set when the incident was not resolved
    pub error: Option<Error>,
}

impl RecoveryOutcome {
    pub fn is_resolved(&self) -> bool {
        self.incident.status == IncidentStatus::Resolved
    }

    pub fn is_escalated(&self) -> bool {
        self.incident.status == IncidentStatus::Escalated
    }
}

/// Classifies incidents and runs recovery strategies against them
pub struct RecoveryCoordinator {
    config: RecoveryConfig,
    classifier: ErrorClassifier,
    strategies: RwLock<HashMap<StrategyKind, Arc<dyn RecoveryStrategy>>>,
    strategy_stats: Mutex<HashMap<StrategyKind, StrategyCounter>>,
    breakers: Arc<CircuitBreakerRegistry>,
    degraded: Arc<DegradedMode>,
    history: Mutex<VecDeque<ErrorIncident>>,
    escalations: Mutex<VecDeque<EscalationRecord>>,
}

impl std::fmt::Debug for RecoveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryCoordinator")
            .field("config", &self.config)
            .field("patterns", &self.classifier.pattern_count())
            .finish()
    }
}

impl RecoveryCoordinator {
    /// Coordinator with the builtin pattern library and default strategies
    pub fn new(config: RecoveryConfig) -> Self {
        let classifier = ErrorClassifier::new(config.classifier_config());
        Self::with_classifier(config, classifier)
    }

    /// Coordinator with exactly the given pattern library
    pub fn with_patterns(config: RecoveryConfig, patterns: Vec<ErrorPattern>) -> Result<Self> {
        let classifier = ErrorClassifier::with_patterns(config.classifier_config(), patterns)?;
        Ok(Self::with_classifier(config, classifier))
    }

    fn with_classifier(config: RecoveryConfig, classifier: ErrorClassifier) -> Self {
        let strategies = default_strategies()
            .into_iter()
            .map(|strategy| (strategy.kind(), strategy))
            .collect();

        Self {
            config,
            classifier,
            strategies: RwLock::new(strategies),
            strategy_stats: Mutex::new(HashMap::new()),
            breakers: Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            degraded: Arc::new(DegradedMode::new()),
            history: Mutex::new(VecDeque::new()),
            escalations: Mutex::new(VecDeque::new()),
        }
    }

    /// Shares an existing breaker registry (for example the one the host
    /// consults before calling a resource)
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_degraded_mode(mut self, degraded: Arc<DegradedMode>) -> Self {
        self.degraded = degraded;
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn degraded(&self) -> &Arc<DegradedMode> {
        &self.degraded
    }

    /// Adds or replaces the implementation for `strategy.kind()`
    pub fn register_strategy(&self, strategy: Arc<dyn RecoveryStrategy>) {
        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(strategy.kind(), strategy);
    }

    /// Removes an implementation; dispatching to the kind then fails
    pub fn unregister_strategy(&self, kind: StrategyKind) -> bool {
        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind)
            .is_some()
    }

    /// Classifies `incident` and runs recovery against it.
    ///
    /// `operation` supplies the retry/fallback/rollback hooks; strategies
    /// that need it fail without one. `cancel` interrupts retry delays.
    pub async fn handle_error(
        &self,
        mut incident: ErrorIncident,
        operation: Option<&dyn RecoverableOperation>,
        cancel: Option<&CancellationToken>,
    ) -> RecoveryOutcome {
        let started = Instant::now();
        incident.status = IncidentStatus::Analyzing;

        let classification = match self.classifier.classify_or_create(&incident) {
            Ok(classification) => classification,
            Err(e) => {
                error!(incident_id = %incident.id, error = %e, "Incident classification failed");
                incident.status = IncidentStatus::Failed;
                return self.close(incident, None, Some(e), started);
            }
        };
        incident.classification = Some(classification.clone());
        incident.status = IncidentStatus::Recovering;

        let ranked = self.rank_strategies(&classification.strategies);
        info!(
            incident_id = %incident.id,
            pattern_id = ?classification.pattern_id,
            category = %classification.category,
            severity = %classification.severity,
            strategies = ?ranked,
            "Recovering incident"
        );

        let mut output = None;
        let mut cancelled = false;

        for kind in ranked {
            let attempt_started = Instant::now();
            let result = {
                let ctx = StrategyContext {
                    incident: &incident,
                    classification: &classification,
                    operation,
                    breakers: &self.breakers,
                    degraded: &self.degraded,
                    config: &self.config,
                    cancel,
                };
                self.dispatch(kind, &ctx).await
            };

            let success = result.is_ok();
            let detail = match &result {
                Ok(outcome) => outcome.detail().to_string(),
                Err(e) => e.to_string(),
            };
            self.record_strategy(kind, success);
            incident.attempts.push(RecoveryAttempt {
                strategy: kind,
                success,
                detail,
                duration_ms: attempt_started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            });

            match result {
                Ok(StrategyOutcome::Recovered { output: recovered, .. }) => {
                    incident.status = IncidentStatus::Resolved;
                    output = recovered;
                    break;
                }
                Ok(StrategyOutcome::Escalated { .. }) => {
                    incident.status = IncidentStatus::Escalated;
                    self.escalate(&incident, false);
                    break;
                }
                Err(Error::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    warn!(incident_id = %incident.id, strategy = %kind, error = %e, "Recovery strategy failed");
                }
            }
        }

        let error = if cancelled {
            incident.status = IncidentStatus::Failed;
            Some(Error::Cancelled)
        } else if incident.status == IncidentStatus::Recovering {
            incident.status = IncidentStatus::Failed;
            if classification.severity.requires_escalation() {
                incident.status = IncidentStatus::Escalated;
                self.escalate(&incident, true);
            }
            Some(Error::RecoveryExhausted {
                incident_id: incident.id.clone(),
                attempts: incident.attempts.len(),
            })
        } else {
            None
        };

        self.classifier.record_outcome(
            &classification.matched_pattern_ids,
            incident.status == IncidentStatus::Resolved,
        );

        self.close(incident, output, error, started)
    }

    async fn dispatch(&self, kind: StrategyKind, ctx: &StrategyContext<'_>) -> Result<StrategyOutcome> {
        let strategy = self
            .strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned();

        match strategy {
            Some(strategy) => strategy.execute(ctx).await,
            None => {
                error!(strategy = %kind, "No implementation registered for recovery strategy");
                Err(Error::Configuration(format!("no implementation registered for {}", kind)))
            }
        }
    }

    /// Stable sort by historical success rate, best first
    fn rank_strategies(&self, strategies: &[StrategyKind]) -> Vec<StrategyKind> {
        let stats = self.strategy_stats.lock().unwrap_or_else(PoisonError::into_inner);
        let rate = |kind: &StrategyKind| {
            stats
                .get(kind)
                .map(StrategyCounter::success_rate)
                .unwrap_or(DEFAULT_SUCCESS_RATE)
        };

        let mut ranked = strategies.to_vec();
        ranked.sort_by(|a, b| rate(b).partial_cmp(&rate(a)).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }

    fn record_strategy(&self, kind: StrategyKind, success: bool) {
        let mut stats = self.strategy_stats.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = stats.entry(kind).or_default();
        counter.attempts += 1;
        if success {
            counter.successes += 1;
        }
        counter!(
            "recovery.strategy.attempts",
            1,
            "strategy" => kind.to_string(),
            "success" => success.to_string()
        );
    }

    fn escalate(&self, incident: &ErrorIncident, after_exhaustion: bool) {
        let record = EscalationRecord::for_incident(incident, after_exhaustion);
        error!(
            incident_id = %record.incident_id,
            pattern_id = ?record.pattern_id,
            severity = %record.severity,
            attempts = ?record.attempts,
            after_exhaustion = record.after_exhaustion,
            message = %record.message,
            "Incident escalated"
        );
        counter!("recovery.escalations", 1, "severity" => record.severity.to_string());

        let mut escalations = self.escalations.lock().unwrap_or_else(PoisonError::into_inner);
        if escalations.len() >= self.config.escalation_capacity {
            escalations.pop_front();
        }
        escalations.push_back(record);
    }

    fn close(
        &self,
        mut incident: ErrorIncident,
        output: Option<String>,
        error: Option<Error>,
        started: Instant,
    ) -> RecoveryOutcome {
        incident.closed_at = Some(Utc::now());
        log_incident(&incident);

        counter!("recovery.incidents", 1, "status" => incident.status.to_string());
        histogram!("recovery.duration_ms", started.elapsed().as_millis() as f64);

        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if history.len() >= self.config.history_capacity {
            history.pop_front();
        }
        history.push_back(incident.clone());

        RecoveryOutcome { incident, output, error }
    }

    /// Most recent incidents, newest last
    pub fn recent_incidents(&self, n: usize) -> Vec<ErrorIncident> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.iter().skip(history.len().saturating_sub(n)).cloned().collect()
    }

    pub fn incident_count(&self) -> usize {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn incident_counts_by_category(&self) -> HashMap<ErrorCategory, usize> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let mut counts = HashMap::new();
        for category in history.iter().filter_map(ErrorIncident::category) {
            *counts.entry(category).or_insert(0) += 1;
        }
        counts
    }

    pub fn escalations(&self) -> Vec<EscalationRecord> {
        self.escalations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn pattern_stats(&self) -> Vec<PatternStats> {
        self.classifier.pattern_stats()
    }

    /// Stats for every strategy that has run, in declaration order
    pub fn strategy_stats(&self) -> Vec<StrategyStats> {
        let stats = self.strategy_stats.lock().unwrap_or_else(PoisonError::into_inner);
        StrategyKind::ALL
            .iter()
            .filter_map(|kind| {
                stats.get(kind).map(|counter| StrategyStats {
                    strategy: *kind,
                    attempts: counter.attempts,
                    successes: counter.successes,
                    success_rate: counter.success_rate(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests;
