//! Tests for incident recovery
//!
//! These tests drive the coordinator with small recoverable operations and
//! check the resulting incident states, statistics and escalations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::circuit_breaker::CircuitState;
use crate::types::Severity;

/// Fails every retry until `succeed_on` calls have been made
struct FlakyOperation {
    calls: AtomicUsize,
    succeed_on: Option<usize>,
    fallbacks: Vec<String>,
}

impl FlakyOperation {
    fn always_fails() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            succeed_on: None,
            fallbacks: Vec::new(),
        }
    }

    fn succeeds_on(call: usize) -> Self {
        Self {
            succeed_on: Some(call),
            ..Self::always_fails()
        }
    }

    fn with_fallbacks(mut self, fallbacks: &[&str]) -> Self {
        self.fallbacks = fallbacks.iter().map(|s| s.to_string()).collect();
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecoverableOperation for FlakyOperation {
    async fn retry(&self) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.succeed_on {
            Some(n) if call >= n => Ok(format!("ok after {}", call)),
            _ => Err(Error::backend("flaky", "BackendError", "still failing")),
        }
    }

    fn fallback_options(&self) -> Vec<String> {
        self.fallbacks.clone()
    }

    async fn run_fallback(&self, option: &str) -> Result<String> {
        if option.starts_with("good") {
            Ok(format!("served by {}", option))
        } else {
            Err(Error::backend(option, "BackendError", "fallback down"))
        }
    }
}

fn pattern(id: &str, severity: Severity, strategies: Vec<StrategyKind>) -> ErrorPattern {
    ErrorPattern::new(id, ErrorCategory::Backend, severity)
        .with_message_pattern("upstream returned")
        .with_exception_type("BackendError")
        .with_strategies(strategies)
        .with_retry(2, Duration::from_secs(1))
}

fn coordinator(patterns: Vec<ErrorPattern>) -> RecoveryCoordinator {
    RecoveryCoordinator::with_patterns(RecoveryConfig::default(), patterns).unwrap()
}

fn backend_incident() -> ErrorIncident {
    ErrorIncident::from_error(&Error::backend("llm", "BackendError", "upstream returned 502"))
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_makes_exactly_max_retries_calls() {
    let coordinator = coordinator(vec![pattern("flaky", Severity::Medium, vec![StrategyKind::Retry])]);
    let operation = FlakyOperation::always_fails();

    let started = Instant::now();
    let outcome = coordinator.handle_error(backend_incident(), Some(&operation), None).await;

    assert_eq!(operation.calls(), 2);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(outcome.incident.status, IncidentStatus::Failed);
    assert!(matches!(
        outcome.error,
        Some(Error::RecoveryExhausted { attempts: 1, .. })
    ));
    assert!(outcome.output.is_none());
    assert!(coordinator.escalations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_and_updates_stats() {
    let coordinator = coordinator(vec![pattern("flaky", Severity::Medium, vec![StrategyKind::Retry])]);
    let operation = FlakyOperation::succeeds_on(2);

    let outcome = coordinator.handle_error(backend_incident(), Some(&operation), None).await;

    assert!(outcome.is_resolved());
    assert_eq!(outcome.output.as_deref(), Some("ok after 2"));
    assert!(outcome.error.is_none());

    let stats = coordinator.pattern_stats();
    assert_eq!(stats[0].occurrences, 1);
    assert_eq!(stats[0].successes, 1);

    let strategy = &coordinator.strategy_stats()[0];
    assert_eq!(strategy.strategy, StrategyKind::Retry);
    assert_eq!(strategy.success_rate, 1.0);
}

#[tokio::test(start_paused = true)]
async fn test_high_severity_exhaustion_escalates() {
    let coordinator = coordinator(vec![pattern("fatal", Severity::High, vec![StrategyKind::Retry])]);
    let operation = FlakyOperation::always_fails();

    let outcome = coordinator.handle_error(backend_incident(), Some(&operation), None).await;

    assert!(outcome.is_escalated());
    assert!(matches!(outcome.error, Some(Error::RecoveryExhausted { .. })));

    let escalations = coordinator.escalations();
    assert_eq!(escalations.len(), 1);
    assert!(escalations[0].after_exhaustion);
    assert_eq!(escalations[0].pattern_id.as_deref(), Some("fatal"));
    assert_eq!(escalations[0].attempts, vec![StrategyKind::Retry]);
}

#[tokio::test]
async fn test_escalate_strategy_is_terminal_but_not_resolved() {
    let coordinator = coordinator(vec![pattern("esc", Severity::Medium, vec![StrategyKind::Escalate])]);

    let outcome = coordinator.handle_error(backend_incident(), None, None).await;

    assert_eq!(outcome.incident.status, IncidentStatus::Escalated);
    assert!(outcome.error.is_none());
    assert!(!coordinator.escalations()[0].after_exhaustion);

    let stats = coordinator.pattern_stats();
    assert_eq!(stats[0].occurrences, 1);
    assert_eq!(stats[0].successes, 0);
}

#[tokio::test]
async fn test_strategies_reranked_by_success_rate() {
    let coordinator = coordinator(vec![pattern(
        "p",
        Severity::Medium,
        vec![StrategyKind::Rollback, StrategyKind::Fallback],
    )]);
    let operation = FlakyOperation::always_fails().with_fallbacks(&["bad-mirror", "good-mirror"]);

    let first = coordinator.handle_error(backend_incident(), Some(&operation), None).await;
    let order: Vec<StrategyKind> = first.incident.attempts.iter().map(|a| a.strategy).collect();
    assert_eq!(order, vec![StrategyKind::Rollback, StrategyKind::Fallback]);
    assert!(!first.incident.attempts[0].success);
    assert_eq!(first.output.as_deref(), Some("served by good-mirror"));

    let second = coordinator.handle_error(backend_incident(), Some(&operation), None).await;
    assert_eq!(second.incident.attempts.len(), 1);
    assert_eq!(second.incident.attempts[0].strategy, StrategyKind::Fallback);
    assert!(second.is_resolved());
}

#[tokio::test]
async fn test_rollback_uses_checkpoint_from_context() {
    let coordinator = coordinator(vec![pattern("p", Severity::Medium, vec![StrategyKind::Rollback])]);
    let incident = backend_incident().with_context(CHECKPOINT_KEY, "ckpt-7");

    let outcome = coordinator.handle_error(incident, None, None).await;
    assert!(outcome.is_resolved());
    assert!(outcome.incident.attempts[0].detail.contains("ckpt-7"));
}

#[tokio::test]
async fn test_unregistered_strategy_counts_as_failure() {
    let coordinator = coordinator(vec![pattern("p", Severity::Medium, vec![StrategyKind::GracefulDegrade])]);
    assert!(coordinator.unregister_strategy(StrategyKind::GracefulDegrade));

    let outcome = coordinator.handle_error(backend_incident(), None, None).await;
    assert_eq!(outcome.incident.status, IncidentStatus::Failed);
    assert!(!outcome.incident.attempts[0].success);
    assert_eq!(coordinator.strategy_stats()[0].attempts, 1);
}

#[tokio::test]
async fn test_registered_strategy_replaces_default() {
    struct AlwaysRecovers;

    #[async_trait]
    impl RecoveryStrategy for AlwaysRecovers {
        fn kind(&self) -> StrategyKind {
            StrategyKind::Reset
        }

        async fn execute(&self, _ctx: &StrategyContext<'_>) -> Result<StrategyOutcome> {
            Ok(StrategyOutcome::Recovered {
                detail: "custom".to_string(),
                output: Some("fresh".to_string()),
            })
        }
    }

    let coordinator = coordinator(vec![pattern("p", Severity::Medium, vec![StrategyKind::Reset])]);
    coordinator.register_strategy(Arc::new(AlwaysRecovers));

    let outcome = coordinator.handle_error(backend_incident(), None, None).await;
    assert_eq!(outcome.output.as_deref(), Some("fresh"));
}

#[tokio::test]
async fn test_circuit_break_and_degrade() {
    let coordinator = coordinator(vec![pattern("p", Severity::Medium, vec![StrategyKind::CircuitBreak])]);
    let outcome = coordinator
        .handle_error(backend_incident().with_resource("llm"), None, None)
        .await;
    assert!(outcome.is_resolved());
    assert_eq!(coordinator.breakers().get_or_create("llm").failure_count(), 1);

    let coordinator = self::coordinator(vec![pattern("p", Severity::High, vec![StrategyKind::GracefulDegrade])]);
    let outcome = coordinator
        .handle_error(backend_incident().with_context(FEATURE_KEY, "summaries"), None, None)
        .await;
    assert!(outcome.is_resolved());
    assert!(coordinator.degraded().is_active("summaries"));
}

#[tokio::test]
async fn test_retry_refused_by_open_breaker() {
    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: 1,
        timeout_window: Duration::from_secs(60),
    }));
    breakers.get_or_create("llm").record_failure();
    assert_eq!(breakers.get_or_create("llm").state(), CircuitState::Open);

    let coordinator = RecoveryCoordinator::with_patterns(
        RecoveryConfig::default(),
        vec![pattern("p", Severity::Medium, vec![StrategyKind::Retry]).with_retry(2, Duration::from_millis(1))],
    )
    .unwrap()
    .with_breakers(breakers);

    let operation = FlakyOperation::succeeds_on(1);
    let outcome = coordinator
        .handle_error(backend_incident().with_resource("llm"), Some(&operation), None)
        .await;

    assert_eq!(operation.calls(), 0);
    assert_eq!(outcome.incident.status, IncidentStatus::Failed);
    assert!(outcome.incident.attempts[0].detail.contains("circuit open"));
}

#[tokio::test]
async fn test_cancellation_interrupts_retry_delay() {
    let coordinator = coordinator(vec![pattern("p", Severity::High, vec![StrategyKind::Retry])]);
    let operation = FlakyOperation::succeeds_on(1);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = coordinator
        .handle_error(backend_incident(), Some(&operation), Some(&cancel))
        .await;

    assert_eq!(outcome.error, Some(Error::Cancelled));
    assert_eq!(outcome.incident.status, IncidentStatus::Failed);
    assert_eq!(operation.calls(), 0);
    assert!(coordinator.escalations().is_empty());
}

#[tokio::test]
async fn test_unmatched_incident_gets_auto_pattern() {
    let coordinator = RecoveryCoordinator::new(RecoveryConfig::default());
    let before = coordinator.classifier().pattern_count();

    let incident = ErrorIncident::new("gremlins chewed through the widget cache", "WidgetError");
    let outcome = coordinator.handle_error(incident, None, None).await;

    let classification = outcome.incident.classification.clone().unwrap();
    assert!(classification.auto_created);
    assert_eq!(classification.category, ErrorCategory::System);
    assert_eq!(classification.strategies, vec![StrategyKind::Retry, StrategyKind::Fallback]);
    assert_eq!(coordinator.classifier().pattern_count(), before + 1);
    assert_eq!(outcome.incident.status, IncidentStatus::Failed);
}

#[tokio::test]
async fn test_history_is_bounded() {
    let config = RecoveryConfig {
        history_capacity: 2,
        ..RecoveryConfig::default()
    };
    let coordinator = RecoveryCoordinator::with_patterns(
        config,
        vec![pattern("esc", Severity::Low, vec![StrategyKind::Escalate])],
    )
    .unwrap();

    for i in 0..3 {
        let incident = backend_incident().with_context("n", i.to_string());
        coordinator.handle_error(incident, None, None).await;
    }

    assert_eq!(coordinator.incident_count(), 2);
    let recent = coordinator.recent_incidents(1);
    assert_eq!(recent[0].context.get("n").map(String::as_str), Some("2"));
    assert_eq!(coordinator.incident_counts_by_category().get(&ErrorCategory::Backend), Some(&2));
}

#[test]
fn test_recovery_config_from_config() {
    let cfg = config::Config::builder()
        .set_override("recovery.confidence_floor", 0.5)
        .unwrap()
        .set_override("recovery.reset_settle_delay_ms", 10)
        .unwrap()
        .build()
        .unwrap();

    let recovery = RecoveryConfig::try_from(cfg).unwrap();
    assert_eq!(recovery.confidence_floor, 0.5);
    assert_eq!(recovery.reset_settle_delay, Duration::from_millis(10));
    assert_eq!(recovery.history_capacity, 1000);

    let bad = config::Config::builder()
        .set_override("recovery.confidence_floor", 1.5)
        .unwrap()
        .build()
        .unwrap();
    assert!(RecoveryConfig::try_from(bad).is_err());
}
