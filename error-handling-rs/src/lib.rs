//! # Error Handling Framework
//!
//! Failure handling for the task-graph execution core: the shared error
//! taxonomy, structured logging, circuit breakers, and the
//! classify-then-recover pipeline for incidents.
//!
//! ## Features
//!
//! - Standardized error types with stable kind names
//! - Structured logging with run-scoped spans
//! - Circuit breakers keyed by resource name
//! - Error pattern library with auto-created patterns
//! - Recovery coordinator with pluggable, success-ranked strategies
//! - Degraded mode registry
//!

pub mod circuit_breaker;
pub mod classifier;
pub mod degraded;
pub mod incident;
pub mod logging;
pub mod pattern;
pub mod recovery;
pub mod retry;
pub mod types;

// Re-export commonly used types
pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use classifier::{ClassifierConfig, ErrorClassifier, PatternStats};
pub use degraded::{DegradedMode, DegradedSeverity};
pub use incident::{Classification, EscalationRecord, ErrorIncident, IncidentStatus, RecoveryAttempt};
pub use logging::{init_logging, log_incident, run_span, LoggingConfig};
pub use pattern::{ErrorPattern, StrategyKind};
pub use recovery::{
    RecoverableOperation, RecoveryConfig, RecoveryCoordinator, RecoveryOutcome, RecoveryStrategy, StrategyStats,
};
pub use retry::{sleep_or_cancel, Backoff};
pub use types::{Error, ErrorCategory, Result, Severity};
pub use tokio_util::sync::CancellationToken;

/// Initializes logging from the default settings sources
pub fn init() -> Result<()> {
    init_with_config(config_rs::load_default_settings()?)
}

/// Initializes logging from the `logging.*` section of `config`
pub fn init_with_config(config: config::Config) -> Result<()> {
    let log_config = LoggingConfig::try_from(config)?;
    init_logging(Some(log_config))
}
