//! # Error Patterns
//!
//! An [`ErrorPattern`] describes a family of failures: how to recognise it
//! (message regexes, exception kinds, context key/values), how bad it is, and
//! which recovery strategies to try in order.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::incident::ErrorIncident;
use crate::types::{Error, ErrorCategory, Result, Severity};

/// Score contributed by any message regex matching
pub const MESSAGE_WEIGHT: f64 = 0.4;
/// Score contributed by an exact exception-kind match
pub const EXCEPTION_WEIGHT: f64 = 0.3;
/// Maximum score contributed by context matchers
pub const CONTEXT_WEIGHT: f64 = 0.3;

/// Recovery actions an incident can be resolved with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyKind {
    Retry,
    Fallback,
    Rollback,
    Reset,
    Escalate,
    CircuitBreak,
    GracefulDegrade,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 7] = [
        StrategyKind::Retry,
        StrategyKind::Fallback,
        StrategyKind::Rollback,
        StrategyKind::Reset,
        StrategyKind::Escalate,
        StrategyKind::CircuitBreak,
        StrategyKind::GracefulDegrade,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Retry => "RETRY",
            StrategyKind::Fallback => "FALLBACK",
            StrategyKind::Rollback => "ROLLBACK",
            StrategyKind::Reset => "RESET",
            StrategyKind::Escalate => "ESCALATE",
            StrategyKind::CircuitBreak => "CIRCUIT_BREAK",
            StrategyKind::GracefulDegrade => "GRACEFUL_DEGRADE",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_uppercase();
        StrategyKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| Error::Configuration(format!("unknown recovery strategy '{}'", s.trim())))
    }
}

/// A recognisable family of failures and how to recover from it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub id: String,
    pub description: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    /// Regexes tested against the incident message
    pub message_patterns: Vec<String>,
    /// Exact exception kinds, compared with `Error::kind_name`
    pub exception_types: Vec<String>,
    /// Context key/value pairs; each pair that matches adds a share of
    /// [`CONTEXT_WEIGHT`]
    pub context_matchers: BTreeMap<String, String>,
    /// Strategies to try, in order
    pub strategies: Vec<StrategyKind>,
    pub max_retries: u32,
    pub retry_delay_base: Duration,
    pub occurrence_count: u64,
    pub success_count: u64,
    pub auto_created: bool,
    pub created_at: DateTime<Utc>,
}

impl ErrorPattern {
    pub fn new<S: Into<String>>(id: S, category: ErrorCategory, severity: Severity) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            category,
            severity,
            message_patterns: Vec::new(),
            exception_types: Vec::new(),
            context_matchers: BTreeMap::new(),
            strategies: Vec::new(),
            max_retries: 3,
            retry_delay_base: Duration::from_secs(1),
            occurrence_count: 0,
            success_count: 0,
            auto_created: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_message_pattern<S: Into<String>>(mut self, pattern: S) -> Self {
        self.message_patterns.push(pattern.into());
        self
    }

    pub fn with_exception_type<S: Into<String>>(mut self, kind: S) -> Self {
        self.exception_types.push(kind.into());
        self
    }

    pub fn with_context<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.context_matchers.insert(key.into(), value.into());
        self
    }

    pub fn with_strategies(mut self, strategies: Vec<StrategyKind>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn with_retry(mut self, max_retries: u32, retry_delay_base: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_base = retry_delay_base;
        self
    }

    /// Fraction of occurrences that were resolved, `None` before the first
    pub fn success_rate(&self) -> Option<f64> {
        (self.occurrence_count > 0).then(|| self.success_count as f64 / self.occurrence_count as f64)
    }
}

/// A pattern with its message regexes compiled
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub pattern: ErrorPattern,
    regexes: Vec<Regex>,
}

impl CompiledPattern {
    /// Compiles the message regexes; an invalid regex is a configuration
    /// error
    pub fn compile(pattern: ErrorPattern) -> Result<Self> {
        let regexes = pattern
            .message_patterns
            .iter()
            .map(|raw| {
                Regex::new(raw).map_err(|e| {
                    Error::Configuration(format!("pattern '{}' has invalid regex '{}': {}", pattern.id, raw, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { pattern, regexes })
    }

    /// Confidence in `[0, 1]` that `incident` belongs to this pattern
    pub fn score(&self, incident: &ErrorIncident) -> f64 {
        let mut score = 0.0;

        if self.regexes.iter().any(|re| re.is_match(&incident.message)) {
            score += MESSAGE_WEIGHT;
        }

        if self.pattern.exception_types.iter().any(|kind| *kind == incident.error_kind) {
            score += EXCEPTION_WEIGHT;
        }

        let matchers = &self.pattern.context_matchers;
        if !matchers.is_empty() {
            let matched = matchers
                .iter()
                .filter(|(key, value)| incident.context.get(*key) == Some(*value))
                .count();
            score += CONTEXT_WEIGHT * matched as f64 / matchers.len() as f64;
        }

        score
    }
}

/// Patterns every coordinator starts with unless built with an explicit
/// library
pub fn builtin_patterns() -> Vec<ErrorPattern> {
    vec![
        ErrorPattern::new("network_connection", ErrorCategory::Network, Severity::Medium)
            .with_description("Connection refused, reset or unreachable")
            .with_message_pattern(r"(?i)connection (refused|reset|closed|aborted)|network (is )?unreachable|dns")
            .with_exception_type("ConnectionError")
            .with_exception_type("NetworkError")
            .with_strategies(vec![StrategyKind::Retry, StrategyKind::Fallback, StrategyKind::CircuitBreak])
            .with_retry(3, Duration::from_secs(1)),
        ErrorPattern::new("backend_timeout", ErrorCategory::Timeout, Severity::Medium)
            .with_description("Backend call exceeded its deadline")
            .with_message_pattern(r"(?i)timed? ?out|deadline exceeded")
            .with_exception_type("TimeoutError")
            .with_strategies(vec![StrategyKind::Retry, StrategyKind::Fallback])
            .with_retry(2, Duration::from_secs(2)),
        ErrorPattern::new("rate_limited", ErrorCategory::Resource, Severity::Medium)
            .with_description("Backend throttled the caller")
            .with_message_pattern(r"(?i)rate.?limit|too many requests|\b429\b")
            .with_exception_type("RateLimitError")
            .with_strategies(vec![StrategyKind::Retry, StrategyKind::CircuitBreak])
            .with_retry(3, Duration::from_secs(2)),
        ErrorPattern::new("authentication_failure", ErrorCategory::Authentication, Severity::High)
            .with_description("Credentials rejected")
            .with_message_pattern(r"(?i)unauthori[sz]ed|forbidden|invalid (api )?key|permission denied")
            .with_exception_type("AuthenticationError")
            .with_strategies(vec![StrategyKind::Fallback, StrategyKind::Escalate])
            .with_retry(0, Duration::from_secs(1)),
        ErrorPattern::new("resource_exhausted", ErrorCategory::Resource, Severity::High)
            .with_description("Memory, disk or quota exhausted")
            .with_message_pattern(r"(?i)out of memory|disk full|quota exceeded|resource exhausted")
            .with_exception_type("ResourceError")
            .with_strategies(vec![StrategyKind::GracefulDegrade, StrategyKind::Reset])
            .with_retry(1, Duration::from_secs(5)),
        ErrorPattern::new("output_validation", ErrorCategory::Validation, Severity::Low)
            .with_description("Output rejected by its validator")
            .with_message_pattern(r"(?i)failed validation|invalid format|malformed")
            .with_exception_type("ValidationError")
            .with_strategies(vec![StrategyKind::Retry, StrategyKind::Fallback])
            .with_retry(2, Duration::from_millis(500)),
        ErrorPattern::new("no_route", ErrorCategory::Backend, Severity::Medium)
            .with_description("No backend can serve the operation")
            .with_message_pattern(r"(?i)no backend")
            .with_exception_type("RoutingError")
            .with_strategies(vec![StrategyKind::Fallback, StrategyKind::GracefulDegrade])
            .with_retry(1, Duration::from_secs(1)),
        ErrorPattern::new("circuit_open", ErrorCategory::Backend, Severity::Medium)
            .with_description("Circuit breaker refused the call")
            .with_message_pattern(r"(?i)circuit open")
            .with_exception_type("CircuitOpenError")
            .with_strategies(vec![StrategyKind::Fallback, StrategyKind::GracefulDegrade])
            .with_retry(0, Duration::from_secs(1)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_kind_names() {
        assert_eq!("circuit_break".parse::<StrategyKind>().unwrap(), StrategyKind::CircuitBreak);
        assert_eq!(StrategyKind::GracefulDegrade.to_string(), "GRACEFUL_DEGRADE");
        assert!(matches!("teleport".parse::<StrategyKind>(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_score_components() {
        let pattern = ErrorPattern::new("p", ErrorCategory::Network, Severity::Medium)
            .with_message_pattern("(?i)refused")
            .with_exception_type("ConnectionError")
            .with_context("operation", "fetch")
            .with_context("region", "eu");
        let compiled = CompiledPattern::compile(pattern).unwrap();

        let mut incident = ErrorIncident::new("Connection REFUSED by peer", "ConnectionError");
        incident.context.insert("operation".into(), "fetch".into());
        assert!((compiled.score(&incident) - 0.85).abs() < 1e-9);

        let other = ErrorIncident::new("disk full", "IoError");
        assert_eq!(compiled.score(&other), 0.0);
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        let pattern = ErrorPattern::new("bad", ErrorCategory::System, Severity::Low).with_message_pattern("(unclosed");
        assert!(matches!(CompiledPattern::compile(pattern), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_builtin_patterns_compile() {
        for pattern in builtin_patterns() {
            assert!(!pattern.strategies.is_empty(), "{}", pattern.id);
            CompiledPattern::compile(pattern).unwrap();
        }
    }
}
