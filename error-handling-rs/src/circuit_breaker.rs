//! # Circuit Breaker
//!
//! Per-resource failure gate with the standard three states.
//!
//! - `Closed`: calls allowed, consecutive failures counted
//! - `Open`: calls refused until the timeout window has elapsed since the
//!   last failure
//! - `HalfOpen`: trial calls allowed; the next success closes the circuit,
//!   the next failure reopens it
//!
//! Breakers are shared across concurrent runs, so all state sits behind a
//! mutex. Time is read from `tokio::time::Instant` so paused-clock tests can
//! drive the timeout window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Failing, requests blocked
    Open,
    /// Testing recovery, trial requests allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF-OPEN"),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Time to keep the circuit open after the last failure
    pub timeout_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_window: Duration::from_secs(60),
        }
    }
}

impl TryFrom<config::Config> for CircuitBreakerConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        let mut base = CircuitBreakerConfig::default();

        if let Ok(threshold) = cfg.get::<u32>("circuit_breaker.failure_threshold") {
            base.failure_threshold = threshold.max(1);
        }
        if let Some(window) = config_rs::get_duration_ms(&cfg, "circuit_breaker.timeout_window_ms") {
            base.timeout_window = window;
        }

        Ok(base)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    times_opened: u64,
}

/// Serializable view of one breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub timeout_window_ms: u64,
    pub last_failure: Option<DateTime<Utc>>,
    pub times_opened: u64,
}

/// Failure gate for a single named resource
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed circuit breaker
    pub fn new<S: Into<String>>(name: S, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                last_failure_at: None,
                times_opened: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns true if a call may proceed.
    ///
    /// An open circuit whose timeout window has elapsed since the last
    /// failure moves to half-open and allows the call.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner.last_failure.map(|at| at.elapsed());
                match elapsed {
                    Some(elapsed) if elapsed <= self.config.timeout_window => {
                        debug!(
                            circuit = %self.name,
                            remaining_ms = %(self.config.timeout_window - elapsed).as_millis(),
                            "Circuit open, request rejected"
                        );
                        false
                    }
                    _ => {
                        inner.state = CircuitState::HalfOpen;
                        info!(circuit = %self.name, "Circuit transitioned OPEN -> HALF-OPEN");
                        counter!("circuit_breaker.half_open", 1, "circuit" => self.name.clone());
                        true
                    }
                }
            }
        }
    }

    /// Records a successful call: clears the failure counter and closes
    /// the circuit.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if inner.state != CircuitState::Closed {
            info!(circuit = %self.name, previous = %inner.state, "Circuit closed after success");
            counter!("circuit_breaker.closed", 1, "circuit" => self.name.clone());
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
    }

    /// Records a failed call; opens the circuit once the threshold is
    /// reached, or immediately when half-open.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());

        let should_open = match inner.state {
            CircuitState::Closed => inner.failure_count >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if should_open {
            warn!(
                circuit = %self.name,
                failures = inner.failure_count,
                threshold = self.config.failure_threshold,
                previous = %inner.state,
                "Circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.times_opened += 1;
            counter!("circuit_breaker.opened", 1, "circuit" => self.name.clone());
        }
    }

    /// Forces the circuit back to closed (admin/test use)
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        info!(circuit = %self.name, "Circuit manually reset");
    }

    /// Current state without triggering the open -> half-open check
    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).failure_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            timeout_window_ms: self.config.timeout_window.as_millis() as u64,
            last_failure: inner.last_failure_at,
            times_opened: inner.times_opened,
        }
    }
}

/// Named breakers created on demand with a shared default configuration
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the breaker for `name`, creating it with the default
    /// configuration if needed
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.get(name) {
            return breaker;
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.default_config.clone())))
            .clone()
    }

    /// Registers a breaker with a custom configuration, replacing any
    /// existing breaker of the same name
    pub fn register(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(name, config));
        self.breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), breaker.clone());
        breaker
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Resets the named breaker; returns false if it doesn't exist
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Snapshots of every breaker, sorted by name
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        let mut snapshots: Vec<BreakerSnapshot> = breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                timeout_window: timeout,
            },
        )
    }

    #[test]
    fn test_initial_state() {
        let cb = breaker(3, Duration::from_secs(1));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.can_execute());
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker(3, Duration::from_secs(60));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_success_resets_counter() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_window_moves_to_half_open() {
        let cb = breaker(3, Duration::from_secs(1));
        for _ in 0..3 {
            cb.record_failure();
        }

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!cb.can_execute());
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_transitions() {
        let cb = breaker(2, Duration::from_secs(1));
        cb.record_failure();
        cb.record_failure();

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(cb.can_execute());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(cb.can_execute());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.snapshot().times_opened, 2);
    }

    #[test]
    fn test_registry_shares_breakers() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            timeout_window: Duration::from_secs(30),
        });

        registry.get_or_create("llm-primary").record_failure();
        assert_eq!(registry.get_or_create("llm-primary").state(), CircuitState::Open);
        assert_eq!(registry.get_or_create("search").state(), CircuitState::Closed);

        let names: Vec<String> = registry.snapshots().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["llm-primary".to_string(), "search".to_string()]);

        assert!(registry.reset("llm-primary"));
        assert!(!registry.reset("unknown"));
        assert_eq!(registry.get_or_create("llm-primary").state(), CircuitState::Closed);
    }
}
