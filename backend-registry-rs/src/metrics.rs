//! Live per-backend metrics.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RoutingConfig;

/// Outcomes of the most recent calls
#[derive(Debug, Clone, Default)]
struct ResultWindow {
    size: usize,
    results: VecDeque<bool>,
    success_count: usize,
}

impl ResultWindow {
    fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            results: VecDeque::with_capacity(size),
            success_count: 0,
        }
    }

    fn add_result(&mut self, success: bool) {
        if self.results.len() >= self.size {
            if let Some(true) = self.results.pop_front() {
                self.success_count = self.success_count.saturating_sub(1);
            }
        }

        self.results.push_back(success);
        if success {
            self.success_count += 1;
        }
    }

    /// Success percentage over the window; 100 when empty
    fn uptime_percent(&self) -> f64 {
        if self.results.is_empty() {
            100.0
        } else {
            self.success_count as f64 * 100.0 / self.results.len() as f64
        }
    }
}

/// Counters and rolling figures for one backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendMetrics {
    pub backend_id: String,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Exponential moving average of response time
    pub avg_response_ms: f64,
    /// Lifetime failures / attempts
    pub error_rate: f64,
    /// Success percentage over the recent window
    pub uptime_percent: f64,
    pub last_used: Option<DateTime<Utc>>,
    #[serde(skip)]
    window: ResultWindow,
}

impl BackendMetrics {
    pub fn new(backend_id: impl Into<String>, window: usize) -> Self {
        Self {
            backend_id: backend_id.into(),
            attempts: 0,
            successes: 0,
            failures: 0,
            avg_response_ms: 0.0,
            error_rate: 0.0,
            uptime_percent: 100.0,
            last_used: None,
            window: ResultWindow::new(window),
        }
    }

    /// Folds one call into the metrics
    pub fn record(&mut self, success: bool, elapsed: Duration, alpha: f64) {
        let sample_ms = elapsed.as_secs_f64() * 1000.0;
        self.avg_response_ms = if self.attempts == 0 {
            sample_ms
        } else {
            alpha * sample_ms + (1.0 - alpha) * self.avg_response_ms
        };

        self.attempts += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.error_rate = self.failures as f64 / self.attempts as f64;

        self.window.add_result(success);
        self.uptime_percent = self.window.uptime_percent();
        self.last_used = Some(Utc::now());
    }

    /// Error rate > threshold, or too little uptime once enough requests
    /// have been observed, makes a backend unhealthy
    pub fn is_healthy(&self, config: &RoutingConfig) -> bool {
        if self.error_rate > config.unhealthy_error_rate {
            return false;
        }
        self.attempts < config.min_requests_for_uptime || self.uptime_percent >= config.min_uptime_percent
    }

    /// Recency factor in `[floor, 1]`, decaying linearly with time since
    /// last use. A backend never used scores 1.
    pub fn availability(&self, now: DateTime<Utc>, config: &RoutingConfig) -> f64 {
        let Some(last_used) = self.last_used else {
            return 1.0;
        };

        let idle_secs = (now - last_used).num_milliseconds().max(0) as f64 / 1000.0;
        let period_secs = config.decay_period.as_secs_f64();
        if period_secs <= 0.0 {
            return config.availability_floor;
        }

        (1.0 - idle_secs / period_secs).max(config.availability_floor)
    }

    /// `1 / (1 + seconds)` of the average response time
    pub fn speed_score(&self) -> f64 {
        1.0 / (1.0 + self.avg_response_ms / 1000.0)
    }
}
