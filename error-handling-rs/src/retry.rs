//! # Backoff
//!
//! Exponential backoff shared by the recovery retry strategy and the
//! scheduler's healing bank, plus a cancellable sleep.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::types::{Error, Result};

/// Exponential backoff parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay for attempt 0
    pub base: Duration,
    /// Upper bound on any computed delay
    pub max: Duration,
    /// Jitter factor (0.0 - 1.0) applied symmetrically around the delay
    pub jitter_factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter_factor: 0.0,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter_factor: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// `base * 2^attempt`, capped at `max`, without jitter
    pub fn exponential(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_secs_f64() * 1000.0;
        let max_ms = self.max.as_secs_f64() * 1000.0;
        let exp_ms = base_ms * 2.0_f64.powi(attempt.min(30) as i32);
        Duration::from_secs_f64(exp_ms.min(max_ms) / 1000.0)
    }

    /// Exponential delay with jitter, still capped at `max`
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = self.exponential(attempt);
        if self.jitter_factor <= 0.0 || capped.is_zero() {
            return capped;
        }

        let capped_ms = capped.as_secs_f64() * 1000.0;
        let jitter_range = capped_ms * self.jitter_factor;
        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        let max_ms = self.max.as_secs_f64() * 1000.0;

        let final_ms = (capped_ms + jitter).clamp(0.0, max_ms);
        Duration::from_secs_f64(final_ms / 1000.0)
    }
}

/// Sleeps for `delay`, returning `Error::Cancelled` early if `cancel` fires
pub async fn sleep_or_cancel(delay: Duration, cancel: Option<&CancellationToken>) -> Result<()> {
    match cancel {
        Some(token) => {
            tokio::select! {
                _ = tokio::time::sleep(delay) => Ok(()),
                _ = token.cancelled() => Err(Error::Cancelled),
            }
        }
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}
