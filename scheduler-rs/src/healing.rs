//! Healing strategies: local mutations applied to a failed unit before its
//! next attempt.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use error_handling_rs::{Backoff, Error};

use crate::config::HealingConfig;
use crate::unit::WorkUnit;

/// Error message fragments that mean the request was too large
const SIZE_MARKERS: &[&str] = &[
    "too long",
    "too large",
    "context length",
    "maximum context",
    "token limit",
    "max tokens",
    "payload",
];

/// What a strategy did to the unit
#[derive(Debug, Clone, PartialEq)]
pub struct HealingOutcome {
    pub strategy: &'static str,
    pub detail: String,
    /// Wait before the next attempt
    pub delay: Option<Duration>,
}

pub trait HealingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Mutates `unit` to make `attempt + 1` more likely to succeed, or
    /// returns `None` when the strategy does not apply
    fn apply(&self, unit: &mut WorkUnit, error: &Error, attempt: u32) -> Option<HealingOutcome>;
}

/// Shrinks oversized content, or any content the backend rejected as too large
#[derive(Debug, Clone)]
pub struct ContextReduction {
    max_chars: usize,
    shrink_ratio: f64,
}

impl ContextReduction {
    pub fn new(max_chars: usize, shrink_ratio: f64) -> Self {
        Self { max_chars, shrink_ratio }
    }

    fn is_size_error(error: &Error) -> bool {
        let message = error.to_string().to_lowercase();
        SIZE_MARKERS.iter().any(|marker| message.contains(marker))
    }
}

impl HealingStrategy for ContextReduction {
    fn name(&self) -> &'static str {
        "context_reduction"
    }

    fn apply(&self, unit: &mut WorkUnit, error: &Error, _attempt: u32) -> Option<HealingOutcome> {
        let len = unit.content.chars().count();
        let oversized = len > self.max_chars;
        if len <= 1 || !(oversized || Self::is_size_error(error)) {
            return None;
        }

        let shrunk = ((len as f64) * self.shrink_ratio).floor() as usize;
        let target = if oversized { shrunk.min(self.max_chars) } else { shrunk }.max(1);
        unit.content = unit.content.chars().take(target).collect();

        Some(HealingOutcome {
            strategy: self.name(),
            detail: format!("content reduced from {} to {} characters", len, target),
            delay: None,
        })
    }
}

/// Swaps in the unit's next untried fallback content
#[derive(Debug, Clone, Default)]
pub struct FallbackContent;

impl HealingStrategy for FallbackContent {
    fn name(&self) -> &'static str {
        "fallback_content"
    }

    fn apply(&self, unit: &mut WorkUnit, _error: &Error, _attempt: u32) -> Option<HealingOutcome> {
        let fallback = unit.next_fallback()?;
        unit.content = fallback;
        Some(HealingOutcome {
            strategy: self.name(),
            detail: format!("switched to fallback content {}/{}", unit.fallback_cursor, unit.fallbacks.len()),
            delay: None,
        })
    }
}

/// Waits an exponentially growing, jittered delay; applies to every failure
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    backoff: Backoff,
}

impl ExponentialBackoff {
    pub fn new(backoff: Backoff) -> Self {
        Self { backoff }
    }
}

impl HealingStrategy for ExponentialBackoff {
    fn name(&self) -> &'static str {
        "exponential_backoff"
    }

    fn apply(&self, _unit: &mut WorkUnit, _error: &Error, attempt: u32) -> Option<HealingOutcome> {
        let delay = self.backoff.delay(attempt);
        Some(HealingOutcome {
            strategy: self.name(),
            detail: format!("backing off {}ms", delay.as_millis()),
            delay: Some(delay),
        })
    }
}

/// Ordered set of healing strategies
#[derive(Clone, Default)]
pub struct HealingStrategyBank {
    strategies: Vec<Arc<dyn HealingStrategy>>,
}

impl std::fmt::Debug for HealingStrategyBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealingStrategyBank")
            .field("strategies", &self.names())
            .finish()
    }
}

impl HealingStrategyBank {
    /// A bank with no strategies; every failure gets the fixed backoff
    pub fn empty() -> Self {
        Self::default()
    }

    /// Context reduction, then fallback content, then exponential backoff
    pub fn with_defaults(config: &HealingConfig) -> Self {
        let backoff = Backoff::new(config.backoff_base, config.backoff_max).with_jitter(config.jitter_factor);
        let mut bank = Self::empty();
        bank.register(Arc::new(ContextReduction::new(config.max_content_chars, config.shrink_ratio)));
        bank.register(Arc::new(FallbackContent));
        bank.register(Arc::new(ExponentialBackoff::new(backoff)));
        bank
    }

    /// Appends `strategy`; strategies are consulted in registration order
    pub fn register(&mut self, strategy: Arc<dyn HealingStrategy>) {
        self.strategies.push(strategy);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Applies the first strategy that reports a mutation
    pub fn heal(&self, unit: &mut WorkUnit, error: &Error, attempt: u32) -> Option<HealingOutcome> {
        for strategy in &self.strategies {
            if let Some(outcome) = strategy.apply(unit, error, attempt) {
                debug!(
                    unit_id = %unit.id,
                    strategy = outcome.strategy,
                    detail = %outcome.detail,
                    "Healing applied"
                );
                unit.metrics.healing_applied.push(outcome.strategy.to_string());
                return Some(outcome);
            }
        }
        None
    }
}
