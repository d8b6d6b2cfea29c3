//! Scheduler and healing settings.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use backend_registry::RoutingConfig;
use error_handling_rs::{CircuitBreakerConfig, LoggingConfig, RecoveryConfig};

/// What happens to units already dispatched when a run is cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// In-flight backend calls and healing waits observe the cancellation
    #[default]
    Abandon,
    /// In-flight units run their attempt loop to completion
    FinishInFlight,
}

impl fmt::Display for CancelPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelPolicy::Abandon => write!(f, "abandon"),
            CancelPolicy::FinishInFlight => write!(f, "finish_in_flight"),
        }
    }
}

impl FromStr for CancelPolicy {
    type Err = config::ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abandon" => Ok(CancelPolicy::Abandon),
            "finish_in_flight" | "finish" => Ok(CancelPolicy::FinishInFlight),
            other => Err(config::ConfigError::Message(format!(
                "unknown cancel policy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Units whose dependencies are satisfied that may run at once
    pub max_parallelism: usize,
    /// Delay before a retry when no healing strategy applied
    pub fixed_backoff: Duration,
    /// Backend timeout for units that don't set their own
    pub default_timeout: Duration,
    pub cancel_policy: CancelPolicy,
    /// Hand units that exhaust their retries to the recovery coordinator
    pub recover_failed_units: bool,
    /// Output of unit `x` is stored in the shared context under `x.<suffix>`
    pub output_key_suffix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 1,
            fixed_backoff: Duration::from_secs(1),
            default_timeout: Duration::from_secs(60),
            cancel_policy: CancelPolicy::Abandon,
            recover_failed_units: true,
            output_key_suffix: "output".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn output_key(&self, unit_id: &str) -> String {
        format!("{}.{}", unit_id, self.output_key_suffix)
    }
}

impl TryFrom<config::Config> for SchedulerConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> Result<Self, Self::Error> {
        let mut base = SchedulerConfig::default();

        if let Ok(parallelism) = cfg.get::<usize>("scheduler.max_parallelism") {
            if parallelism == 0 {
                return Err(config::ConfigError::Message(
                    "scheduler.max_parallelism must be at least 1".to_string(),
                ));
            }
            base.max_parallelism = parallelism;
        }
        if let Some(backoff) = config_rs::get_duration_ms(&cfg, "scheduler.fixed_backoff_ms") {
            base.fixed_backoff = backoff;
        }
        if let Some(timeout) = config_rs::get_duration_ms(&cfg, "scheduler.default_timeout_ms") {
            base.default_timeout = timeout;
        }
        if let Ok(policy) = cfg.get::<String>("scheduler.cancel_policy") {
            base.cancel_policy = policy.parse()?;
        }
        if let Ok(recover) = cfg.get::<bool>("scheduler.recover_failed_units") {
            base.recover_failed_units = recover;
        }
        if let Ok(suffix) = cfg.get::<String>("scheduler.output_key_suffix") {
            base.output_key_suffix = suffix;
        }

        Ok(base)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingConfig {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Random spread applied to backoff delays, as a fraction of the delay
    pub jitter_factor: f64,
    /// Content longer than this is truncated by context reduction
    pub max_content_chars: usize,
    /// Fraction of content kept when a backend reports an oversized request
    pub shrink_ratio: f64,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            jitter_factor: 0.1,
            max_content_chars: 4000,
            shrink_ratio: 0.5,
        }
    }
}

impl TryFrom<config::Config> for HealingConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> Result<Self, Self::Error> {
        let mut base = HealingConfig::default();

        if let Some(delay) = config_rs::get_duration_ms(&cfg, "healing.backoff_base_ms") {
            base.backoff_base = delay;
        }
        if let Some(delay) = config_rs::get_duration_ms(&cfg, "healing.backoff_max_ms") {
            base.backoff_max = delay;
        }
        if let Ok(jitter) = cfg.get::<f64>("healing.jitter_factor") {
            base.jitter_factor = jitter.clamp(0.0, 1.0);
        }
        if let Ok(chars) = cfg.get::<usize>("healing.max_content_chars") {
            base.max_content_chars = chars;
        }
        if let Ok(ratio) = cfg.get::<f64>("healing.shrink_ratio") {
            if !(ratio > 0.0 && ratio < 1.0) {
                return Err(config::ConfigError::Message(format!(
                    "healing.shrink_ratio must be within (0, 1), got {}",
                    ratio
                )));
            }
            base.shrink_ratio = ratio;
        }

        Ok(base)
    }
}

/// Every typed section of the execution core, read from one layered source
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub scheduler: SchedulerConfig,
    pub healing: HealingConfig,
    pub routing: RoutingConfig,
    pub recovery: RecoveryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Loads all sections from `file` (if any) and `{prefix}__*` variables
    pub fn load(prefix: &str, file: Option<&std::path::Path>) -> Result<Self, config::ConfigError> {
        let cfg = config_rs::load_settings(prefix, file)?;
        Self::try_from(cfg)
    }
}

impl TryFrom<config::Config> for Settings {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> Result<Self, Self::Error> {
        Ok(Self {
            scheduler: SchedulerConfig::try_from(cfg.clone())?,
            healing: HealingConfig::try_from(cfg.clone())?,
            routing: RoutingConfig::try_from(cfg.clone())?,
            recovery: RecoveryConfig::try_from(cfg.clone())?,
            circuit_breaker: CircuitBreakerConfig::try_from(cfg.clone())?,
            logging: LoggingConfig::try_from(cfg)?,
        })
    }
}
