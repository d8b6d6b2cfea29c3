//! Routing and health thresholds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Remember the last healthy choice per (operation kind, parameter keys)
    pub cache_enabled: bool,
    /// A backend whose lifetime error rate exceeds this is unhealthy
    pub unhealthy_error_rate: f64,
    /// Minimum windowed uptime once enough requests were observed
    pub min_uptime_percent: f64,
    pub min_requests_for_uptime: u64,
    /// Number of recent calls the uptime percentage covers
    pub uptime_window: usize,
    /// Smoothing factor for the response time moving average
    pub ema_alpha: f64,
    /// Availability decays linearly to the floor over this period of disuse
    pub decay_period: Duration,
    pub availability_floor: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            unhealthy_error_rate: 0.5,
            min_uptime_percent: 80.0,
            min_requests_for_uptime: 10,
            uptime_window: 20,
            ema_alpha: 0.1,
            decay_period: Duration::from_secs(24 * 60 * 60),
            availability_floor: 0.1,
        }
    }
}

impl TryFrom<config::Config> for RoutingConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> Result<Self, Self::Error> {
        let mut base = RoutingConfig::default();

        if let Ok(enabled) = cfg.get::<bool>("routing.cache_enabled") {
            base.cache_enabled = enabled;
        }
        if let Ok(rate) = cfg.get::<f64>("routing.unhealthy_error_rate") {
            base.unhealthy_error_rate = rate;
        }
        if let Ok(uptime) = cfg.get::<f64>("routing.min_uptime_percent") {
            base.min_uptime_percent = uptime;
        }
        if let Ok(requests) = cfg.get::<u64>("routing.min_requests_for_uptime") {
            base.min_requests_for_uptime = requests;
        }
        if let Ok(window) = cfg.get::<usize>("routing.uptime_window") {
            base.uptime_window = window.max(1);
        }
        if let Ok(alpha) = cfg.get::<f64>("routing.ema_alpha") {
            if !(alpha > 0.0 && alpha <= 1.0) {
                return Err(config::ConfigError::Message(format!(
                    "routing.ema_alpha must be within (0, 1], got {}",
                    alpha
                )));
            }
            base.ema_alpha = alpha;
        }
        if let Ok(hours) = cfg.get::<f64>("routing.decay_hours") {
            if !hours.is_finite() || hours < 0.0 {
                return Err(config::ConfigError::Message(format!(
                    "routing.decay_hours must be a finite, non-negative number, got {}",
                    hours
                )));
            }
            base.decay_period = Duration::from_secs_f64(hours * 3600.0);
        }
        // The millisecond form wins when both are set
        if let Some(period) = config_rs::get_duration_ms(&cfg, "routing.decay_period_ms") {
            base.decay_period = period;
        }
        if let Ok(floor) = cfg.get::<f64>("routing.availability_floor") {
            base.availability_floor = floor.clamp(0.0, 1.0);
        }

        Ok(base)
    }
}
