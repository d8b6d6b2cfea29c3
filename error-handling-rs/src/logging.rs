//! # Structured Logging
//!
//! This module installs the `tracing` subscriber used by the execution core
//! and provides helpers for run-scoped spans and severity-aware incident logs.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::incident::ErrorIncident;
use crate::types::{Error, Result, Severity};

// Set once the subscriber is installed; holds the file writer guard, which
// keeps the non-blocking writer flushing for the life of the process
static LOGGING: OnceCell<Option<WorkerGuard>> = OnceCell::new();

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// The service name used for log file names
    pub service_name: String,
    /// Whether to output logs to a file
    pub file_output: bool,
    /// The directory to store log files in
    pub log_dir: Option<String>,
    /// Whether to use JSON formatting
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "taskgraph".to_string(),
            file_output: false,
            log_dir: None,
            json_format: false,
        }
    }
}

impl TryFrom<config::Config> for LoggingConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        // Start from defaults and selectively override from the provided config.
        let mut base = LoggingConfig::default();

        if let Ok(level) = cfg.get::<String>("logging.level") {
            base.level = level;
        }
        if let Ok(service_name) = cfg.get::<String>("logging.service_name") {
            base.service_name = service_name;
        }
        if let Ok(file_output) = cfg.get::<bool>("logging.file_output") {
            base.file_output = file_output;
        }
        if let Ok(log_dir) = cfg.get::<String>("logging.log_dir") {
            base.log_dir = Some(log_dir);
        }
        if let Ok(json_format) = cfg.get::<bool>("logging.json_format") {
            base.json_format = json_format;
        }

        Ok(base)
    }
}

/// Initializes the structured logging system.
///
/// Safe to call more than once, from any thread; only the first call
/// installs a subscriber and concurrent callers wait for it to finish.
/// `RUST_LOG` takes precedence over `config.level`.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    LOGGING.get_or_try_init(|| install_subscriber(config.unwrap_or_default()))?;
    Ok(())
}

fn install_subscriber(config: LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let json_layer = config.json_format.then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
    });

    let text_layer = (!config.json_format).then(|| fmt::layer().with_target(true).with_thread_ids(true));

    let (file_layer, guard) = match (&config.file_output, &config.log_dir) {
        (true, Some(log_dir)) => {
            let appender = tracing_appender::rolling::daily(log_dir, format!("{}.log", config.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(non_blocking).with_ansi(false)), Some(guard))
        }
        _ => (None, None),
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Configuration(format!("Failed to set global subscriber: {}", e)))?;

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(guard)
}

/// Span wrapping one scheduler run; every event inside carries `run_id`.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("taskgraph_run", run_id = %run_id)
}

/// Logs an incident at a level derived from its severity
pub fn log_incident(incident: &ErrorIncident) {
    let category = incident
        .classification
        .as_ref()
        .map(|c| c.category.to_string())
        .unwrap_or_else(|| "UNCLASSIFIED".to_string());
    let severity = incident
        .classification
        .as_ref()
        .map(|c| c.severity)
        .unwrap_or_default();

    match severity {
        Severity::Critical | Severity::High => tracing::error!(
            incident_id = %incident.id,
            error_kind = %incident.error_kind,
            category = %category,
            severity = %severity,
            status = %incident.status,
            attempts = incident.attempts.len(),
            message = %incident.message,
            "Incident closed"
        ),
        Severity::Medium => tracing::warn!(
            incident_id = %incident.id,
            error_kind = %incident.error_kind,
            category = %category,
            status = %incident.status,
            attempts = incident.attempts.len(),
            "Incident closed"
        ),
        Severity::Low => tracing::info!(
            incident_id = %incident.id,
            category = %category,
            status = %incident.status,
            "Incident closed"
        ),
    }
}
