//! config-rs/lib.rs
//! Shared configuration utilities for the task-graph execution core.
//! Provides layered settings loading and duration lookups.

use std::path::Path;
use std::time::Duration;

pub use config::{Config, ConfigError};

/// Environment variable prefix used when callers don't supply their own.
pub const DEFAULT_PREFIX: &str = "TASKGRAPH";

/// Separator between prefix, section and key in environment variable names,
/// e.g. `TASKGRAPH__SCHEDULER__MAX_PARALLELISM`.
pub const ENV_SEPARATOR: &str = "__";

/// Build a layered configuration.
///
/// Sources, lowest precedence first:
/// 1. the optional TOML/YAML/JSON file at `file` (missing files are ignored)
/// 2. variables from a `.env` file in the working directory
/// 3. process environment variables named `{prefix}__{section}__{key}`
///
/// Typed sections are read from the result with `TryFrom<config::Config>`
/// implementations in each crate.
pub fn load_settings(prefix: &str, file: Option<&Path>) -> Result<Config, ConfigError> {
    // A missing .env file is the normal case outside development.
    if dotenv::dotenv().is_err() {
        log::debug!("No .env file found, using process environment only");
    }

    let mut builder = Config::builder();

    if let Some(path) = file {
        if !path.exists() {
            log::warn!("Config file {} not found, continuing with defaults", path.display());
        }
        builder = builder.add_source(config::File::from(path).required(false));
    }

    builder
        .add_source(
            config::Environment::with_prefix(prefix)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        )
        .build()
}

/// Load settings using [`DEFAULT_PREFIX`] and no file.
pub fn load_default_settings() -> Result<Config, ConfigError> {
    load_settings(DEFAULT_PREFIX, None)
}

/// Read a duration stored as milliseconds under `key`.
pub fn get_duration_ms(cfg: &Config, key: &str) -> Option<Duration> {
    cfg.get::<u64>(key).ok().map(Duration::from_millis)
}
