//! Scheduler Library
//! Runs a dependency graph of work units against pluggable execution
//! backends, healing failed units locally and escalating the ones that
//! exhaust their retries to the recovery coordinator.

pub mod config;
mod executor;
pub mod graph;
pub mod healing;
pub mod result;
pub mod scheduler;
pub mod snapshot;
pub mod unit;
pub mod validation;

pub use config::{CancelPolicy, HealingConfig, SchedulerConfig, Settings};
pub use graph::TaskGraph;
pub use healing::{ContextReduction, ExponentialBackoff, FallbackContent, HealingOutcome, HealingStrategy, HealingStrategyBank};
pub use result::{RunMetrics, RunResult, UnitOutcome, UnitReport};
pub use scheduler::Scheduler;
pub use snapshot::Snapshot;
pub use unit::{UnitMetrics, UnitState, WorkUnit, CONTENT_KEY};
pub use validation::{OutputValidator, PredicateValidator, ValidationRule};

pub use backend_registry::{BackendCapability, BackendFailure, BackendRegistry, ExecutionBackend, Operation};
pub use error_handling_rs::{CancellationToken, Error, RecoveryConfig, RecoveryCoordinator, Result};

/// Loads settings from `file` and the environment, then initializes logging
pub fn init(file: Option<&std::path::Path>) -> Result<Settings> {
    let settings = Settings::load(config_rs::DEFAULT_PREFIX, file)?;
    error_handling_rs::init_logging(Some(settings.logging.clone()))?;
    Ok(settings)
}
