//! Backend Registry Library
//! Provides capability declarations, live backend metrics and
//! health-aware routing with fallback for the task-graph execution core.

pub mod backend;
pub mod capability;
pub mod config;
pub mod metrics;
pub mod registry;

pub use backend::{BackendFailure, ExecutionBackend, Operation, TIMEOUT_KIND};
pub use capability::{parse_declarations, BackendCapability};
pub use config::RoutingConfig;
pub use metrics::BackendMetrics;
pub use registry::{BackendHealth, BackendRegistry, BackendResponse};

pub use error_handling_rs::{Error, Result};
