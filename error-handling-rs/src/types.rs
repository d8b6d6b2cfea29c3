//! # Standardized Error Types
//!
//! This module provides the error taxonomy shared by every crate of the
//! task-graph execution core, together with the closed severity and category
//! sets used by incident classification.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Core error type for the task-graph execution core.
///
/// Variants carry owned strings only so errors can be cloned into unit error
/// histories and incident records without losing information.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Unit output failed its validation predicate
    #[error("output of unit '{unit_id}' failed validation: {reason}")]
    Validation { unit_id: String, reason: String },

    /// Execution backend failed or timed out
    #[error("backend '{backend}' failed ({kind}): {message}")]
    Backend {
        backend: String,
        kind: String,
        message: String,
    },

    /// Cycle or dangling dependency; fatal for the whole run
    #[error("task graph is invalid: {}", .issues.join("; "))]
    Graph { issues: Vec<String> },

    /// No backend satisfies an operation's requirements
    #[error("no backend can serve operation '{operation}': {reason}")]
    Routing { operation: String, reason: String },

    /// All recovery strategies failed for an incident
    #[error("recovery exhausted for incident {incident_id} after {attempts} attempt(s)")]
    RecoveryExhausted { incident_id: String, attempts: usize },

    /// A circuit breaker refused the call
    #[error("circuit open for resource '{0}'")]
    CircuitOpen(String),

    /// The run or operation was cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration value or unknown closed-set name
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Snapshot (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem failure while persisting a snapshot
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Creates a backend error
    pub fn backend(
        backend: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Backend {
            backend: backend.into(),
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Creates a validation error
    pub fn validation(unit_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Validation {
            unit_id: unit_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates a routing error
    pub fn routing(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Routing {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Stable name of the failure kind, used as the "exception type" when
    /// matching error patterns.
    ///
    /// Backend errors report the kind supplied by the backend (for example
    /// `TimeoutError`) so patterns can target specific backend failures.
    pub fn kind_name(&self) -> String {
        match self {
            Error::Validation { .. } => "ValidationError".to_string(),
            Error::Backend { kind, .. } if !kind.is_empty() => kind.clone(),
            Error::Backend { .. } => "BackendError".to_string(),
            Error::Graph { .. } => "GraphError".to_string(),
            Error::Routing { .. } => "RoutingError".to_string(),
            Error::RecoveryExhausted { .. } => "RecoveryExhausted".to_string(),
            Error::CircuitOpen(_) => "CircuitOpenError".to_string(),
            Error::Cancelled => "CancelledError".to_string(),
            Error::Configuration(_) => "ConfigurationError".to_string(),
            Error::Serialization(_) => "SerializationError".to_string(),
            Error::Io(_) => "IoError".to_string(),
        }
    }

    /// Returns true if a unit may retry after this error.
    ///
    /// Routing failures are retried like backend failures; graph,
    /// cancellation and configuration errors are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Validation { .. }
                | Error::Backend { .. }
                | Error::Routing { .. }
                | Error::CircuitOpen(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Configuration(err.to_string())
    }
}

/// The severity level of an incident
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Minor issue, no escalation
    Low,
    /// Default for unrecognized failures
    Medium,
    /// Escalated when recovery is exhausted
    High,
    /// Escalated when recovery is exhausted
    Critical,
}

impl Severity {
    /// HIGH and CRITICAL incidents are escalated once recovery is exhausted
    pub fn requires_escalation(&self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Medium
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(Error::Configuration(format!("unknown severity '{}'", other))),
        }
    }
}

/// Categorizes incidents for pattern matching and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Connectivity problems
    Network,
    /// Deadline exceeded
    Timeout,
    /// Authentication or permission failures
    Authentication,
    /// Memory, disk or quota exhaustion
    Resource,
    /// Malformed input or output
    Validation,
    /// Execution backend misbehaviour
    Backend,
    /// Anything else
    System,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Network => write!(f, "NETWORK"),
            ErrorCategory::Timeout => write!(f, "TIMEOUT"),
            ErrorCategory::Authentication => write!(f, "AUTHENTICATION"),
            ErrorCategory::Resource => write!(f, "RESOURCE"),
            ErrorCategory::Validation => write!(f, "VALIDATION"),
            ErrorCategory::Backend => write!(f, "BACKEND"),
            ErrorCategory::System => write!(f, "SYSTEM"),
        }
    }
}

impl FromStr for ErrorCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NETWORK" => Ok(ErrorCategory::Network),
            "TIMEOUT" => Ok(ErrorCategory::Timeout),
            "AUTHENTICATION" => Ok(ErrorCategory::Authentication),
            "RESOURCE" => Ok(ErrorCategory::Resource),
            "VALIDATION" => Ok(ErrorCategory::Validation),
            "BACKEND" => Ok(ErrorCategory::Backend),
            "SYSTEM" => Ok(ErrorCategory::System),
            other => Err(Error::Configuration(format!("unknown error category '{}'", other))),
        }
    }
}
