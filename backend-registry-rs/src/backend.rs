//! The execution backend interface and the operation it is asked to run.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Failure kind reported when a call exceeds its timeout
pub const TIMEOUT_KIND: &str = "TimeoutError";

/// Why a backend call failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct BackendFailure {
    /// Stable failure kind, e.g. `TimeoutError` or `RateLimitError`
    pub kind: String,
    pub message: String,
}

impl BackendFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(TIMEOUT_KIND, format!("no response within {} ms", after.as_millis()))
    }
}

/// Something that can carry out an operation: an LLM call, a file
/// operation, a web fetch. Only success, the output string and the
/// timeout matter to the registry.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn execute(
        &self,
        operation_kind: &str,
        parameters: &BTreeMap<String, String>,
        context: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<String, BackendFailure>;
}

/// A request to run one operation somewhere
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub kind: String,
    pub parameters: BTreeMap<String, String>,
    pub context: BTreeMap<String, String>,
    /// Backends to try, in order, after the routed one fails
    pub fallback_backends: Vec<String>,
    pub timeout: Duration,
}

impl Operation {
    pub fn new(kind: impl Into<String>, timeout: Duration) -> Self {
        Self {
            kind: kind.into(),
            parameters: BTreeMap::new(),
            context: BTreeMap::new(),
            fallback_backends: Vec::new(),
            timeout,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_context(mut self, context: BTreeMap<String, String>) -> Self {
        self.context = context;
        self
    }

    pub fn with_fallback_backends(mut self, backends: Vec<String>) -> Self {
        self.fallback_backends = backends;
        self
    }

    /// True if `key` is present in the parameters or the context
    pub fn has_key(&self, key: &str) -> bool {
        self.parameters.contains_key(key) || self.context.contains_key(key)
    }

    /// Sorted parameter keys; `BTreeMap` keeps them ordered already
    pub fn parameter_keys(&self) -> Vec<String> {
        self.parameters.keys().cloned().collect()
    }
}
