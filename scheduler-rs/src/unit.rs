//! Work units: the schedulable nodes of a task graph.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::validation::{OutputValidator, ValidationRule};

/// Content parameter handed to the backend with every attempt
pub const CONTENT_KEY: &str = "content";

/// Execution state of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    #[default]
    Pending,
    Running,
    Retrying,
    Healing,
    Completed,
    Failed,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Completed | UnitState::Failed)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitState::Pending => "pending",
            UnitState::Running => "running",
            UnitState::Retrying => "retrying",
            UnitState::Healing => "healing",
            UnitState::Completed => "completed",
            UnitState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// What a unit accumulated over its attempts in the current run
#[derive(Debug, Clone, Default, Serialize)]
pub struct UnitMetrics {
    pub attempts: u32,
    /// One entry per failed attempt, oldest first
    pub errors: Vec<String>,
    pub last_output: Option<String>,
    /// Backend that produced the last successful output
    pub backend_id: Option<String>,
    /// Names of the healing strategies applied, in order
    pub healing_applied: Vec<String>,
    pub duration_ms: u64,
    /// Completed by the recovery coordinator after exhausting its retries
    pub recovered: bool,
}

/// One schedulable piece of work
#[derive(Clone, Serialize)]
pub struct WorkUnit {
    pub id: String,
    /// Operation kind the backend registry routes on
    pub kind: String,
    pub content: String,
    pub dependencies: Vec<String>,
    /// Replacement contents tried by fallback healing, in order
    pub fallbacks: Vec<String>,
    pub fallback_backends: Vec<String>,
    pub max_retries: u32,
    /// Falls back to the scheduler's default when unset
    pub timeout: Option<Duration>,
    pub parameters: BTreeMap<String, String>,
    /// Resource whose circuit breaker gates recovery retries
    pub resource_id: Option<String>,
    pub state: UnitState,
    pub metrics: UnitMetrics,
    #[serde(skip)]
    pub(crate) original_content: String,
    #[serde(skip)]
    pub(crate) fallback_cursor: usize,
    #[serde(skip)]
    validator: Arc<dyn OutputValidator>,
}

impl WorkUnit {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: id.into(),
            kind: kind.into(),
            original_content: content.clone(),
            content,
            dependencies: Vec::new(),
            fallbacks: Vec::new(),
            fallback_backends: Vec::new(),
            max_retries: 2,
            timeout: None,
            parameters: BTreeMap::new(),
            resource_id: None,
            state: UnitState::Pending,
            metrics: UnitMetrics::default(),
            fallback_cursor: 0,
            validator: Arc::new(ValidationRule::NonEmpty),
        }
    }

    pub fn depends_on(mut self, unit_id: impl Into<String>) -> Self {
        self.dependencies.push(unit_id.into());
        self
    }

    pub fn with_fallbacks<I, S>(mut self, fallbacks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallbacks.extend(fallbacks.into_iter().map(Into::into));
        self
    }

    pub fn with_fallback_backends<I, S>(mut self, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallback_backends.extend(backends.into_iter().map(Into::into));
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_validator<V: OutputValidator + 'static>(mut self, validator: V) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn validator(&self) -> &Arc<dyn OutputValidator> {
        &self.validator
    }

    /// Clears state left by a previous run, restoring the declared content
    pub(crate) fn reset(&mut self) {
        self.state = UnitState::Pending;
        self.metrics = UnitMetrics::default();
        self.content = self.original_content.clone();
        self.fallback_cursor = 0;
    }

    /// Next fallback content not yet tried in this run
    pub(crate) fn next_fallback(&mut self) -> Option<String> {
        let next = self.fallbacks.get(self.fallback_cursor).cloned();
        if next.is_some() {
            self.fallback_cursor += 1;
        }
        next
    }
}

impl fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkUnit")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("dependencies", &self.dependencies)
            .field("max_retries", &self.max_retries)
            .field("state", &self.state)
            .field("validator", &self.validator)
            .finish()
    }
}
