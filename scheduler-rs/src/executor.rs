//! Single-unit execution: attempts, validation, healing and hand-off to
//! the recovery coordinator.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::{counter, histogram};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use backend_registry::{BackendRegistry, BackendResponse, Operation};
use error_handling_rs::{
    sleep_or_cancel, CancellationToken, Error, ErrorIncident, RecoverableOperation, RecoveryCoordinator, Result,
};

use crate::config::SchedulerConfig;
use crate::healing::HealingStrategyBank;
use crate::unit::{UnitState, WorkUnit, CONTENT_KEY};
use crate::validation::OutputValidator;

/// Context shared by every unit of a run
pub(crate) type SharedContext = Arc<RwLock<BTreeMap<String, String>>>;

/// A unit handed back to the scheduler after its execution path ended
pub(crate) struct UnitRun {
    pub unit: WorkUnit,
    pub result: Result<String>,
    /// Raised when the unit was handed to the recovery coordinator
    pub incident: Option<ErrorIncident>,
}

/// Runs one unit to a terminal state. Cheap to clone; one per run.
#[derive(Clone)]
pub(crate) struct UnitExecutor {
    pub registry: Arc<BackendRegistry>,
    pub coordinator: Arc<RecoveryCoordinator>,
    pub bank: Arc<HealingStrategyBank>,
    pub config: SchedulerConfig,
    /// Observed inside backend calls and waits; unset when in-flight units
    /// are allowed to finish
    pub cancel: Option<CancellationToken>,
}

impl UnitExecutor {
    pub async fn run(&self, mut unit: WorkUnit, shared: SharedContext) -> UnitRun {
        let started = Instant::now();

        let (result, incident) = match self.execute(&mut unit, &shared).await {
            Ok(output) => (Ok(output), None),
            Err(Error::Cancelled) => (Err(Error::Cancelled), None),
            Err(e) if self.config.recover_failed_units && e.is_retryable() => {
                self.recover(&mut unit, &shared, e).await
            }
            Err(e) => (Err(e), None),
        };

        match &result {
            Ok(output) => {
                shared
                    .write()
                    .await
                    .insert(self.config.output_key(&unit.id), output.clone());
            }
            Err(Error::Cancelled) => unit.state = UnitState::Pending,
            Err(_) => {}
        }

        unit.metrics.duration_ms = started.elapsed().as_millis() as u64;
        histogram!("scheduler.unit.duration_ms", unit.metrics.duration_ms as f64, "kind" => unit.kind.clone());

        UnitRun { unit, result, incident }
    }

    /// Up to `max_retries + 1` attempts, healing between them
    async fn execute(&self, unit: &mut WorkUnit, shared: &SharedContext) -> Result<String> {
        let mut last_error = None;

        for attempt in 0..=unit.max_retries {
            if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return Err(Error::Cancelled);
            }

            unit.state = if attempt == 0 { UnitState::Running } else { UnitState::Retrying };
            unit.metrics.attempts += 1;
            counter!("scheduler.unit.attempts", 1, "kind" => unit.kind.clone());

            let operation = self.operation_for(unit, shared).await;
            match run_validated(&self.registry, &operation, unit.validator().as_ref(), &unit.id, self.cancel.as_ref()).await {
                Ok(response) => {
                    debug!(
                        unit_id = %unit.id,
                        backend = %response.backend_id,
                        attempt = attempt + 1,
                        "Unit completed"
                    );
                    unit.state = UnitState::Completed;
                    unit.metrics.backend_id = Some(response.backend_id);
                    unit.metrics.last_output = Some(response.output.clone());
                    return Ok(response.output);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(
                        unit_id = %unit.id,
                        attempt = attempt + 1,
                        max_attempts = unit.max_retries + 1,
                        error = %e,
                        "Unit attempt failed"
                    );
                    counter!("scheduler.unit.failed_attempts", 1, "kind" => unit.kind.clone(), "error" => e.kind_name());
                    unit.metrics.errors.push(e.to_string());

                    if !e.is_retryable() {
                        last_error = Some(e);
                        break;
                    }

                    if attempt < unit.max_retries {
                        unit.state = UnitState::Healing;
                        let delay = match self.bank.heal(unit, &e, attempt) {
                            Some(outcome) => outcome.delay,
                            None => Some(self.config.fixed_backoff),
                        };
                        if let Some(delay) = delay {
                            sleep_or_cancel(delay, self.cancel.as_ref()).await?;
                        }
                    }
                    last_error = Some(e);
                }
            }
        }

        unit.state = UnitState::Failed;
        Err(last_error.unwrap_or_else(|| Error::validation(&unit.id, "no attempt was made")))
    }

    /// Shared context plus the unit's own parameters; the unit's values win
    async fn operation_for(&self, unit: &WorkUnit, shared: &SharedContext) -> Operation {
        let mut context = shared.read().await.clone();
        context.extend(unit.parameters.clone());

        let mut parameters = unit.parameters.clone();
        parameters.insert(CONTENT_KEY.to_string(), unit.content.clone());

        let mut operation = Operation::new(unit.kind.clone(), unit.timeout.unwrap_or(self.config.default_timeout))
            .with_context(context)
            .with_fallback_backends(unit.fallback_backends.clone());
        operation.parameters = parameters;
        operation
    }

    /// Hands a unit that exhausted its retries to the recovery coordinator.
    /// The incident carries the attempt's context, so strategies see keys
    /// such as `checkpoint` or `feature` supplied by the run or the unit.
    ///
    /// The unit completes when a strategy produced an output for it, or
    /// when the incident was resolved without one (a rollback or reset)
    /// and one final attempt then succeeds.
    async fn recover(
        &self,
        unit: &mut WorkUnit,
        shared: &SharedContext,
        error: Error,
    ) -> (Result<String>, Option<ErrorIncident>) {
        let resource = unit.resource_id.clone().or_else(|| match &error {
            Error::Backend { backend, .. } => Some(backend.clone()),
            _ => None,
        });

        let operation = UnitRecovery {
            registry: &self.registry,
            operation: self.operation_for(unit, shared).await,
            validator: unit.validator().clone(),
            unit_id: unit.id.clone(),
            fallbacks: unit.fallbacks.clone(),
            cancel: self.cancel.as_ref(),
        };

        let mut incident = ErrorIncident::from_error(&error);
        for (key, value) in &operation.operation.context {
            incident = incident.with_context(key.clone(), value.clone());
        }
        incident = incident
            .with_context("unit_id", unit.id.clone())
            .with_context("operation", unit.kind.clone())
            .with_stack_context(format!(
                "unit '{}' failed after {} attempts",
                unit.id, unit.metrics.attempts
            ));
        if let Some(resource) = resource {
            incident = incident.with_resource(resource);
        }

        let outcome = self
            .coordinator
            .handle_error(incident, Some(&operation), self.cancel.as_ref())
            .await;

        if !outcome.is_resolved() {
            let result = match outcome.error {
                Some(Error::Cancelled) => Err(Error::Cancelled),
                _ => Err(error),
            };
            return (result, Some(outcome.incident));
        }

        let output = match outcome.output {
            Some(output) => Ok(output),
            None => {
                debug!(unit_id = %unit.id, incident_id = %outcome.incident.id, "Incident resolved, making a final attempt");
                unit.metrics.attempts += 1;
                counter!("scheduler.unit.attempts", 1, "kind" => unit.kind.clone());
                operation.retry().await
            }
        };

        match output {
            Ok(output) => {
                info!(unit_id = %unit.id, incident_id = %outcome.incident.id, "Unit recovered");
                unit.state = UnitState::Completed;
                unit.metrics.recovered = true;
                unit.metrics.last_output = Some(output.clone());
                (Ok(output), Some(outcome.incident))
            }
            Err(Error::Cancelled) => (Err(Error::Cancelled), Some(outcome.incident)),
            Err(e) => {
                warn!(unit_id = %unit.id, error = %e, "Final attempt after recovery failed");
                unit.metrics.errors.push(e.to_string());
                (Err(error), Some(outcome.incident))
            }
        }
    }
}

/// Executes `operation` through the registry and checks the output
async fn run_validated(
    registry: &BackendRegistry,
    operation: &Operation,
    validator: &dyn OutputValidator,
    unit_id: &str,
    cancel: Option<&CancellationToken>,
) -> Result<BackendResponse> {
    let response = registry.execute(operation, cancel).await?;
    validator
        .check(&response.output)
        .map_err(|reason| Error::validation(unit_id, reason))?;
    Ok(response)
}

/// Lets recovery strategies re-run a failed unit's operation
struct UnitRecovery<'a> {
    registry: &'a BackendRegistry,
    operation: Operation,
    validator: Arc<dyn OutputValidator>,
    unit_id: String,
    fallbacks: Vec<String>,
    cancel: Option<&'a CancellationToken>,
}

#[async_trait]
impl<'a> RecoverableOperation for UnitRecovery<'a> {
    async fn retry(&self) -> Result<String> {
        run_validated(self.registry, &self.operation, self.validator.as_ref(), &self.unit_id, self.cancel)
            .await
            .map(|response| response.output)
    }

    fn fallback_options(&self) -> Vec<String> {
        self.fallbacks.clone()
    }

    async fn run_fallback(&self, option: &str) -> Result<String> {
        let mut operation = self.operation.clone();
        operation.parameters.insert(CONTENT_KEY.to_string(), option.to_string());
        run_validated(self.registry, &operation, self.validator.as_ref(), &self.unit_id, self.cancel)
            .await
            .map(|response| response.output)
    }
}
