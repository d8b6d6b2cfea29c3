//! Recovery strategy implementations.
//!
//! Each strategy returns `Ok` when it resolved (or deliberately escalated)
//! the incident and `Err` with the reason it could not.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::degraded::{DegradedMode, DegradedSeverity};
use crate::incident::{Classification, ErrorIncident};
use crate::pattern::StrategyKind;
use crate::retry::{sleep_or_cancel, Backoff};
use crate::types::{Error, Result, Severity};

use super::RecoveryConfig;

/// Context key holding a rollback checkpoint reference
pub const CHECKPOINT_KEY: &str = "checkpoint";
/// Context key naming the component RESET re-initializes
pub const COMPONENT_KEY: &str = "component";
/// Context key naming the feature GRACEFUL_DEGRADE switches off
pub const FEATURE_KEY: &str = "feature";

/// Caller-supplied hooks that let strategies act on the failed operation
#[async_trait]
pub trait RecoverableOperation: Send + Sync {
    /// Re-invokes the original operation, returning its output
    async fn retry(&self) -> Result<String>;

    /// Fallback options, tried in order
    fn fallback_options(&self) -> Vec<String> {
        Vec::new()
    }

    async fn run_fallback(&self, option: &str) -> Result<String> {
        Err(Error::Configuration(format!("fallback '{}' is not supported", option)))
    }

    async fn rollback(&self, _checkpoint: &str) -> Result<()> {
        Ok(())
    }

    async fn reset_component(&self, _component: &str) -> Result<()> {
        Ok(())
    }
}

/// What a successful strategy achieved
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutcome {
    /// The incident is resolved; `output` is the recovered operation's
    /// result when there is one
    Recovered { detail: String, output: Option<String> },
    /// The incident was handed to a human or outer system
    Escalated { detail: String },
}

impl StrategyOutcome {
    pub fn detail(&self) -> &str {
        match self {
            StrategyOutcome::Recovered { detail, .. } | StrategyOutcome::Escalated { detail } => detail,
        }
    }

    fn recovered<S: Into<String>>(detail: S) -> Self {
        StrategyOutcome::Recovered {
            detail: detail.into(),
            output: None,
        }
    }
}

/// Everything a strategy may consult while handling one incident
pub struct StrategyContext<'a> {
    pub incident: &'a ErrorIncident,
    pub classification: &'a Classification,
    pub operation: Option<&'a dyn RecoverableOperation>,
    pub breakers: &'a CircuitBreakerRegistry,
    pub degraded: &'a DegradedMode,
    pub config: &'a RecoveryConfig,
    pub cancel: Option<&'a CancellationToken>,
}

impl<'a> StrategyContext<'a> {
    fn operation(&self, strategy: StrategyKind) -> Result<&'a dyn RecoverableOperation> {
        self.operation
            .ok_or_else(|| Error::Configuration(format!("{} needs a recoverable operation", strategy)))
    }
}

#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn execute(&self, ctx: &StrategyContext<'_>) -> Result<StrategyOutcome>;
}

/// Re-invokes the operation up to the pattern's retry budget with
/// exponential delays, gated by the resource's circuit breaker
#[derive(Debug, Default)]
pub struct RetryStrategy;

#[async_trait]
impl RecoveryStrategy for RetryStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Retry
    }

    async fn execute(&self, ctx: &StrategyContext<'_>) -> Result<StrategyOutcome> {
        let operation = ctx.operation(self.kind())?;
        let max_retries = ctx.classification.max_retries;
        let backoff = Backoff::new(ctx.classification.retry_delay_base, ctx.config.max_delay);
        let breaker = ctx
            .incident
            .resource_id
            .as_deref()
            .map(|resource| ctx.breakers.get_or_create(resource));

        let mut last_error = None;
        for attempt in 0..max_retries {
            sleep_or_cancel(backoff.exponential(attempt), ctx.cancel).await?;

            if let Some(breaker) = &breaker {
                if !breaker.can_execute() {
                    return Err(Error::CircuitOpen(breaker.name().to_string()));
                }
            }

            match operation.retry().await {
                Ok(output) => {
                    if let Some(breaker) = &breaker {
                        breaker.record_success();
                    }
                    return Ok(StrategyOutcome::Recovered {
                        detail: format!("succeeded on retry {}/{}", attempt + 1, max_retries),
                        output: Some(output),
                    });
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    if let Some(breaker) = &breaker {
                        breaker.record_failure();
                    }
                    debug!(
                        incident_id = %ctx.incident.id,
                        attempt = attempt + 1,
                        max_retries = max_retries,
                        error = %e,
                        "Recovery retry failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Configuration("retry budget is zero".to_string())))
    }
}

/// Tries each fallback option in order
#[derive(Debug, Default)]
pub struct FallbackRecovery;

#[async_trait]
impl RecoveryStrategy for FallbackRecovery {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Fallback
    }

    async fn execute(&self, ctx: &StrategyContext<'_>) -> Result<StrategyOutcome> {
        let operation = ctx.operation(self.kind())?;
        let options = operation.fallback_options();
        if options.is_empty() {
            return Err(Error::Configuration("no fallback options declared".to_string()));
        }

        let mut last_error = None;
        for (index, option) in options.iter().enumerate() {
            if ctx.cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
                return Err(Error::Cancelled);
            }
            match operation.run_fallback(option).await {
                Ok(output) => {
                    return Ok(StrategyOutcome::Recovered {
                        detail: format!("fallback option {} succeeded", index + 1),
                        output: Some(output),
                    })
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Configuration("no fallback succeeded".to_string())))
    }
}

/// Restores the checkpoint named in the incident context
#[derive(Debug, Default)]
pub struct RollbackStrategy;

#[async_trait]
impl RecoveryStrategy for RollbackStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Rollback
    }

    async fn execute(&self, ctx: &StrategyContext<'_>) -> Result<StrategyOutcome> {
        let checkpoint = ctx
            .incident
            .context
            .get(CHECKPOINT_KEY)
            .ok_or_else(|| Error::Configuration("no checkpoint reference in context".to_string()))?;

        if let Some(operation) = ctx.operation {
            operation.rollback(checkpoint).await?;
        }
        Ok(StrategyOutcome::recovered(format!("rolled back to checkpoint '{}'", checkpoint)))
    }
}

/// Re-initializes a component and waits for it to settle
#[derive(Debug, Default)]
pub struct ResetStrategy;

#[async_trait]
impl RecoveryStrategy for ResetStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Reset
    }

    async fn execute(&self, ctx: &StrategyContext<'_>) -> Result<StrategyOutcome> {
        let component = ctx
            .incident
            .context
            .get(COMPONENT_KEY)
            .cloned()
            .or_else(|| ctx.incident.resource_id.clone())
            .unwrap_or_else(|| "default".to_string());

        if let Some(operation) = ctx.operation {
            if let Err(e) = operation.reset_component(&component).await {
                warn!(component = %component, error = %e, "Component reset reported an error");
            }
        }

        sleep_or_cancel(ctx.config.reset_settle_delay, ctx.cancel).await?;
        Ok(StrategyOutcome::recovered(format!("component '{}' reset", component)))
    }
}

/// Hands the incident off; always succeeds
#[derive(Debug, Default)]
pub struct EscalateStrategy;

#[async_trait]
impl RecoveryStrategy for EscalateStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Escalate
    }

    async fn execute(&self, ctx: &StrategyContext<'_>) -> Result<StrategyOutcome> {
        Ok(StrategyOutcome::Escalated {
            detail: format!("escalated {} incident", ctx.classification.severity),
        })
    }
}

/// Records a failure on the resource's breaker so further calls are held
/// off; succeeds whatever the breaker state
#[derive(Debug, Default)]
pub struct CircuitBreakStrategy;

#[async_trait]
impl RecoveryStrategy for CircuitBreakStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::CircuitBreak
    }

    async fn execute(&self, ctx: &StrategyContext<'_>) -> Result<StrategyOutcome> {
        let resource = ctx
            .incident
            .resource_id
            .clone()
            .unwrap_or_else(|| ctx.incident.error_kind.clone());

        let breaker = ctx.breakers.get_or_create(&resource);
        breaker.record_failure();

        Ok(StrategyOutcome::recovered(format!(
            "circuit '{}' is {}",
            resource,
            breaker.state()
        )))
    }
}

/// Switches on a reduced-feature mode; always succeeds
#[derive(Debug, Default)]
pub struct GracefulDegradeStrategy;

#[async_trait]
impl RecoveryStrategy for GracefulDegradeStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::GracefulDegrade
    }

    async fn execute(&self, ctx: &StrategyContext<'_>) -> Result<StrategyOutcome> {
        let mode = ctx
            .incident
            .context
            .get(FEATURE_KEY)
            .cloned()
            .or_else(|| ctx.incident.resource_id.clone())
            .unwrap_or_else(|| ctx.classification.category.to_string().to_lowercase());

        let severity = match ctx.classification.severity {
            Severity::Low => DegradedSeverity::Minor,
            Severity::Medium => DegradedSeverity::Moderate,
            Severity::High => DegradedSeverity::Severe,
            Severity::Critical => DegradedSeverity::Critical,
        };
        ctx.degraded.activate(mode.clone(), ctx.incident.message.clone(), severity);

        Ok(StrategyOutcome::recovered(format!("degraded mode '{}' active", mode)))
    }
}

/// One implementation per strategy kind
pub fn default_strategies() -> Vec<Arc<dyn RecoveryStrategy>> {
    vec![
        Arc::new(RetryStrategy),
        Arc::new(FallbackRecovery),
        Arc::new(RollbackStrategy),
        Arc::new(ResetStrategy),
        Arc::new(EscalateStrategy),
        Arc::new(CircuitBreakStrategy),
        Arc::new(GracefulDegradeStrategy),
    ]
}
