//! # Backend Registry
//!
//! Tracks which backend can serve which operation kind, keeps live metrics
//! for each backend and routes operations to the best-scoring healthy
//! candidate.
//!
//! Route score per capability:
//!
//! ```text
//! 0.3 * performance + 0.1 * availability + 0.3 * (100 - error%) / 100 + 0.3 * reliability
//! ```
//!
//! Shared across concurrent runs; all state sits behind std locks that are
//! never held across an await.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use error_handling_rs::{CancellationToken, Error, Result};

use crate::backend::{BackendFailure, ExecutionBackend, Operation};
use crate::capability::{load_declarations, BackendCapability};
use crate::config::RoutingConfig;
use crate::metrics::BackendMetrics;

const PERFORMANCE_WEIGHT: f64 = 0.3;
const AVAILABILITY_WEIGHT: f64 = 0.1;
const ERROR_RATE_WEIGHT: f64 = 0.3;
const RELIABILITY_WEIGHT: f64 = 0.3;

/// Weight of the previous performance score when blending in live latency
const PERFORMANCE_RETENTION: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    operation_kind: String,
    parameter_keys: Vec<String>,
}

impl CacheKey {
    fn for_operation(operation: &Operation) -> Self {
        Self {
            operation_kind: operation.kind.clone(),
            parameter_keys: operation.parameter_keys(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    /// Backend ids in registration order
    order: Vec<String>,
    backends: HashMap<String, Arc<dyn ExecutionBackend>>,
    /// Declaration order decides ties
    capabilities: Vec<BackendCapability>,
    metrics: HashMap<String, BackendMetrics>,
}

impl RegistryState {
    fn ensure_known(&mut self, backend_id: &str, window: usize) {
        if !self.metrics.contains_key(backend_id) {
            self.order.push(backend_id.to_string());
            self.metrics
                .insert(backend_id.to_string(), BackendMetrics::new(backend_id, window));
        }
    }
}

/// Health entry for one backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendHealth {
    pub backend_id: String,
    pub healthy: bool,
    pub metrics: BackendMetrics,
}

/// Successful execution
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub backend_id: String,
    pub output: String,
    pub elapsed: Duration,
    /// Backends that failed before this one succeeded
    pub failed_backends: Vec<String>,
}

pub struct BackendRegistry {
    config: RoutingConfig,
    state: RwLock<RegistryState>,
    cache: Mutex<HashMap<CacheKey, String>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("BackendRegistry")
            .field("config", &self.config)
            .field("backends", &state.order)
            .field("capabilities", &state.capabilities.len())
            .finish()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new(RoutingConfig::default())
    }
}

impl BackendRegistry {
    pub fn new(config: RoutingConfig) -> Self {
        Self {
            config,
            state: RwLock::new(RegistryState::default()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Registers the implementation that serves `backend_id`
    pub fn register_backend(&self, backend_id: impl Into<String>, backend: Arc<dyn ExecutionBackend>) {
        let backend_id = backend_id.into();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.ensure_known(&backend_id, self.config.uptime_window);
        state.backends.insert(backend_id.clone(), backend);
        info!(backend = %backend_id, "Backend registered");
    }

    /// Declares that `backend_id` can serve `capability.operation_kind`
    pub fn declare(&self, backend_id: impl Into<String>, mut capability: BackendCapability) -> Result<()> {
        capability.backend_id = backend_id.into();
        capability.validate()?;

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.ensure_known(&capability.backend_id, self.config.uptime_window);

        debug!(
            backend = %capability.backend_id,
            operation = %capability.operation_kind,
            required = ?capability.required_keys,
            "Capability declared"
        );

        let existing = state.capabilities.iter_mut().find(|c| {
            c.backend_id == capability.backend_id && c.operation_kind == capability.operation_kind
        });
        match existing {
            Some(existing) => *existing = capability,
            None => state.capabilities.push(capability),
        }
        drop(state);

        self.clear_cache();
        Ok(())
    }

    /// Declares every capability listed in a TOML file
    pub async fn load_declarations(&self, path: &Path) -> Result<usize> {
        let capabilities = load_declarations(path).await?;
        let count = capabilities.len();
        for capability in capabilities {
            let backend_id = capability.backend_id.clone();
            self.declare(backend_id, capability)?;
        }
        Ok(count)
    }

    /// Picks the best backend for `operation`.
    ///
    /// Only capabilities of the operation's kind whose required keys are
    /// all present qualify. Healthy candidates are preferred; if none is
    /// healthy the best unhealthy one is returned. Equal scores go to the
    /// earliest declaration.
    pub fn route(&self, operation: &Operation) -> Result<String> {
        let key = CacheKey::for_operation(operation);

        if self.config.cache_enabled {
            if let Some(cached) = self.cached_choice(&key, operation) {
                counter!("backend.route.cache_hit", 1, "operation" => operation.kind.clone());
                return Ok(cached);
            }
        }

        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();

        let mut best_healthy: Option<(f64, &str)> = None;
        let mut best_any: Option<(f64, &str)> = None;
        let mut seen_kind = false;

        for capability in state.capabilities.iter().filter(|c| c.operation_kind == operation.kind) {
            seen_kind = true;
            if !capability.required_keys.iter().all(|k| operation.has_key(k)) {
                continue;
            }
            let Some(metrics) = state.metrics.get(&capability.backend_id) else {
                continue;
            };

            let score = self.score(capability, metrics, now);
            let id = capability.backend_id.as_str();

            if best_any.map_or(true, |(best, _)| score > best) {
                best_any = Some((score, id));
            }
            if metrics.is_healthy(&self.config) && best_healthy.map_or(true, |(best, _)| score > best) {
                best_healthy = Some((score, id));
            }
        }

        let chosen = match (best_healthy, best_any) {
            (Some((score, id)), _) => {
                let id = id.to_string();
                if self.config.cache_enabled {
                    self.cache
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(key, id.clone());
                }
                debug!(operation = %operation.kind, backend = %id, score = score, "Routed operation");
                id
            }
            (None, Some((score, id))) => {
                warn!(
                    operation = %operation.kind,
                    backend = %id,
                    score = score,
                    "No healthy backend, routing to best unhealthy candidate"
                );
                id.to_string()
            }
            (None, None) => {
                let reason = if seen_kind {
                    "no capable backend has the required context keys".to_string()
                } else {
                    "no backend declares this operation kind".to_string()
                };
                counter!("backend.route.failures", 1, "operation" => operation.kind.clone());
                return Err(Error::routing(operation.kind.clone(), reason));
            }
        };

        Ok(chosen)
    }

    fn cached_choice(&self, key: &CacheKey, operation: &Operation) -> Option<String> {
        let cached = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()?;

        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let healthy = state
            .metrics
            .get(&cached)
            .map(|m| m.is_healthy(&self.config))
            .unwrap_or(false);
        let still_capable = state.capabilities.iter().any(|c| {
            c.backend_id == cached
                && c.operation_kind == operation.kind
                && c.required_keys.iter().all(|k| operation.has_key(k))
        });
        drop(state);

        if healthy && still_capable {
            return Some(cached);
        }

        if !healthy {
            debug!(backend = %cached, operation = %operation.kind, "Invalidating cached route to unhealthy backend");
            self.cache.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
        }
        None
    }

    fn score(&self, capability: &BackendCapability, metrics: &BackendMetrics, now: chrono::DateTime<Utc>) -> f64 {
        let availability = metrics.availability(now, &self.config);
        let error_factor = (100.0 - metrics.error_rate * 100.0) / 100.0;

        PERFORMANCE_WEIGHT * capability.performance_score
            + AVAILABILITY_WEIGHT * availability
            + ERROR_RATE_WEIGHT * error_factor
            + RELIABILITY_WEIGHT * capability.reliability_score
    }

    /// Routes `operation` and runs it, then tries each declared fallback
    /// backend in order, skipping unhealthy ones.
    ///
    /// Every call updates that backend's metrics. A routing failure is
    /// returned as `Error::Routing`; if every attempted backend fails the
    /// error is `Error::Backend` carrying the last failure kind.
    pub async fn execute(&self, operation: &Operation, cancel: Option<&CancellationToken>) -> Result<BackendResponse> {
        let primary = self.route(operation)?;

        let mut chain = vec![primary];
        for fallback in &operation.fallback_backends {
            if !chain.contains(fallback) {
                chain.push(fallback.clone());
            }
        }

        let mut failures: Vec<(String, BackendFailure)> = Vec::new();

        for (index, backend_id) in chain.iter().enumerate() {
            if index > 0 && !self.is_healthy(backend_id) {
                debug!(backend = %backend_id, "Skipping unhealthy fallback backend");
                continue;
            }

            let Some(backend) = self.backend(backend_id) else {
                warn!(backend = %backend_id, "Backend has no registered implementation");
                failures.push((
                    backend_id.clone(),
                    BackendFailure::new("BackendError", "no implementation registered"),
                ));
                continue;
            };

            if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
                return Err(Error::Cancelled);
            }

            let started = Instant::now();
            let call = tokio::time::timeout(
                operation.timeout,
                backend.execute(&operation.kind, &operation.parameters, &operation.context, operation.timeout),
            );
            let result = match cancel {
                Some(token) => {
                    tokio::select! {
                        result = call => result,
                        _ = token.cancelled() => {
                            debug!(backend = %backend_id, "Backend call abandoned on cancellation");
                            return Err(Error::Cancelled);
                        }
                    }
                }
                None => call.await,
            };
            let elapsed = started.elapsed();

            let result = match result {
                Ok(inner) => inner,
                Err(_) => Err(BackendFailure::timeout(operation.timeout)),
            };

            match result {
                Ok(output) => {
                    self.record(backend_id, true, elapsed);
                    if index > 0 {
                        info!(operation = %operation.kind, backend = %backend_id, "Fallback backend succeeded");
                    }
                    return Ok(BackendResponse {
                        backend_id: backend_id.clone(),
                        output,
                        elapsed,
                        failed_backends: failures.into_iter().map(|(id, _)| id).collect(),
                    });
                }
                Err(failure) => {
                    self.record(backend_id, false, elapsed);
                    warn!(
                        operation = %operation.kind,
                        backend = %backend_id,
                        kind = %failure.kind,
                        error = %failure.message,
                        "Backend call failed"
                    );
                    failures.push((backend_id.clone(), failure));
                }
            }
        }

        let summary = failures
            .iter()
            .map(|(id, failure)| format!("{}: {}", id, failure))
            .collect::<Vec<_>>()
            .join("; ");
        let (backend, kind) = failures
            .last()
            .map(|(id, failure)| (id.clone(), failure.kind.clone()))
            .unwrap_or_else(|| (String::new(), "BackendError".to_string()));

        Err(Error::backend(backend, kind, summary))
    }

    /// Folds one call into the backend's metrics and refreshes the scores
    /// of its capabilities
    fn record(&self, backend_id: &str, success: bool, elapsed: Duration) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.ensure_known(backend_id, self.config.uptime_window);

        let (error_rate, speed) = match state.metrics.get_mut(backend_id) {
            Some(metrics) => {
                metrics.record(success, elapsed, self.config.ema_alpha);
                (metrics.error_rate, metrics.speed_score())
            }
            None => return,
        };

        for capability in state.capabilities.iter_mut().filter(|c| c.backend_id == backend_id) {
            capability.reliability_score = 1.0 - error_rate;
            capability.performance_score =
                PERFORMANCE_RETENTION * capability.performance_score + (1.0 - PERFORMANCE_RETENTION) * speed;
        }

        counter!(
            "backend.calls",
            1,
            "backend" => backend_id.to_string(),
            "success" => success.to_string()
        );
        histogram!("backend.latency_ms", elapsed.as_secs_f64() * 1000.0, "backend" => backend_id.to_string());
    }

    fn backend(&self, backend_id: &str) -> Option<Arc<dyn ExecutionBackend>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .backends
            .get(backend_id)
            .cloned()
    }

    /// Unknown backends count as unhealthy
    pub fn is_healthy(&self, backend_id: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .metrics
            .get(backend_id)
            .map(|m| m.is_healthy(&self.config))
            .unwrap_or(false)
    }

    pub fn metrics(&self, backend_id: &str) -> Option<BackendMetrics> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .metrics
            .get(backend_id)
            .cloned()
    }

    pub fn capabilities(&self) -> Vec<BackendCapability> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .capabilities
            .clone()
    }

    /// Metrics and health for every backend, in registration order
    pub fn health_report(&self) -> Vec<BackendHealth> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .order
            .iter()
            .filter_map(|id| state.metrics.get(id))
            .map(|metrics| BackendHealth {
                backend_id: metrics.backend_id.clone(),
                healthy: metrics.is_healthy(&self.config),
                metrics: metrics.clone(),
            })
            .collect()
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
