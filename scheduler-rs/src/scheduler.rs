//! The scheduler: validates a task graph and runs its units in dependency
//! order against the backend registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use backend_registry::BackendRegistry;
use error_handling_rs::{
    run_span, CancellationToken, CircuitBreakerRegistry, Error, RecoveryConfig, RecoveryCoordinator, Result,
};

use crate::config::{CancelPolicy, HealingConfig, SchedulerConfig, Settings};
use crate::executor::{SharedContext, UnitExecutor, UnitRun};
use crate::graph::TaskGraph;
use crate::healing::HealingStrategyBank;
use crate::result::{RunMetrics, RunResult, UnitOutcome, UnitReport};
use crate::snapshot::Snapshot;
use crate::unit::WorkUnit;

pub struct Scheduler {
    graph: TaskGraph,
    config: SchedulerConfig,
    registry: Arc<BackendRegistry>,
    coordinator: Arc<RecoveryCoordinator>,
    bank: Arc<HealingStrategyBank>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("units", &self.graph.len())
            .field("config", &self.config)
            .field("healing", &self.bank)
            .finish()
    }
}

impl Scheduler {
    /// Scheduler over a shared registry and coordinator, with default
    /// settings and healing strategies
    pub fn new(registry: Arc<BackendRegistry>, coordinator: Arc<RecoveryCoordinator>) -> Self {
        Self {
            graph: TaskGraph::new(),
            config: SchedulerConfig::default(),
            registry,
            coordinator,
            bank: Arc::new(HealingStrategyBank::with_defaults(&HealingConfig::default())),
        }
    }

    /// Builds the registry, breakers and coordinator from loaded settings
    pub fn from_settings(settings: &Settings) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(settings.circuit_breaker.clone()));
        let coordinator = RecoveryCoordinator::new(settings.recovery.clone()).with_breakers(breakers);
        Self::new(
            Arc::new(BackendRegistry::new(settings.routing.clone())),
            Arc::new(coordinator),
        )
        .with_config(settings.scheduler.clone())
        .with_healing_bank(HealingStrategyBank::with_defaults(&settings.healing))
    }

    /// Scheduler with a private registry and coordinator
    pub fn standalone() -> Self {
        Self::new(
            Arc::new(BackendRegistry::default()),
            Arc::new(RecoveryCoordinator::new(RecoveryConfig::default())),
        )
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_healing_bank(mut self, bank: HealingStrategyBank) -> Self {
        self.bank = Arc::new(bank);
        self
    }

    pub fn with_graph(mut self, graph: TaskGraph) -> Self {
        self.graph = graph;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<RecoveryCoordinator> {
        &self.coordinator
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut TaskGraph {
        &mut self.graph
    }

    pub fn add_unit(&mut self, unit: WorkUnit) -> bool {
        self.graph.add_unit(unit)
    }

    pub fn validate(&self) -> Vec<String> {
        self.graph.validate()
    }

    pub fn execution_order(&self) -> Result<Vec<String>> {
        self.graph.execution_order()
    }

    /// Runs every unit once; see [`run_with_cancel`](Self::run_with_cancel)
    pub async fn run(&mut self, context: BTreeMap<String, String>) -> Result<RunResult> {
        self.run_with_cancel(context, None).await
    }

    /// Merges `context` into the graph's shared context, validates the
    /// graph and runs its units in dependency order.
    ///
    /// An invalid graph is rejected with `Error::Graph` before any unit
    /// runs. Unit failures never abort the run: units that depend on a unit
    /// that did not complete are skipped. Once `cancel` fires no further
    /// units are dispatched and the partial result is returned.
    pub async fn run_with_cancel(
        &mut self,
        context: BTreeMap<String, String>,
        cancel: Option<&CancellationToken>,
    ) -> Result<RunResult> {
        let run_id = Uuid::new_v4().to_string();
        let span = run_span(&run_id);
        self.run_inner(run_id, context, cancel).instrument(span).await
    }

    async fn run_inner(
        &mut self,
        run_id: String,
        context: BTreeMap<String, String>,
        cancel: Option<&CancellationToken>,
    ) -> Result<RunResult> {
        let started_at = Utc::now();
        let started = Instant::now();
        self.graph.merge_context(context);

        let issues = self.graph.validate();
        if !issues.is_empty() {
            error!(issues = ?issues, "Task graph is invalid, refusing to run");
            counter!("scheduler.runs.rejected", 1);
            return Err(Error::Graph { issues });
        }
        let order = self.graph.execution_order()?;

        info!(
            units = order.len(),
            max_parallelism = self.config.max_parallelism,
            "Starting run"
        );

        let shared: SharedContext = Arc::new(RwLock::new(self.graph.context().clone()));
        let executor = UnitExecutor {
            registry: self.registry.clone(),
            coordinator: self.coordinator.clone(),
            bank: self.bank.clone(),
            config: self.config.clone(),
            cancel: match self.config.cancel_policy {
                CancelPolicy::Abandon => cancel.cloned(),
                CancelPolicy::FinishInFlight => None,
            },
        };
        let parallelism = self.config.max_parallelism.max(1);

        let mut waiting: HashMap<String, WorkUnit> = self
            .graph
            .checkout_units()
            .into_iter()
            .map(|mut unit| {
                unit.reset();
                (unit.id.clone(), unit)
            })
            .collect();
        let mut pending: Vec<String> = order.clone();
        let mut outcomes: HashMap<String, UnitOutcome> = HashMap::new();
        let mut blocked: HashMap<String, Vec<String>> = HashMap::new();
        let mut finished: Vec<WorkUnit> = Vec::with_capacity(order.len());
        let mut incidents = Vec::new();
        let mut cancelled = false;
        let mut in_flight = FuturesUnordered::new();

        loop {
            if !cancelled && cancel.is_some_and(CancellationToken::is_cancelled) {
                cancelled = true;
            }

            if !cancelled {
                let mut i = 0;
                while i < pending.len() && in_flight.len() < parallelism {
                    let Some(unmet) = waiting
                        .get(&pending[i])
                        .and_then(|unit| unmet_dependencies(unit, &outcomes))
                    else {
                        i += 1;
                        continue;
                    };

                    let unit_id = pending.remove(i);
                    let Some(unit) = waiting.remove(&unit_id) else {
                        continue;
                    };

                    if unmet.is_empty() {
                        debug!(unit_id = %unit_id, "Dispatching unit");
                        in_flight.push(executor.run(unit, shared.clone()));
                    } else {
                        info!(unit_id = %unit_id, blocked_by = ?unmet, "Skipping unit with unmet dependencies");
                        counter!("scheduler.units.skipped", 1);
                        outcomes.insert(unit_id.clone(), UnitOutcome::Skipped);
                        blocked.insert(unit_id, unmet);
                        finished.push(unit);
                    }
                }
            }

            if in_flight.is_empty() {
                break;
            }

            let next = match cancel {
                Some(token) if !cancelled => {
                    tokio::select! {
                        next = in_flight.next() => next,
                        _ = token.cancelled() => {
                            cancelled = true;
                            warn!(
                                in_flight = in_flight.len(),
                                policy = %self.config.cancel_policy,
                                "Run cancelled, no further units will be dispatched"
                            );
                            continue;
                        }
                    }
                }
                _ => in_flight.next().await,
            };

            let Some(UnitRun { unit, result, incident }) = next else {
                break;
            };

            let outcome = match &result {
                Ok(_) => UnitOutcome::Completed,
                Err(Error::Cancelled) => UnitOutcome::Cancelled,
                Err(e) => {
                    warn!(unit_id = %unit.id, error = %e, "Unit failed");
                    UnitOutcome::Failed
                }
            };
            counter!("scheduler.units.finished", 1, "outcome" => outcome.to_string());
            outcomes.insert(unit.id.clone(), outcome);
            if let Some(incident) = incident {
                incidents.push(incident);
            }
            finished.push(unit);
        }

        let units: HashMap<String, WorkUnit> = finished
            .into_iter()
            .chain(waiting.into_values())
            .map(|unit| (unit.id.clone(), unit))
            .collect();

        let reports: Vec<UnitReport> = order
            .iter()
            .filter_map(|id| {
                let unit = units.get(id)?;
                let outcome = outcomes.get(id).copied().unwrap_or(UnitOutcome::Pending);
                Some(UnitReport::new(unit, outcome, blocked.remove(id).unwrap_or_default()))
            })
            .collect();

        self.graph.restore_units(units.into_values());
        self.graph.replace_context(shared.read().await.clone());

        let wall_time_ms = started.elapsed().as_millis() as u64;
        let metrics = RunMetrics::from_reports(&reports, wall_time_ms);

        gauge!("scheduler.run.success_rate", metrics.success_rate);
        histogram!("scheduler.run.wall_time_ms", wall_time_ms as f64);
        info!(
            completed = metrics.completed,
            failed = metrics.failed,
            skipped = metrics.skipped,
            pending = metrics.pending,
            cancelled = cancelled,
            wall_time_ms = wall_time_ms,
            "Run finished"
        );

        Ok(RunResult {
            run_id,
            units: reports,
            incidents,
            metrics,
            cancelled,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Current graph, backend health, breaker states and incident history
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            units: self.graph.units().cloned().collect(),
            backends: self.registry.health_report(),
            breakers: self.coordinator.breakers().snapshots(),
            incidents: self.coordinator.recent_incidents(self.coordinator.incident_count()),
            timestamp: Utc::now(),
        }
    }
}

/// `None` while some dependency is still unfinished, otherwise the
/// dependencies that did not complete
fn unmet_dependencies(unit: &WorkUnit, outcomes: &HashMap<String, UnitOutcome>) -> Option<Vec<String>> {
    let mut unmet = Vec::new();
    for dep in &unit.dependencies {
        match outcomes.get(dep)? {
            UnitOutcome::Completed => {}
            _ => unmet.push(dep.clone()),
        }
    }
    Some(unmet)
}
