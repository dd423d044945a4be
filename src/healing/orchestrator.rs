//! Healing orchestrator
//!
//! Background loop that closes the healing cycle: sample metrics, detect
//! anomalies, plan and execute recoveries, sweep provider health, fail over
//! unavailable providers and periodically run a learning epoch.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::HealingConfig;
use crate::error::HealResult;
use crate::metrics::{MetricsSource, MetricsWindow, SystemMetrics};

use super::clock::Clock;
use super::detector::AnomalyDetector;
use super::events::{AlertEvent, AlertSink};
use super::executor::{Effector, ExecutionStatus, RecoveryExecutor, RecoveryResult};
use super::failover::{FailoverCoordinator, FailoverPlan, FailureKind, ServiceFailure};
use super::health::{HealthMonitor, HealthStatus, ProviderProbe, ServiceHealth};
use super::history::{HistoryStore, InMemoryHistoryStore, TimeWindow};
use super::learning::{LearningEngine, LearningUpdate};
use super::planner::{Incident, RecoveryPlan, RecoveryPlanner};
use super::tables::{HealingTables, TableStore};
use super::types::{Anomaly, Severity};

/// External collaborators injected into the orchestrator
pub struct Collaborators {
    pub effector: Arc<dyn Effector>,
    pub probe: Arc<dyn ProviderProbe>,
    pub metrics: Arc<dyn MetricsSource>,
    pub alerts: Arc<dyn AlertSink>,
    pub clock: Arc<dyn Clock>,
    /// Defaults to an in-memory store sized by the history config
    pub history: Option<Arc<dyn HistoryStore>>,
}

/// Everything produced from one metrics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsOutcome {
    pub anomalies: Vec<Anomaly>,
    pub plans: Vec<RecoveryPlan>,
    pub results: Vec<RecoveryResult>,
}

/// Everything produced from one failure batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverOutcome {
    pub plan: FailoverPlan,
    /// Present when the plan was valid and executed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<RecoveryResult>,
}

/// Statistics from a healing cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealingCycleStats {
    /// Anomalies detected in the sampled metrics
    pub anomalies_detected: u32,
    /// Recovery plans executed (including failovers)
    pub plans_executed: u32,
    pub plans_completed: u32,
    pub plans_partial: u32,
    pub plans_failed: u32,
    /// Providers reported unavailable
    pub providers_unavailable: u32,
    /// Providers reported degraded
    pub providers_degraded: u32,
    /// Failover plans coordinated
    pub failovers: u32,
    /// Failover plans that needed an operator
    pub escalations: u32,
    /// Table version published by a learning epoch this cycle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_version: Option<u64>,
    /// Errors during the cycle
    pub errors: Vec<String>,
    /// Duration of the cycle in milliseconds
    pub duration_ms: u64,
}

impl HealingCycleStats {
    fn record(&mut self, result: &RecoveryResult) {
        self.plans_executed += 1;
        match result.status {
            ExecutionStatus::Completed => self.plans_completed += 1,
            ExecutionStatus::Partial => self.plans_partial += 1,
            ExecutionStatus::Failed => self.plans_failed += 1,
            ExecutionStatus::Pending | ExecutionStatus::InProgress => {}
        }
    }

    fn is_quiet(&self) -> bool {
        self.anomalies_detected == 0
            && self.plans_executed == 0
            && self.failovers == 0
            && self.learning_version.is_none()
    }
}

/// Overall healing system status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealingStatus {
    pub table_version: u64,
    /// Providers configured for monitoring
    pub providers_monitored: usize,
    pub providers_circuit_open: usize,
    /// Cached records that are not healthy
    pub providers_unhealthy: usize,
    /// Snapshots in the rolling window
    pub metrics_samples: usize,
    /// Targets currently locked or awaited by an execution
    pub tracked_targets: usize,
    pub cycles_run: u64,
    /// Last healing cycle time
    pub last_cycle: Option<DateTime<Utc>>,
}

pub struct HealingOrchestrator {
    config: HealingConfig,
    tables: TableStore,
    detector: AnomalyDetector,
    monitor: HealthMonitor,
    coordinator: FailoverCoordinator,
    executor: RecoveryExecutor,
    learning: LearningEngine,
    history: Arc<dyn HistoryStore>,
    metrics: Arc<dyn MetricsSource>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    window: Mutex<MetricsWindow>,
    /// Serializes learning epochs; holds the finish time of the newest
    /// result already folded into a published epoch
    learned_through: tokio::sync::Mutex<Option<DateTime<Utc>>>,
    cycles: AtomicU64,
    last_cycle: Mutex<Option<DateTime<Utc>>>,
}

impl HealingOrchestrator {
    pub fn new(config: HealingConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            effector,
            probe,
            metrics,
            alerts,
            clock,
            history,
        } = collaborators;
        let history: Arc<dyn HistoryStore> = match history {
            Some(history) => history,
            None => Arc::new(InMemoryHistoryStore::new(&config.history, clock.clone())),
        };

        Self {
            tables: TableStore::from_config(&config),
            detector: AnomalyDetector::new(config.orchestrator.system_target.clone()),
            monitor: HealthMonitor::new(&config, probe, clock.clone(), alerts.clone()),
            coordinator: FailoverCoordinator::new(&config, alerts.clone()),
            executor: RecoveryExecutor::new(
                config.executor.clone(),
                effector,
                metrics.clone(),
                history.clone(),
                alerts.clone(),
                clock.clone(),
            ),
            learning: LearningEngine::new(&config.learning),
            window: Mutex::new(MetricsWindow::new(config.orchestrator.metrics_window)),
            history,
            metrics,
            alerts,
            clock,
            learned_through: tokio::sync::Mutex::new(None),
            cycles: AtomicU64::new(0),
            last_cycle: Mutex::new(None),
            config,
        }
    }

    /// Current table snapshot
    pub fn tables(&self) -> Arc<HealingTables> {
        self.tables.snapshot()
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    /// Record a snapshot and detect anomalies in it
    pub fn observe(&self, metrics: SystemMetrics) -> Vec<Anomaly> {
        let tables = self.tables.snapshot();
        let anomalies = self.detector.detect(&metrics, &tables);
        self.window.lock().push(metrics);

        for anomaly in anomalies.iter().filter(|a| a.is_critical()) {
            tracing::warn!(
                "Critical anomaly {}: {}",
                anomaly.anomaly_type,
                anomaly.description
            );
            self.alerts.emit(AlertEvent::critical_anomaly(anomaly));
        }
        anomalies
    }

    /// Detect, plan and execute recoveries for one snapshot. Plans on
    /// disjoint targets run concurrently.
    pub async fn handle_metrics(&self, metrics: SystemMetrics) -> MetricsOutcome {
        let anomalies = self.observe(metrics);
        let tables = self.tables.snapshot();
        let mut plans: Vec<RecoveryPlan> = anomalies
            .iter()
            .map(|anomaly| RecoveryPlanner::plan(&Incident::from(anomaly), &tables))
            .collect();

        let results = join_all(plans.iter_mut().map(|plan| self.executor.execute(plan))).await;

        MetricsOutcome {
            anomalies,
            plans,
            results,
        }
    }

    /// Coordinate a failover for a batch of failures and execute it if a
    /// healthy backup exists
    pub async fn handle_failures(&self, failures: &[ServiceFailure]) -> FailoverOutcome {
        let mut provider_ids = self.monitor.provider_ids();
        for failure in failures {
            if !provider_ids.contains(&failure.provider_id) {
                provider_ids.push(failure.provider_id.clone());
            }
        }
        let health: BTreeMap<String, ServiceHealth> = self
            .monitor
            .poll_all(&provider_ids)
            .await
            .into_iter()
            .map(|record| (record.provider_id.clone(), record))
            .collect();

        let plan = self.coordinator.coordinate(failures, &health);
        if !plan.valid {
            return FailoverOutcome { plan, result: None };
        }

        let mut recovery = plan.to_recovery_plan(self.tables.version());
        let result = self.executor.execute(&mut recovery).await;
        FailoverOutcome {
            plan,
            result: Some(result),
        }
    }

    /// Learn from the recent history window and publish the update as one
    /// table epoch. Updates that change nothing are not published.
    ///
    /// Epochs run one at a time, and each only sees results that finished
    /// after the last published epoch, so a result adjusts confidence once.
    pub async fn run_learning_epoch(&self) -> HealResult<LearningUpdate> {
        let mut learned_through = self.learned_through.lock().await;
        let mut window =
            TimeWindow::last_hours(self.clock.now(), self.config.learning.window_hours);
        if let Some(through) = *learned_through {
            window.start = window.start.max(through + chrono::Duration::nanoseconds(1));
        }
        let history = self.history.query(window).await?;
        let tables = self.tables.snapshot();
        let update = self.learning.learn(&history, &tables);

        if update.changes_nothing() {
            tracing::debug!(
                "Learning epoch over {} results: no table changes",
                update.results_analyzed
            );
            return Ok(update);
        }

        let version = self.tables.apply(&update)?;
        *learned_through = Some(
            history
                .results
                .iter()
                .map(|r| r.finished_at)
                .max()
                .unwrap_or(window.end),
        );
        tracing::info!(
            "Learning epoch published table v{}: {} strategy changes, {} confidence deltas, {} recommendations",
            version,
            update.strategy_table.len(),
            update.confidence_deltas.len(),
            update.recommendations.len()
        );
        Ok(update)
    }

    /// Run a single healing cycle
    pub async fn run_cycle(&self) -> HealResult<HealingCycleStats> {
        let started = self.clock.now();
        let mut stats = HealingCycleStats::default();

        // 1. Sample metrics and heal what they show
        match self.metrics.snapshot().await {
            Ok(metrics) => {
                let outcome = self.handle_metrics(metrics).await;
                stats.anomalies_detected = outcome.anomalies.len() as u32;
                for result in &outcome.results {
                    stats.record(result);
                }
            }
            Err(e) => stats.errors.push(format!("Metrics sampling: {}", e)),
        }

        // 2. Sweep provider health
        let failures = self.sweep_providers(&mut stats).await;

        // 3. Fail over unavailable providers
        if !failures.is_empty() {
            let outcome = self.handle_failures(&failures).await;
            stats.failovers += 1;
            if outcome.plan.escalation.is_some() {
                stats.escalations += 1;
            }
            if let Some(result) = &outcome.result {
                stats.record(result);
            }
        }

        // 4. Periodic learning epoch
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let every = self.config.orchestrator.learning_every_cycles;
        if every > 0 && cycle % every == 0 {
            match self.run_learning_epoch().await {
                Ok(update) if !update.changes_nothing() => {
                    stats.learning_version = Some(self.tables.version());
                }
                Ok(_) => {}
                Err(e) => stats.errors.push(format!("Learning epoch: {}", e)),
            }
        }

        let finished = self.clock.now();
        *self.last_cycle.lock() = Some(finished);
        stats.duration_ms = (finished - started).num_milliseconds().max(0) as u64;
        Ok(stats)
    }

    /// Start the background healing loop
    pub async fn start(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.orchestrator.scan_interval_secs);

        loop {
            match self.run_cycle().await {
                Ok(stats) => {
                    if !stats.is_quiet() {
                        tracing::info!(
                            "Healing cycle complete: {} anomalies, {} plans ({} completed, {} partial, {} failed), {} failovers",
                            stats.anomalies_detected,
                            stats.plans_executed,
                            stats.plans_completed,
                            stats.plans_partial,
                            stats.plans_failed,
                            stats.failovers
                        );
                    }
                    for error in &stats.errors {
                        tracing::error!("Healing cycle error: {}", error);
                    }
                }
                Err(e) => {
                    tracing::error!("Healing cycle failed: {}", e);
                }
            }

            self.clock.sleep(interval).await;
        }
    }

    pub fn status(&self) -> HealingStatus {
        let snapshot = self.monitor.snapshot();
        HealingStatus {
            table_version: self.tables.version(),
            providers_monitored: self.monitor.provider_ids().len(),
            providers_circuit_open: self.monitor.open_circuits(),
            providers_unhealthy: snapshot
                .values()
                .filter(|h| h.status != HealthStatus::Healthy)
                .count(),
            metrics_samples: self.window.lock().len(),
            tracked_targets: self.executor.locks().len(),
            cycles_run: self.cycles.load(Ordering::SeqCst),
            last_cycle: *self.last_cycle.lock(),
        }
    }

    /// Poll every provider; unavailable ones become failures
    async fn sweep_providers(&self, stats: &mut HealingCycleStats) -> Vec<ServiceFailure> {
        let records = self.monitor.poll_all(&self.monitor.provider_ids()).await;
        let mut failures = Vec::new();
        for record in records {
            match record.status {
                HealthStatus::Unavailable => {
                    stats.providers_unavailable += 1;
                    let mut failure = ServiceFailure::new(
                        &record.provider_id,
                        FailureKind::ServerError,
                        Severity::High,
                        "provider unavailable",
                    );
                    failure.occurred_at = record.last_checked;
                    failures.push(failure);
                }
                HealthStatus::Degraded => {
                    stats.providers_degraded += 1;
                    tracing::warn!(
                        "Provider {} degraded (quality {:.2})",
                        record.provider_id,
                        record.quality_score
                    );
                }
                HealthStatus::Healthy | HealthStatus::Unknown => {}
            }
        }
        failures
    }
}
