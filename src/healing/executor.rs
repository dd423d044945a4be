//! Recovery execution
//!
//! Runs a `RecoveryPlan` step by step through an injected `Effector`:
//! execute, wait, verify, retry with backoff, and roll back every attempted
//! step when a step fails or times out. Plans touching the same targets are
//! serialized through per-resource locks.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::ExecutorConfig;
use crate::error::HealResult;
use crate::metrics::{MetricsSource, SystemMetrics};

use super::clock::{within, Clock};
use super::events::{AlertEvent, AlertSink};
use super::history::HistoryStore;
use super::planner::{RecoveryPlan, RecoveryStep};
use super::types::{AnomalyType, RecoveryStrategy};

/// Lifecycle status of a plan execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    InProgress,
    Completed,
    Partial,
    Failed,
}

impl ExecutionStatus {
    /// Status for a finished run. Aborted runs are never completed.
    pub fn from_outcome(success_rate: f64, aborted: bool) -> Self {
        if !aborted && success_rate >= 0.8 {
            ExecutionStatus::Completed
        } else if success_rate >= 0.3 {
            ExecutionStatus::Partial
        } else {
            ExecutionStatus::Failed
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Partial | ExecutionStatus::Failed
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::InProgress => write!(f, "in_progress"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Partial => write!(f, "partial"),
            ExecutionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// State machine transitions recorded on a result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ExecutionPhase {
    Pending,
    Executing { step: usize },
    Verifying { step: usize },
    Aborted { step: usize, reason: String },
    RollingBack,
    Completed,
    Partial,
    Failed,
}

impl From<ExecutionStatus> for ExecutionPhase {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Completed => ExecutionPhase::Completed,
            ExecutionStatus::Partial => ExecutionPhase::Partial,
            ExecutionStatus::Failed => ExecutionPhase::Failed,
            ExecutionStatus::Pending | ExecutionStatus::InProgress => ExecutionPhase::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Verified,
    Failed,
    TimedOut,
}

/// What happened to one forward step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub index: usize,
    pub action: String,
    pub outcome: StepOutcome,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// What happened to one rollback step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackStepRecord {
    pub index: usize,
    pub action: String,
    pub reverts: Option<usize>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RollbackReport {
    pub triggered: bool,
    pub steps: Vec<RollbackStepRecord>,
    /// False if any rollback step failed
    pub success: bool,
}

/// Normalized cause plus human-readable detail
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lesson {
    pub cause: String,
    pub detail: String,
}

impl Lesson {
    pub fn new(cause: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
            detail: detail.into(),
        }
    }
}

/// Outcome of executing one plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub id: String,
    pub plan_id: String,
    pub incident_id: String,
    pub anomaly_type: Option<AnomalyType>,
    pub strategy: RecoveryStrategy,
    pub targets: Vec<String>,
    pub status: ExecutionStatus,
    pub executed_steps: Vec<StepRecord>,
    pub rollback: RollbackReport,
    pub elapsed_ms: u64,
    /// Verified steps / total steps
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_before: Option<SystemMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_after: Option<SystemMetrics>,
    pub lessons_learned: Vec<Lesson>,
    pub transitions: Vec<ExecutionPhase>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RecoveryResult {
    pub fn verified_steps(&self) -> usize {
        self.executed_steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Verified)
            .count()
    }

    pub fn is_completed(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Carries out plan steps against real infrastructure
#[async_trait::async_trait]
pub trait Effector: Send + Sync {
    async fn execute(&self, plan: &RecoveryPlan, step: &RecoveryStep) -> HealResult<()>;

    /// Whether the step took effect
    async fn verify(&self, plan: &RecoveryPlan, step: &RecoveryStep) -> HealResult<bool>;

    async fn rollback(&self, plan: &RecoveryPlan, step: &RecoveryStep) -> HealResult<()>;
}

/// Effector that only logs; every step succeeds
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunEffector;

#[async_trait::async_trait]
impl Effector for DryRunEffector {
    async fn execute(&self, plan: &RecoveryPlan, step: &RecoveryStep) -> HealResult<()> {
        tracing::info!(
            "[dry-run] {} step {}: {} on {:?}",
            plan.strategy,
            step.index,
            step.action,
            plan.targets
        );
        Ok(())
    }

    async fn verify(&self, _plan: &RecoveryPlan, _step: &RecoveryStep) -> HealResult<bool> {
        Ok(true)
    }

    async fn rollback(&self, plan: &RecoveryPlan, step: &RecoveryStep) -> HealResult<()> {
        tracing::info!("[dry-run] {} rollback: {}", plan.strategy, step.action);
        Ok(())
    }
}

type LockRegistry = DashMap<String, Arc<Mutex<()>>>;

/// Held locks for one execution; released on drop
#[derive(Debug)]
pub struct LockSet {
    guards: Vec<OwnedMutexGuard<()>>,
    keys: Vec<String>,
    registry: Arc<LockRegistry>,
    /// Targets that were held by another execution when requested
    pub contended: Vec<String>,
}

impl Drop for LockSet {
    fn drop(&mut self) {
        self.guards.clear();
        // Forget targets nobody else holds or waits on
        for key in &self.keys {
            self.registry
                .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

/// One async mutex per target, kept only while in use
#[derive(Default)]
pub struct ResourceLocks {
    locks: Arc<LockRegistry>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every target, in sorted order so overlapping plans cannot deadlock
    pub async fn acquire(&self, targets: &[String]) -> LockSet {
        let mut keys: Vec<&String> = targets.iter().collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        let mut contended = Vec::new();
        for key in &keys {
            let lock = self
                .locks
                .entry((*key).clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            let guard = match lock.clone().try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => {
                    contended.push((*key).clone());
                    lock.lock_owned().await
                }
            };
            guards.push(guard);
        }

        LockSet {
            guards,
            keys: keys.into_iter().cloned().collect(),
            registry: self.locks.clone(),
            contended,
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Result of one execute+verify attempt
enum Attempt {
    Verified,
    Unverified,
    ExecuteFailed(String),
    VerifyFailed(String),
}

/// Result of running one forward step to completion
struct StepRun {
    record: StepRecord,
    lesson: Option<Lesson>,
    plan_timed_out: bool,
}

pub struct RecoveryExecutor {
    config: ExecutorConfig,
    effector: Arc<dyn Effector>,
    metrics: Arc<dyn MetricsSource>,
    history: Arc<dyn HistoryStore>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    locks: ResourceLocks,
}

impl RecoveryExecutor {
    pub fn new(
        config: ExecutorConfig,
        effector: Arc<dyn Effector>,
        metrics: Arc<dyn MetricsSource>,
        history: Arc<dyn HistoryStore>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            effector,
            metrics,
            history,
            alerts,
            clock,
            locks: ResourceLocks::new(),
        }
    }

    pub fn locks(&self) -> &ResourceLocks {
        &self.locks
    }

    /// Execute a plan to a terminal status. Failures are reported on the
    /// result, never returned as errors.
    pub async fn execute(&self, plan: &mut RecoveryPlan) -> RecoveryResult {
        let lock_set = self.locks.acquire(&plan.targets).await;
        plan.execution_status = ExecutionStatus::InProgress;

        let result = self.run(plan, &lock_set.contended).await;
        drop(lock_set);

        plan.execution_status = result.status;
        if let Err(e) = self.history.append(result.clone()).await {
            tracing::error!("Failed to record recovery result {}: {}", result.id, e);
        }
        result
    }

    async fn run(&self, plan: &RecoveryPlan, contended: &[String]) -> RecoveryResult {
        let started_at = self.clock.now();
        let mut lessons = Vec::new();
        if !contended.is_empty() {
            lessons.push(Lesson::new(
                "lock_wait",
                format!("waited for targets {:?}", contended),
            ));
        }

        let metrics_before = self.capture_metrics().await;
        let deadline = started_at + super::clock::to_chrono(self.config.plan_timeout());

        let mut transitions = vec![ExecutionPhase::Pending];
        let mut executed_steps: Vec<StepRecord> = Vec::new();
        let mut aborted: Option<(usize, String)> = None;

        for step in &plan.steps {
            let run = match self.run_step(plan, step, deadline, &mut transitions).await {
                Some(run) => run,
                None => {
                    // Plan budget spent before this step started
                    lessons.push(Lesson::new(
                        "plan_timeout",
                        format!("plan timed out before step '{}'", step.action),
                    ));
                    aborted = Some((step.index, "plan timeout".to_string()));
                    break;
                }
            };

            let outcome = run.record.outcome;
            let reason = run.record.error.clone().unwrap_or_default();
            if let Some(lesson) = run.lesson {
                lessons.push(lesson);
            }
            if run.plan_timed_out {
                lessons.push(Lesson::new(
                    "plan_timeout",
                    format!("plan timed out during step '{}'", step.action),
                ));
            }
            executed_steps.push(run.record);

            if outcome != StepOutcome::Verified {
                aborted = Some((step.index, reason));
                break;
            }
        }

        let mut rollback = RollbackReport {
            triggered: false,
            steps: Vec::new(),
            success: true,
        };

        if let Some((step, reason)) = &aborted {
            tracing::warn!(
                "Recovery plan {} ({}) aborted at step {}: {}",
                plan.id,
                plan.strategy,
                step,
                reason
            );
            transitions.push(ExecutionPhase::Aborted {
                step: *step,
                reason: reason.clone(),
            });
            self.alerts
                .emit(AlertEvent::execution_aborted(&plan.id, &plan.targets, reason));

            // Undo everything that was attempted, newest first
            match executed_steps.last() {
                Some(last) => {
                    transitions.push(ExecutionPhase::RollingBack);
                    rollback = self.roll_back(plan, last.index, &mut lessons).await;
                }
                None => {
                    rollback.triggered = true;
                }
            }
        }

        let total = plan.steps.len();
        let verified = executed_steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Verified)
            .count();
        let success_rate = if total == 0 {
            0.0
        } else {
            verified as f64 / total as f64
        };
        let status = ExecutionStatus::from_outcome(success_rate, aborted.is_some());
        transitions.push(status.into());

        if status == ExecutionStatus::Failed {
            self.alerts.emit(AlertEvent::execution_failed(
                &plan.id,
                &plan.targets,
                success_rate,
            ));
        }

        let metrics_after = self.capture_metrics().await;
        let finished_at = self.clock.now();

        let result = RecoveryResult {
            id: uuid::Uuid::new_v4().to_string(),
            plan_id: plan.id.clone(),
            incident_id: plan.incident_id.clone(),
            anomaly_type: plan.anomaly_type,
            strategy: plan.strategy,
            targets: plan.targets.clone(),
            status,
            executed_steps,
            rollback,
            elapsed_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            success_rate,
            metrics_before,
            metrics_after,
            lessons_learned: lessons,
            transitions,
            started_at,
            finished_at,
        };

        tracing::info!(
            "Recovery plan {} ({}) finished: {} ({}/{} steps verified, {}ms)",
            result.plan_id,
            result.strategy,
            result.status,
            verified,
            total,
            result.elapsed_ms
        );
        result
    }

    /// Run one step with retries. `None` if the plan deadline already passed.
    async fn run_step(
        &self,
        plan: &RecoveryPlan,
        step: &RecoveryStep,
        deadline: DateTime<Utc>,
        transitions: &mut Vec<ExecutionPhase>,
    ) -> Option<StepRun> {
        let step_started = self.clock.now();
        let max_attempts = self.config.max_step_retries + 1;
        let mut attempts = 0;

        loop {
            let remaining = deadline - self.clock.now();
            let remaining = remaining.to_std().unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                if attempts == 0 {
                    return None;
                }
                return Some(self.finish_step(
                    step,
                    StepOutcome::TimedOut,
                    attempts,
                    Some("plan timeout".to_string()),
                    step_started,
                    None,
                    true,
                ));
            }
            let step_timeout = self.config.step_timeout();
            let (limit, plan_bound) = if remaining < step_timeout {
                (remaining, true)
            } else {
                (step_timeout, false)
            };

            attempts += 1;
            transitions.push(ExecutionPhase::Executing { step: step.index });

            let attempt = within(self.clock.as_ref(), limit, self.attempt(plan, step)).await;
            let (error, cause) = match attempt {
                Some(Attempt::Verified) => {
                    transitions.push(ExecutionPhase::Verifying { step: step.index });
                    return Some(self.finish_step(
                        step,
                        StepOutcome::Verified,
                        attempts,
                        None,
                        step_started,
                        None,
                        false,
                    ));
                }
                Some(Attempt::Unverified) => {
                    transitions.push(ExecutionPhase::Verifying { step: step.index });
                    (
                        "verification failed".to_string(),
                        format!("verification_failed:{}", step.action),
                    )
                }
                Some(Attempt::VerifyFailed(e)) => {
                    transitions.push(ExecutionPhase::Verifying { step: step.index });
                    (e, format!("verification_failed:{}", step.action))
                }
                Some(Attempt::ExecuteFailed(e)) => (e, format!("step_failed:{}", step.action)),
                None => {
                    // Timeouts abort without retry
                    let error = format!("timed out after {}ms", limit.as_millis());
                    let lesson = (!plan_bound).then(|| {
                        Lesson::new(format!("step_timeout:{}", step.action), error.clone())
                    });
                    return Some(self.finish_step(
                        step,
                        StepOutcome::TimedOut,
                        attempts,
                        Some(error),
                        step_started,
                        lesson,
                        plan_bound,
                    ));
                }
            };

            tracing::debug!(
                "Step {} '{}' attempt {}/{} failed: {}",
                step.index,
                step.action,
                attempts,
                max_attempts,
                error
            );

            if attempts >= max_attempts {
                let lesson = Lesson::new(
                    cause,
                    format!("{} after {} attempts", error, attempts),
                );
                return Some(self.finish_step(
                    step,
                    StepOutcome::Failed,
                    attempts,
                    Some(error),
                    step_started,
                    Some(lesson),
                    false,
                ));
            }

            self.clock.sleep(self.config.retry_backoff()).await;
        }
    }

    async fn attempt(&self, plan: &RecoveryPlan, step: &RecoveryStep) -> Attempt {
        if let Err(e) = self.effector.execute(plan, step).await {
            return Attempt::ExecuteFailed(e.to_string());
        }
        self.clock.sleep(self.config.verify_delay()).await;
        match self.effector.verify(plan, step).await {
            Ok(true) => Attempt::Verified,
            Ok(false) => Attempt::Unverified,
            Err(e) => Attempt::VerifyFailed(e.to_string()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_step(
        &self,
        step: &RecoveryStep,
        outcome: StepOutcome,
        attempts: u32,
        error: Option<String>,
        started: DateTime<Utc>,
        lesson: Option<Lesson>,
        plan_timed_out: bool,
    ) -> StepRun {
        StepRun {
            record: StepRecord {
                index: step.index,
                action: step.action.clone(),
                outcome,
                attempts,
                error,
                elapsed_ms: (self.clock.now() - started).num_milliseconds().max(0) as u64,
            },
            lesson,
            plan_timed_out,
        }
    }

    /// Run rollback steps undoing forward steps `0..=last`
    async fn roll_back(
        &self,
        plan: &RecoveryPlan,
        last: usize,
        lessons: &mut Vec<Lesson>,
    ) -> RollbackReport {
        let mut report = RollbackReport {
            triggered: true,
            steps: Vec::new(),
            success: true,
        };

        for step in plan.rollback_through(last) {
            let outcome = within(
                self.clock.as_ref(),
                self.config.step_timeout(),
                self.effector.rollback(plan, step),
            )
            .await;
            let error = match outcome {
                Some(Ok(())) => None,
                Some(Err(e)) => Some(e.to_string()),
                None => Some(format!(
                    "timed out after {}ms",
                    self.config.step_timeout().as_millis()
                )),
            };

            if let Some(error) = &error {
                report.success = false;
                tracing::error!(
                    "Rollback step '{}' of plan {} failed: {}",
                    step.action,
                    plan.id,
                    error
                );
                lessons.push(Lesson::new(
                    format!("rollback_failed:{}", step.action),
                    error.clone(),
                ));
                self.alerts.emit(AlertEvent::rollback_failed(
                    &plan.id,
                    &plan.targets,
                    &step.action,
                    error,
                ));
            }

            report.steps.push(RollbackStepRecord {
                index: step.index,
                action: step.action.clone(),
                reverts: step.reverts,
                success: error.is_none(),
                error,
            });
        }

        report
    }

    async fn capture_metrics(&self) -> Option<SystemMetrics> {
        match self.metrics.snapshot().await {
            Ok(metrics) => Some(metrics.clamped()),
            Err(e) => {
                tracing::warn!("Could not capture metrics snapshot: {}", e);
                None
            }
        }
    }
}
