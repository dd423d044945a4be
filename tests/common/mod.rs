//! Common test utilities for healing tests
//!
//! Provides shared helpers for:
//! - Fast executor settings and provider samples
//! - A scripted effector with per-action failures
//! - Building an orchestrator wired to in-memory collaborators

#![allow(dead_code)]

use parking_lot::Mutex;
use selfheal::config::{ExecutorConfig, HealingConfig};
use selfheal::healing::{
    Collaborators, Effector, HealingOrchestrator, ManualClock, MemoryAlertSink,
    RawProviderMetrics, RecoveryPlan, RecoveryStep, StaticProbe,
};
use selfheal::{HealError, HealResult, StaticMetricsSource, SystemMetrics};
use std::collections::BTreeSet;
use std::sync::Arc;

pub fn fast_executor() -> ExecutorConfig {
    ExecutorConfig {
        max_step_retries: 2,
        step_timeout_secs: 5,
        plan_timeout_secs: 60,
        verify_delay_ms: 10,
        retry_backoff_ms: 10,
    }
}

pub fn fast_config() -> HealingConfig {
    HealingConfig {
        executor: fast_executor(),
        ..Default::default()
    }
}

pub fn healthy_sample() -> RawProviderMetrics {
    RawProviderMetrics {
        response_time_ms: 400.0,
        success_rate: 99.5,
        error_rate: 0.5,
        uptime: 99.9,
        capacity_utilization: 40.0,
    }
}

pub fn down_sample() -> RawProviderMetrics {
    RawProviderMetrics {
        response_time_ms: 20_000.0,
        success_rate: 10.0,
        error_rate: 90.0,
        uptime: 50.0,
        capacity_utilization: 100.0,
    }
}

/// cpu=85, mem=90, response time 3.0s
pub fn degraded_metrics() -> SystemMetrics {
    let mut metrics = SystemMetrics::at(chrono::Utc::now());
    metrics.cpu_usage = 85.0;
    metrics.memory_usage = 90.0;
    metrics.response_time = 3.0;
    metrics
}

/// Effector that fails the named actions and records every call
#[derive(Default)]
pub struct ScriptedEffector {
    fail: BTreeSet<String>,
    fail_rollback: BTreeSet<String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedEffector {
    pub fn failing(actions: &[&str]) -> Self {
        Self {
            fail: actions.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_failing_rollback(mut self, actions: &[&str]) -> Self {
        self.fail_rollback = actions.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn attempts(&self, action: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == action).count()
    }
}

#[async_trait::async_trait]
impl Effector for ScriptedEffector {
    async fn execute(&self, _plan: &RecoveryPlan, step: &RecoveryStep) -> HealResult<()> {
        self.calls.lock().push(step.action.clone());
        tokio::task::yield_now().await;
        if self.fail.contains(&step.action) {
            return Err(HealError::Effector(format!("{} rejected", step.action)));
        }
        Ok(())
    }

    async fn verify(&self, _plan: &RecoveryPlan, _step: &RecoveryStep) -> HealResult<bool> {
        Ok(true)
    }

    async fn rollback(&self, _plan: &RecoveryPlan, step: &RecoveryStep) -> HealResult<()> {
        self.calls.lock().push(step.action.clone());
        if self.fail_rollback.contains(&step.action) {
            return Err(HealError::Effector(format!("{} rollback rejected", step.action)));
        }
        Ok(())
    }
}

pub struct TestEnv {
    pub orchestrator: Arc<HealingOrchestrator>,
    pub probe: Arc<StaticProbe>,
    pub metrics: Arc<StaticMetricsSource>,
    pub alerts: Arc<MemoryAlertSink>,
    pub clock: Arc<ManualClock>,
}

/// Orchestrator with every configured provider reporting healthy
pub fn create_test_env(config: HealingConfig, effector: Arc<dyn Effector>) -> TestEnv {
    let clock = Arc::new(ManualClock::default());
    let probe = Arc::new(StaticProbe::new());
    for id in config.providers.keys() {
        probe.set(id, healthy_sample());
    }
    let metrics = Arc::new(StaticMetricsSource::new(SystemMetrics::at(clock_now(&clock))));
    let alerts = Arc::new(MemoryAlertSink::new());

    let orchestrator = Arc::new(HealingOrchestrator::new(
        config,
        Collaborators {
            effector,
            probe: probe.clone(),
            metrics: metrics.clone(),
            alerts: alerts.clone(),
            clock: clock.clone(),
            history: None,
        },
    ));

    TestEnv {
        orchestrator,
        probe,
        metrics,
        alerts,
        clock,
    }
}

fn clock_now(clock: &ManualClock) -> chrono::DateTime<chrono::Utc> {
    selfheal::healing::Clock::now(clock)
}

/// Plan with `actions` as its forward steps and matching inverse steps
pub fn plan_with_steps(template: RecoveryPlan, actions: &[&str]) -> RecoveryPlan {
    let mut plan = template;
    plan.steps = actions
        .iter()
        .enumerate()
        .map(|(index, action)| RecoveryStep {
            index,
            action: action.to_string(),
            description: format!("Run {}", action),
            reverts: None,
        })
        .collect();
    plan.rollback_steps = actions
        .iter()
        .enumerate()
        .rev()
        .enumerate()
        .map(|(index, (reverts, action))| RecoveryStep {
            index,
            action: format!("revert_{}", action),
            description: format!("Undo {}", action),
            reverts: Some(reverts),
        })
        .collect();
    plan
}
