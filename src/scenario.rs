//! Scenario replay
//!
//! A scenario is a JSON document of provider samples, metric snapshots and
//! failures. Replaying it drives an orchestrator and collects every record
//! it produces, in order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::HealResult;
use crate::healing::{
    Anomaly, FailoverPlan, HealingOrchestrator, HealingStatus, LearningUpdate, RawProviderMetrics,
    RecoveryPlan, RecoveryResult, ServiceFailure, StaticProbe,
};
use crate::metrics::SystemMetrics;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scenario {
    /// Probe samples keyed by provider
    #[serde(default)]
    pub providers: BTreeMap<String, RawProviderMetrics>,

    /// Snapshots replayed in order
    #[serde(default)]
    pub metrics: Vec<SystemMetrics>,

    /// Handled as one failover batch after the snapshots
    #[serde(default)]
    pub failures: Vec<ServiceFailure>,
}

impl Scenario {
    pub fn from_json_str(raw: &str) -> HealResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> HealResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Load the provider samples into a probe
    pub fn seed(&self, probe: &StaticProbe) {
        for (id, sample) in &self.providers {
            probe.set(id, sample.clone());
        }
    }
}

/// One emitted record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum ScenarioRecord {
    Anomaly(Anomaly),
    Plan(RecoveryPlan),
    Result(RecoveryResult),
    Failover(FailoverPlan),
    Learning(LearningUpdate),
    Status(HealingStatus),
}

impl ScenarioRecord {
    pub fn to_json_line(&self) -> HealResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Replay a scenario. The probe must already be seeded.
pub async fn replay(
    orchestrator: &HealingOrchestrator,
    scenario: &Scenario,
    learn: bool,
) -> HealResult<Vec<ScenarioRecord>> {
    let mut records = Vec::new();

    for snapshot in &scenario.metrics {
        let outcome = orchestrator.handle_metrics(snapshot.clone()).await;
        records.extend(outcome.anomalies.into_iter().map(ScenarioRecord::Anomaly));
        records.extend(outcome.plans.into_iter().map(ScenarioRecord::Plan));
        records.extend(outcome.results.into_iter().map(ScenarioRecord::Result));
    }

    if !scenario.failures.is_empty() {
        let outcome = orchestrator.handle_failures(&scenario.failures).await;
        records.push(ScenarioRecord::Failover(outcome.plan));
        if let Some(result) = outcome.result {
            records.push(ScenarioRecord::Result(result));
        }
    }

    if learn {
        let update = orchestrator.run_learning_epoch().await?;
        records.push(ScenarioRecord::Learning(update));
    }

    records.push(ScenarioRecord::Status(orchestrator.status()));
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_scenario() {
        let scenario = Scenario::from_json_str(
            r#"{
                "metrics": [{"timestamp": "2024-01-01T00:00:00Z", "cpu_usage": 85.0}],
                "failures": [{"provider_id": "openai", "kind": "timeout", "message": "slow", "severity": "high"}]
            }"#,
        )
        .unwrap();
        assert!(scenario.providers.is_empty());
        assert_eq!(scenario.metrics.len(), 1);
        assert_eq!(scenario.metrics[0].cpu_usage, 85.0);
        assert_eq!(scenario.failures[0].provider_id, "openai");
    }

    #[test]
    fn test_seed_probe() {
        let mut scenario = Scenario::default();
        scenario.providers.insert(
            "local".to_string(),
            RawProviderMetrics {
                response_time_ms: 100.0,
                success_rate: 99.0,
                error_rate: 1.0,
                uptime: 99.9,
                capacity_utilization: 10.0,
            },
        );
        let probe = StaticProbe::new();
        scenario.seed(&probe);
        assert!(tokio_test::block_on(crate::healing::ProviderProbe::probe(&probe, "local")).is_ok());
    }

    #[test]
    fn test_record_tagging() {
        let line = ScenarioRecord::Status(HealingStatus::default())
            .to_json_line()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["record"], "status");
        assert_eq!(value["table_version"], 0);
    }
}
