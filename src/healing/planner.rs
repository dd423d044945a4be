//! Recovery planning
//!
//! Turns an incident (a detected anomaly or a reported service failure) into
//! a `RecoveryPlan`: strategy, ordered steps, rollback, risk and success
//! criteria. Planning never fails; incidents without a mapped strategy get a
//! minimal graceful-degradation plan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use crate::config::Thresholds;

use super::executor::ExecutionStatus;
use super::failover::ServiceFailure;
use super::tables::HealingTables;
use super::types::{
    Anomaly, AnomalyType, Criterion, RecoveryStrategy, RiskLevel, Severity, SuccessCriteria,
};

/// What the planner was asked to handle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum IncidentKind {
    Anomaly(AnomalyType),
    /// Failure kind with no anomaly mapping
    Unrecognized(String),
}

/// Input to the planner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub kind: IncidentKind,
    pub severity: Severity,
    pub targets: Vec<String>,
    pub description: String,
    #[serde(default)]
    pub observed: BTreeMap<String, f64>,
}

impl From<&Anomaly> for Incident {
    fn from(anomaly: &Anomaly) -> Self {
        Self {
            id: anomaly.id.clone(),
            kind: IncidentKind::Anomaly(anomaly.anomaly_type),
            severity: anomaly.severity,
            targets: anomaly.affected_targets.clone(),
            description: anomaly.description.clone(),
            observed: anomaly.observed.clone(),
        }
    }
}

impl From<&ServiceFailure> for Incident {
    fn from(failure: &ServiceFailure) -> Self {
        let kind = match failure.kind.anomaly_type() {
            Some(anomaly_type) => IncidentKind::Anomaly(anomaly_type),
            None => IncidentKind::Unrecognized(failure.kind.to_string()),
        };
        Self {
            id: format!(
                "{}-{}",
                failure.provider_id,
                failure.occurred_at.timestamp_millis()
            ),
            kind,
            severity: failure.severity,
            targets: vec![failure.provider_id.clone()],
            description: failure.message.clone(),
            observed: BTreeMap::new(),
        }
    }
}

/// One named action in a plan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryStep {
    pub index: usize,
    pub action: String,
    pub description: String,
    /// Forward step this one undoes (rollback steps only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverts: Option<usize>,
}

/// An executable remediation plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub id: String,
    pub incident_id: String,
    /// `None` when the incident kind was not recognized
    pub anomaly_type: Option<AnomalyType>,
    pub strategy: RecoveryStrategy,
    pub severity: Severity,
    pub targets: Vec<String>,
    pub steps: Vec<RecoveryStep>,
    /// Inverse of `steps`, last step first
    pub rollback_steps: Vec<RecoveryStep>,
    pub estimated_duration_secs: u64,
    pub risk_level: RiskLevel,
    pub success_criteria: SuccessCriteria,
    #[serde(default)]
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub table_version: u64,
    /// Written by the executor only
    pub execution_status: ExecutionStatus,
}

impl RecoveryPlan {
    /// Rollback steps undoing forward steps `0..=last`, in execution order
    pub fn rollback_through(&self, last: usize) -> Vec<&RecoveryStep> {
        self.rollback_steps
            .iter()
            .filter(|step| step.reverts.is_some_and(|i| i <= last))
            .collect()
    }
}

/// (action, description, inverse action)
type StepTemplate = &'static [(&'static str, &'static str, &'static str)];

fn step_template(strategy: RecoveryStrategy) -> StepTemplate {
    match strategy {
        RecoveryStrategy::Failover => &[
            ("detect_primary_failure", "Confirm the primary target is failing", "clear_failure_marker"),
            ("activate_backup", "Bring the backup target online", "deactivate_backup"),
            ("redirect_traffic", "Route traffic to the backup", "restore_primary_traffic"),
            ("verify_backup_health", "Confirm the backup is serving traffic", "release_backup_monitor"),
        ],
        RecoveryStrategy::ScaleUp => &[
            ("assess_capacity", "Measure current headroom", "discard_capacity_assessment"),
            ("provision_instances", "Provision additional instances", "deprovision_instances"),
            ("register_instances", "Register new instances with the balancer", "deregister_instances"),
            ("rebalance_load", "Spread load across the enlarged pool", "restore_load_distribution"),
        ],
        RecoveryStrategy::Restart => &[
            ("drain_connections", "Stop accepting new work and drain in-flight requests", "resume_connections"),
            ("restart_service", "Restart the affected service", "restore_previous_instance"),
            ("run_health_check", "Check the restarted service responds", "clear_health_check"),
            ("resume_traffic", "Send traffic to the restarted service", "drain_connections"),
        ],
        RecoveryStrategy::CircuitBreaker => &[
            ("open_circuit", "Stop sending requests to the failing dependency", "close_circuit"),
            ("route_to_fallback", "Serve requests from the fallback path", "route_to_primary"),
            ("probe_half_open", "Send trial requests through a half-open circuit", "cancel_probe"),
            ("close_circuit", "Close the circuit once trial requests succeed", "open_circuit"),
        ],
        RecoveryStrategy::LoadBalance => &[
            ("analyze_distribution", "Find hot targets in the current distribution", "discard_distribution_analysis"),
            ("adjust_weights", "Shift balancer weights away from hot targets", "restore_weights"),
            ("verify_distribution", "Confirm load is evenly spread", "clear_distribution_check"),
        ],
        RecoveryStrategy::CacheBypass => &[
            ("disable_cache_reads", "Bypass the cache for reads", "enable_cache_reads"),
            ("route_to_origin", "Serve reads from the origin", "route_to_cache"),
            ("monitor_origin_load", "Watch origin load while bypassing", "stop_origin_monitor"),
        ],
        RecoveryStrategy::RateLimit => &[
            ("compute_limits", "Derive per-client limits from current load", "discard_limits"),
            ("apply_rate_limit", "Enforce the computed limits", "remove_rate_limit"),
            ("monitor_rejections", "Watch the rejection rate", "stop_rejection_monitor"),
        ],
        RecoveryStrategy::GracefulDegradation => &[
            ("disable_non_critical_features", "Turn off non-essential features", "enable_non_critical_features"),
            ("serve_cached_responses", "Serve stale responses where possible", "serve_live_responses"),
            ("notify_operators", "Tell operators the system is degraded", "notify_recovery"),
        ],
    }
}

const FALLBACK_TEMPLATE: StepTemplate = &[
    ("enable_degraded_mode", "Enter degraded mode for an unrecognized incident", "disable_degraded_mode"),
    ("notify_operators", "Ask operators to investigate", "notify_recovery"),
];

fn estimated_duration_secs(strategy: RecoveryStrategy) -> u64 {
    match strategy {
        RecoveryStrategy::Failover => 30,
        RecoveryStrategy::ScaleUp => 180,
        RecoveryStrategy::Restart => 60,
        RecoveryStrategy::CircuitBreaker => 15,
        RecoveryStrategy::LoadBalance => 45,
        RecoveryStrategy::CacheBypass => 20,
        RecoveryStrategy::RateLimit => 10,
        RecoveryStrategy::GracefulDegradation => 30,
    }
}

fn base_risk(strategy: RecoveryStrategy) -> RiskLevel {
    match strategy {
        RecoveryStrategy::Failover => RiskLevel::Medium,
        RecoveryStrategy::ScaleUp => RiskLevel::Low,
        RecoveryStrategy::Restart => RiskLevel::High,
        RecoveryStrategy::CircuitBreaker => RiskLevel::Low,
        RecoveryStrategy::LoadBalance => RiskLevel::Low,
        RecoveryStrategy::CacheBypass => RiskLevel::Medium,
        RecoveryStrategy::RateLimit => RiskLevel::Low,
        RecoveryStrategy::GracefulDegradation => RiskLevel::Medium,
    }
}

fn success_criteria(strategy: RecoveryStrategy, thresholds: &Thresholds) -> SuccessCriteria {
    let entries: Vec<(&str, Criterion)> = match strategy {
        RecoveryStrategy::Failover => vec![
            ("backup_active", Criterion::Flag(true)),
            ("traffic_redirected", Criterion::Flag(true)),
            ("error_rate_below", Criterion::Threshold(thresholds.error_rate)),
        ],
        RecoveryStrategy::ScaleUp => vec![
            ("capacity_increased", Criterion::Flag(true)),
            ("response_time_below", Criterion::Threshold(thresholds.response_time)),
        ],
        RecoveryStrategy::Restart => vec![
            ("service_running", Criterion::Flag(true)),
            ("health_check_passed", Criterion::Flag(true)),
        ],
        RecoveryStrategy::CircuitBreaker => vec![
            ("circuit_closed", Criterion::Flag(true)),
            ("error_rate_below", Criterion::Threshold(thresholds.error_rate)),
        ],
        RecoveryStrategy::LoadBalance => vec![
            ("load_distributed", Criterion::Flag(true)),
            ("cpu_usage_below", Criterion::Threshold(thresholds.cpu_usage)),
        ],
        RecoveryStrategy::CacheBypass => vec![
            ("origin_serving", Criterion::Flag(true)),
            ("response_time_below", Criterion::Threshold(thresholds.response_time)),
        ],
        RecoveryStrategy::RateLimit => vec![
            ("rate_limit_active", Criterion::Flag(true)),
            ("request_rate_below", Criterion::Threshold(thresholds.request_rate_flood)),
        ],
        RecoveryStrategy::GracefulDegradation => vec![
            ("core_features_available", Criterion::Flag(true)),
            ("operators_notified", Criterion::Flag(true)),
        ],
    };
    entries
        .into_iter()
        .map(|(name, criterion)| (name.to_string(), criterion))
        .collect()
}

/// Build forward and rollback steps from a template
pub(crate) fn build_steps(template: StepTemplate) -> (Vec<RecoveryStep>, Vec<RecoveryStep>) {
    let steps: Vec<RecoveryStep> = template
        .iter()
        .enumerate()
        .map(|(index, (action, description, _))| RecoveryStep {
            index,
            action: action.to_string(),
            description: description.to_string(),
            reverts: None,
        })
        .collect();

    let rollback_steps = template
        .iter()
        .enumerate()
        .rev()
        .enumerate()
        .map(|(index, (forward, (_, _, inverse)))| RecoveryStep {
            index,
            action: inverse.to_string(),
            description: format!("Undo '{}'", template[forward].0),
            reverts: Some(forward),
        })
        .collect();

    (steps, rollback_steps)
}

/// Stateless planner
pub struct RecoveryPlanner;

impl RecoveryPlanner {
    /// Plan remediation for an incident against one table snapshot
    pub fn plan(incident: &Incident, tables: &HealingTables) -> RecoveryPlan {
        let mapped = match &incident.kind {
            IncidentKind::Anomaly(anomaly_type) => tables
                .strategy_for(*anomaly_type)
                .map(|strategy| (*anomaly_type, strategy)),
            IncidentKind::Unrecognized(_) => None,
        };

        match mapped {
            Some((anomaly_type, strategy)) => {
                Self::strategy_plan(incident, anomaly_type, strategy, tables)
            }
            None => Self::fallback_plan(incident, tables),
        }
    }

    fn strategy_plan(
        incident: &Incident,
        anomaly_type: AnomalyType,
        mapped: RecoveryStrategy,
        tables: &HealingTables,
    ) -> RecoveryPlan {
        let strategy = mapped.escalated(incident.severity);
        let (steps, rollback_steps) = build_steps(step_template(strategy));
        let mut risk_level = base_risk(strategy);
        if incident.severity == Severity::Critical {
            risk_level = risk_level.elevated();
        }

        RecoveryPlan {
            id: uuid::Uuid::new_v4().to_string(),
            incident_id: incident.id.clone(),
            anomaly_type: Some(anomaly_type),
            strategy,
            severity: incident.severity,
            targets: incident.targets.clone(),
            steps,
            rollback_steps,
            estimated_duration_secs: estimated_duration_secs(strategy),
            risk_level,
            success_criteria: success_criteria(strategy, &tables.thresholds),
            context: json!({
                "description": incident.description,
                "observed": incident.observed,
                "mapped_strategy": mapped,
                "escalated": mapped != strategy,
                "fallback": false,
            }),
            created_at: Utc::now(),
            table_version: tables.version,
            execution_status: ExecutionStatus::Pending,
        }
    }

    fn fallback_plan(incident: &Incident, tables: &HealingTables) -> RecoveryPlan {
        let (steps, rollback_steps) = build_steps(FALLBACK_TEMPLATE);
        let anomaly_type = match incident.kind {
            IncidentKind::Anomaly(anomaly_type) => Some(anomaly_type),
            IncidentKind::Unrecognized(_) => None,
        };
        tracing::warn!(
            "No strategy mapped for incident {} ({:?}), planning graceful degradation",
            incident.id,
            incident.kind
        );

        let mut risk_level = base_risk(RecoveryStrategy::GracefulDegradation);
        if incident.severity == Severity::Critical {
            risk_level = risk_level.elevated();
        }

        RecoveryPlan {
            id: uuid::Uuid::new_v4().to_string(),
            incident_id: incident.id.clone(),
            anomaly_type,
            strategy: RecoveryStrategy::GracefulDegradation,
            severity: incident.severity,
            targets: incident.targets.clone(),
            steps,
            rollback_steps,
            estimated_duration_secs: 10,
            risk_level,
            success_criteria: success_criteria(
                RecoveryStrategy::GracefulDegradation,
                &tables.thresholds,
            ),
            context: json!({
                "description": incident.description,
                "observed": incident.observed,
                "fallback": true,
                "incident_kind": incident.kind,
            }),
            created_at: Utc::now(),
            table_version: tables.version,
            execution_status: ExecutionStatus::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealingConfig;

    fn tables() -> HealingTables {
        HealingTables::from_config(&HealingConfig::default())
    }

    fn incident(kind: IncidentKind, severity: Severity) -> Incident {
        Incident {
            id: "incident-1".to_string(),
            kind,
            severity,
            targets: vec!["system".to_string()],
            description: "test incident".to_string(),
            observed: BTreeMap::new(),
        }
    }

    #[test]
    fn test_plan_uses_table_strategy() {
        let plan = RecoveryPlanner::plan(
            &incident(IncidentKind::Anomaly(AnomalyType::ServiceUnavailable), Severity::High),
            &tables(),
        );
        assert_eq!(plan.strategy, RecoveryStrategy::Failover);
        assert_eq!(plan.steps.len(), 4);
        assert_eq!(plan.steps[0].action, "detect_primary_failure");
        assert_eq!(plan.risk_level, RiskLevel::Medium);
        assert_eq!(plan.success_criteria["backup_active"], Criterion::Flag(true));
        assert_eq!(plan.success_criteria["traffic_redirected"], Criterion::Flag(true));
        assert_eq!(plan.execution_status, ExecutionStatus::Pending);
        assert_eq!(plan.table_version, 1);
    }

    #[test]
    fn test_critical_escalates_strategy_and_risk() {
        let plan = RecoveryPlanner::plan(
            &incident(IncidentKind::Anomaly(AnomalyType::CapacityOverload), Severity::Critical),
            &tables(),
        );
        assert_eq!(plan.strategy, RecoveryStrategy::Failover);
        assert_eq!(plan.risk_level, RiskLevel::High);
        assert_eq!(plan.context["escalated"], json!(true));

        let plan = RecoveryPlanner::plan(
            &incident(IncidentKind::Anomaly(AnomalyType::Security), Severity::Critical),
            &tables(),
        );
        assert_eq!(plan.strategy, RecoveryStrategy::CircuitBreaker);
        assert_eq!(plan.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn test_non_critical_does_not_escalate() {
        let plan = RecoveryPlanner::plan(
            &incident(IncidentKind::Anomaly(AnomalyType::CapacityOverload), Severity::High),
            &tables(),
        );
        assert_eq!(plan.strategy, RecoveryStrategy::LoadBalance);
        assert_eq!(plan.risk_level, RiskLevel::Low);
    }

    #[test]
    fn test_steps_never_empty() {
        let t = tables();
        for anomaly_type in AnomalyType::ALL {
            for severity in [Severity::Low, Severity::Medium, Severity::High, Severity::Critical] {
                let plan = RecoveryPlanner::plan(
                    &incident(IncidentKind::Anomaly(anomaly_type), severity),
                    &t,
                );
                assert!(!plan.steps.is_empty());
                assert_eq!(plan.steps.len(), plan.rollback_steps.len());
            }
        }
        let plan = RecoveryPlanner::plan(
            &incident(IncidentKind::Unrecognized("cosmic_ray".to_string()), Severity::Low),
            &t,
        );
        assert!(!plan.steps.is_empty());
    }

    #[test]
    fn test_unrecognized_kind_falls_back() {
        let plan = RecoveryPlanner::plan(
            &incident(IncidentKind::Unrecognized("quota_exceeded".to_string()), Severity::Medium),
            &tables(),
        );
        assert_eq!(plan.strategy, RecoveryStrategy::GracefulDegradation);
        assert_eq!(plan.anomaly_type, None);
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.context["fallback"], json!(true));
    }

    #[test]
    fn test_every_failure_kind_plans_steps() {
        use crate::healing::failover::{FailureKind, ServiceFailure};

        let t = tables();
        let kinds = [
            FailureKind::Timeout,
            FailureKind::ConnectionError,
            FailureKind::RateLimited,
            FailureKind::ServerError,
            FailureKind::QualityDegraded,
            FailureKind::Authentication,
            FailureKind::Other("quota".to_string()),
        ];
        for kind in kinds {
            let failure = ServiceFailure::new("openai", kind.clone(), Severity::High, "failed");
            let incident = Incident::from(&failure);
            assert_eq!(incident.targets, vec!["openai".to_string()]);

            let plan = RecoveryPlanner::plan(&incident, &t);
            assert!(!plan.steps.is_empty(), "no steps for {}", kind);
            assert_eq!(plan.anomaly_type, kind.anomaly_type());
            assert_eq!(plan.targets, vec!["openai".to_string()]);
        }

        let failure = ServiceFailure::new(
            "openai",
            FailureKind::Other("quota".to_string()),
            Severity::Medium,
            "quota exhausted",
        );
        let plan = RecoveryPlanner::plan(&Incident::from(&failure), &t);
        assert_eq!(plan.strategy, RecoveryStrategy::GracefulDegradation);
        assert_eq!(plan.anomaly_type, None);
    }

    #[test]
    fn test_unmapped_type_falls_back() {
        let mut t = tables();
        t.strategies.remove(&AnomalyType::Timeout);
        let plan = RecoveryPlanner::plan(
            &incident(IncidentKind::Anomaly(AnomalyType::Timeout), Severity::Critical),
            &t,
        );
        assert_eq!(plan.strategy, RecoveryStrategy::GracefulDegradation);
        assert_eq!(plan.anomaly_type, Some(AnomalyType::Timeout));
        assert_eq!(plan.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_rollback_is_inverse_in_reverse_order() {
        let plan = RecoveryPlanner::plan(
            &incident(IncidentKind::Anomaly(AnomalyType::Timeout), Severity::Low),
            &tables(),
        );
        assert_eq!(plan.strategy, RecoveryStrategy::Restart);
        let reverts: Vec<_> = plan.rollback_steps.iter().map(|s| s.reverts).collect();
        assert_eq!(reverts, vec![Some(3), Some(2), Some(1), Some(0)]);
        assert_eq!(plan.rollback_steps[0].action, "drain_connections");
        assert_eq!(plan.rollback_steps[3].action, "resume_connections");
    }

    #[test]
    fn test_rollback_through() {
        let plan = RecoveryPlanner::plan(
            &incident(IncidentKind::Anomaly(AnomalyType::PerformanceDegradation), Severity::Low),
            &tables(),
        );
        let actions: Vec<_> = plan
            .rollback_through(1)
            .iter()
            .map(|s| s.action.as_str())
            .collect();
        assert_eq!(actions, vec!["deprovision_instances", "discard_capacity_assessment"]);
    }

    #[test]
    fn test_plan_serializes() {
        let plan = RecoveryPlanner::plan(
            &incident(IncidentKind::Anomaly(AnomalyType::ErrorSpike), Severity::Medium),
            &tables(),
        );
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["strategy"], json!("circuit_breaker"));
        assert_eq!(json["execution_status"], json!("pending"));
        let parsed: RecoveryPlan = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.steps, plan.steps);
    }
}
