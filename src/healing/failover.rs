//! Failover coordination
//!
//! Turns a batch of provider failures into a `FailoverPlan`: the primary
//! failed provider, a routing strategy chosen by severity, and an ordered
//! list of healthy backups taken from the primary's failover chain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{FailoverConfig, HealingConfig, ProviderProfile};

use super::events::{AlertEvent, AlertSink};
use super::executor::ExecutionStatus;
use super::health::{HealthStatus, ServiceHealth};
use super::planner::{build_steps, RecoveryPlan, RecoveryStep};
use super::types::{AnomalyType, Criterion, RecoveryStrategy, RiskLevel, Severity, SuccessCriteria};

/// Floor for normalized response time so instant responses do not divide by zero
const MIN_NORMALIZED_RESPONSE: f64 = 0.01;

/// How backups are ordered
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailoverStrategy {
    RoundRobin,
    PriorityBased,
    PerformanceBased,
    CostOptimized,
    IntelligentRouting,
}

impl std::fmt::Display for FailoverStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailoverStrategy::RoundRobin => write!(f, "round_robin"),
            FailoverStrategy::PriorityBased => write!(f, "priority_based"),
            FailoverStrategy::PerformanceBased => write!(f, "performance_based"),
            FailoverStrategy::CostOptimized => write!(f, "cost_optimized"),
            FailoverStrategy::IntelligentRouting => write!(f, "intelligent_routing"),
        }
    }
}

/// Reported provider failure category
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ConnectionError,
    RateLimited,
    ServerError,
    QualityDegraded,
    Authentication,
    Other(String),
}

impl FailureKind {
    /// Anomaly type the planner handles this failure as
    pub fn anomaly_type(&self) -> Option<AnomalyType> {
        match self {
            FailureKind::Timeout => Some(AnomalyType::Timeout),
            FailureKind::ConnectionError => Some(AnomalyType::ConnectionFailure),
            FailureKind::RateLimited => Some(AnomalyType::CapacityOverload),
            FailureKind::ServerError => Some(AnomalyType::ServiceUnavailable),
            FailureKind::QualityDegraded => Some(AnomalyType::PerformanceDegradation),
            FailureKind::Authentication => Some(AnomalyType::Security),
            FailureKind::Other(_) => None,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::ConnectionError => write!(f, "connection_error"),
            FailureKind::RateLimited => write!(f, "rate_limited"),
            FailureKind::ServerError => write!(f, "server_error"),
            FailureKind::QualityDegraded => write!(f, "quality_degraded"),
            FailureKind::Authentication => write!(f, "authentication"),
            FailureKind::Other(kind) => write!(f, "{}", kind),
        }
    }
}

/// A failure reported against an external provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceFailure {
    pub provider_id: String,
    pub kind: FailureKind,
    pub message: String,
    pub severity: Severity,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
    /// Free-form impact assessment from the reporter
    #[serde(default)]
    pub impact: String,
}

impl ServiceFailure {
    pub fn new(provider_id: &str, kind: FailureKind, severity: Severity, message: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            kind,
            message: message.to_string(),
            severity,
            occurred_at: Utc::now(),
            impact: String::new(),
        }
    }
}

/// Routing change away from a failed provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverPlan {
    pub id: String,
    pub primary_service: String,
    /// Ordered, never contains `primary_service`
    pub backup_services: Vec<String>,
    pub strategy: FailoverStrategy,
    pub severity: Severity,
    pub execution_steps: Vec<RecoveryStep>,
    pub rollback_steps: Vec<RecoveryStep>,
    pub success_criteria: SuccessCriteria,
    /// False when no usable backup exists
    pub valid: bool,
    /// Operator escalation message for invalid plans
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FailoverPlan {
    /// Executable form; locks cover the primary and every backup
    pub fn to_recovery_plan(&self, table_version: u64) -> RecoveryPlan {
        let mut targets = vec![self.primary_service.clone()];
        targets.extend(self.backup_services.iter().cloned());

        let mut risk_level = RiskLevel::Medium;
        if self.severity == Severity::Critical {
            risk_level = risk_level.elevated();
        }

        RecoveryPlan {
            id: uuid::Uuid::new_v4().to_string(),
            incident_id: self.id.clone(),
            anomaly_type: Some(AnomalyType::ServiceUnavailable),
            strategy: RecoveryStrategy::Failover,
            severity: self.severity,
            targets,
            steps: self.execution_steps.clone(),
            rollback_steps: self.rollback_steps.clone(),
            estimated_duration_secs: 30,
            risk_level,
            success_criteria: self.success_criteria.clone(),
            context: json!({
                "failover_plan_id": self.id,
                "routing_strategy": self.strategy,
                "primary": self.primary_service,
                "backups": self.backup_services,
            }),
            created_at: Utc::now(),
            table_version,
            execution_status: ExecutionStatus::Pending,
        }
    }
}

const FAILOVER_TEMPLATE: &[(&str, &str, &str)] = &[
    ("detect_failure", "Confirm the primary provider is failing", "clear_failure_marker"),
    ("validate_backups", "Check the selected backups accept requests", "release_backups"),
    ("reroute_traffic", "Route requests to the backups in order", "restore_primary_routing"),
    ("monitor_backups", "Watch backup error rate and latency", "stop_backup_monitor"),
    ("finalize_failover", "Record the new routing as active", "revert_routing_record"),
];

/// Routing strategy for the overall severity of a batch
pub fn strategy_for_severity(severity: Severity, low: FailoverStrategy) -> FailoverStrategy {
    match severity {
        Severity::Critical => FailoverStrategy::IntelligentRouting,
        Severity::High => FailoverStrategy::PerformanceBased,
        Severity::Medium => FailoverStrategy::PriorityBased,
        Severity::Low => low,
    }
}

/// Picks backups for failed providers
pub struct FailoverCoordinator {
    providers: BTreeMap<String, ProviderProfile>,
    config: FailoverConfig,
    reference_response_time_ms: f64,
    success_rate_target: f64,
    alerts: Arc<dyn AlertSink>,
    /// Round robin rotation
    cursor: AtomicUsize,
}

impl FailoverCoordinator {
    pub fn new(config: &HealingConfig, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            providers: config.providers.clone(),
            config: config.failover.clone(),
            reference_response_time_ms: config.health.reference_response_time_ms,
            success_rate_target: config.health.success_rate_warning,
            alerts,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Build a failover plan for a batch of failures
    pub fn coordinate(
        &self,
        failures: &[ServiceFailure],
        health: &BTreeMap<String, ServiceHealth>,
    ) -> FailoverPlan {
        let severity = failures
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(Severity::Low);
        let strategy = strategy_for_severity(severity, self.config.low_severity_strategy);
        let (execution_steps, rollback_steps) = build_steps(FAILOVER_TEMPLATE);

        let mut plan = FailoverPlan {
            id: uuid::Uuid::new_v4().to_string(),
            primary_service: String::new(),
            backup_services: Vec::new(),
            strategy,
            severity,
            execution_steps,
            rollback_steps,
            success_criteria: self.success_criteria(),
            valid: false,
            escalation: None,
            created_at: Utc::now(),
        };

        let primary = match select_primary(failures) {
            Some(primary) => primary,
            None => {
                plan.escalation = Some("No failures reported; nothing to fail over".to_string());
                return plan;
            }
        };
        plan.primary_service = primary.clone();

        let failing: BTreeSet<&str> = failures.iter().map(|f| f.provider_id.as_str()).collect();
        let candidates: Vec<String> = self
            .providers
            .get(&primary)
            .map(|p| p.failover_chain.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|id| *id != primary)
            .filter(|id| !failing.contains(id.as_str()))
            .filter(|id| {
                health
                    .get(id)
                    .map_or(true, |h| h.status != HealthStatus::Unavailable)
            })
            .collect();

        let mut backups = self.order(candidates, strategy, health);
        backups.truncate(self.config.max_backups);

        if backups.is_empty() {
            let message = format!(
                "No healthy backup for provider '{}' ({} severity); operator intervention required",
                primary, severity
            );
            tracing::warn!("{}", message);
            self.alerts
                .emit(AlertEvent::failover_escalation(&primary, &message));
            plan.escalation = Some(message);
            return plan;
        }

        tracing::info!(
            "Failover plan {}: {} -> {:?} ({})",
            plan.id,
            primary,
            backups,
            strategy
        );
        plan.backup_services = backups;
        plan.valid = true;
        plan
    }

    fn success_criteria(&self) -> SuccessCriteria {
        let mut criteria = SuccessCriteria::new();
        criteria.insert("backup_active".to_string(), Criterion::Flag(true));
        criteria.insert("traffic_redirected".to_string(), Criterion::Flag(true));
        criteria.insert(
            "success_rate_above".to_string(),
            Criterion::Threshold(self.success_rate_target),
        );
        criteria
    }

    fn order(
        &self,
        mut candidates: Vec<String>,
        strategy: FailoverStrategy,
        health: &BTreeMap<String, ServiceHealth>,
    ) -> Vec<String> {
        match strategy {
            FailoverStrategy::RoundRobin => {
                if !candidates.is_empty() {
                    let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
                    let len = candidates.len();
                    candidates.rotate_left(turn % len);
                }
                candidates
            }
            FailoverStrategy::PriorityBased => {
                candidates.sort_by_key(|id| {
                    self.providers.get(id).map(|p| p.priority).unwrap_or(u32::MAX)
                });
                candidates
            }
            FailoverStrategy::PerformanceBased => {
                self.rank(candidates, |id| self.performance(health.get(id)))
            }
            FailoverStrategy::CostOptimized => {
                self.rank(candidates, |id| self.quality(id, health) / self.cost(id))
            }
            FailoverStrategy::IntelligentRouting => self.rank(candidates, |id| {
                let performance = self.performance(health.get(id)) / 100.0;
                0.5 * self.quality(id, health)
                    + 0.3 * performance.min(1.0)
                    + 0.2 / (1.0 + self.cost(id))
            }),
        }
    }

    /// Sort descending by score; stable, so chain order breaks ties
    fn rank<F>(&self, candidates: Vec<String>, score: F) -> Vec<String>
    where
        F: Fn(&str) -> f64,
    {
        let mut scored: Vec<(String, f64)> = candidates
            .into_iter()
            .map(|id| {
                let s = score(&id);
                (id, if s.is_nan() { 0.0 } else { s })
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(CmpOrdering::Equal));
        scored.into_iter().map(|(id, _)| id).collect()
    }

    /// success_rate / normalized response time; unmeasured providers score 0
    fn performance(&self, health: Option<&ServiceHealth>) -> f64 {
        match health {
            Some(h) if h.status != HealthStatus::Unknown => {
                let normalized = (h.response_time_ms / self.reference_response_time_ms)
                    .max(MIN_NORMALIZED_RESPONSE);
                h.success_rate / normalized
            }
            _ => 0.0,
        }
    }

    fn quality(&self, id: &str, health: &BTreeMap<String, ServiceHealth>) -> f64 {
        match health.get(id) {
            Some(h) => h.quality_score,
            None => self.providers.get(id).map_or(0.0, |p| p.baseline_quality),
        }
    }

    fn cost(&self, id: &str) -> f64 {
        self.providers.get(id).map_or(1.0, |p| p.cost)
    }
}

/// Provider with the most failures, then most severe, then lowest id
fn select_primary(failures: &[ServiceFailure]) -> Option<String> {
    let mut tally: BTreeMap<&str, (usize, Severity)> = BTreeMap::new();
    for failure in failures {
        let entry = tally
            .entry(failure.provider_id.as_str())
            .or_insert((0, Severity::Low));
        entry.0 += 1;
        entry.1 = entry.1.max(failure.severity);
    }
    tally
        .into_iter()
        .max_by(|(a_id, a), (b_id, b)| {
            a.0.cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then_with(|| b_id.cmp(a_id))
        })
        .map(|(id, _)| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healing::events::{AlertKind, MemoryAlertSink};
    use crate::healing::health::CircuitState;

    fn health(id: &str, status: HealthStatus, success_rate: f64, rt: f64, quality: f64) -> ServiceHealth {
        ServiceHealth {
            provider_id: id.to_string(),
            status,
            response_time_ms: rt,
            success_rate,
            error_rate: 100.0 - success_rate,
            uptime: 99.9,
            capacity_utilization: 40.0,
            quality_score: quality,
            last_checked: Utc::now(),
            circuit_state: CircuitState::Closed,
        }
    }

    fn table(records: Vec<ServiceHealth>) -> BTreeMap<String, ServiceHealth> {
        records
            .into_iter()
            .map(|r| (r.provider_id.clone(), r))
            .collect()
    }

    fn coordinator() -> (FailoverCoordinator, Arc<MemoryAlertSink>) {
        let alerts = Arc::new(MemoryAlertSink::new());
        (
            FailoverCoordinator::new(&HealingConfig::default(), alerts.clone()),
            alerts,
        )
    }

    fn failure(provider: &str, severity: Severity) -> ServiceFailure {
        ServiceFailure::new(provider, FailureKind::ServerError, severity, "5xx")
    }

    #[test]
    fn test_primary_by_count_then_severity() {
        let failures = vec![
            failure("google", Severity::Critical),
            failure("openai", Severity::Low),
            failure("openai", Severity::Low),
        ];
        assert_eq!(select_primary(&failures), Some("openai".to_string()));

        let failures = vec![
            failure("google", Severity::Medium),
            failure("openai", Severity::High),
        ];
        assert_eq!(select_primary(&failures), Some("openai".to_string()));

        let failures = vec![
            failure("openai", Severity::High),
            failure("anthropic", Severity::High),
        ];
        assert_eq!(select_primary(&failures), Some("anthropic".to_string()));
    }

    #[test]
    fn test_strategy_by_severity() {
        let low = FailoverStrategy::RoundRobin;
        assert_eq!(strategy_for_severity(Severity::Critical, low), FailoverStrategy::IntelligentRouting);
        assert_eq!(strategy_for_severity(Severity::High, low), FailoverStrategy::PerformanceBased);
        assert_eq!(strategy_for_severity(Severity::Medium, low), FailoverStrategy::PriorityBased);
        assert_eq!(strategy_for_severity(Severity::Low, low), FailoverStrategy::RoundRobin);
        assert_eq!(
            strategy_for_severity(Severity::Low, FailoverStrategy::CostOptimized),
            FailoverStrategy::CostOptimized
        );
    }

    #[test]
    fn test_performance_ordering() {
        let (coordinator, _) = coordinator();
        let failures = vec![
            failure("openai", Severity::High),
            failure("openai", Severity::Medium),
            failure("openai", Severity::Medium),
        ];
        let health = table(vec![
            health("anthropic", HealthStatus::Healthy, 99.0, 800.0, 0.9),
            health("google", HealthStatus::Healthy, 98.0, 400.0, 0.85),
            health("mistral", HealthStatus::Healthy, 97.0, 1200.0, 0.8),
        ]);
        let plan = coordinator.coordinate(&failures, &health);
        assert!(plan.valid);
        assert_eq!(plan.primary_service, "openai");
        assert_eq!(plan.strategy, FailoverStrategy::PerformanceBased);
        assert_eq!(plan.severity, Severity::High);
        assert_eq!(plan.backup_services, vec!["google", "anthropic"]);
    }

    #[test]
    fn test_priority_ordering() {
        let (coordinator, _) = coordinator();
        let plan = coordinator.coordinate(&[failure("mistral", Severity::Medium)], &BTreeMap::new());
        assert_eq!(plan.strategy, FailoverStrategy::PriorityBased);
        // chain [local, google, openai]: priorities 5, 3, 1
        assert_eq!(plan.backup_services, vec!["openai", "google"]);
    }

    #[test]
    fn test_cost_ordering() {
        let mut config = HealingConfig::default();
        config.failover.low_severity_strategy = FailoverStrategy::CostOptimized;
        let coordinator = FailoverCoordinator::new(&config, Arc::new(MemoryAlertSink::new()));
        let health = table(vec![
            health("local", HealthStatus::Healthy, 99.0, 300.0, 0.6),
            health("google", HealthStatus::Healthy, 99.0, 300.0, 0.9),
            health("openai", HealthStatus::Healthy, 99.0, 300.0, 0.95),
        ]);
        let plan = coordinator.coordinate(&[failure("mistral", Severity::Low)], &health);
        assert_eq!(plan.strategy, FailoverStrategy::CostOptimized);
        // 0.6/0.2 = 3.0, 0.9/2.0 = 0.45, 0.95/3.0 = 0.32
        assert_eq!(plan.backup_services, vec!["local", "google"]);
    }

    #[test]
    fn test_round_robin_rotates() {
        let (coordinator, _) = coordinator();
        let failures = [failure("openai", Severity::Low)];
        let first = coordinator.coordinate(&failures, &BTreeMap::new());
        let second = coordinator.coordinate(&failures, &BTreeMap::new());
        assert_eq!(first.strategy, FailoverStrategy::RoundRobin);
        assert_eq!(first.backup_services, vec!["anthropic", "google"]);
        assert_eq!(second.backup_services, vec!["google", "mistral"]);
    }

    #[test]
    fn test_intelligent_routing_prefers_quality() {
        let (coordinator, _) = coordinator();
        let health = table(vec![
            health("anthropic", HealthStatus::Degraded, 90.0, 2500.0, 0.5),
            health("google", HealthStatus::Healthy, 99.5, 500.0, 0.88),
            health("mistral", HealthStatus::Healthy, 99.0, 700.0, 0.8),
        ]);
        let plan = coordinator.coordinate(&[failure("openai", Severity::Critical)], &health);
        assert_eq!(plan.strategy, FailoverStrategy::IntelligentRouting);
        assert_eq!(plan.backup_services[0], "google");
    }

    #[test]
    fn test_excludes_failing_and_unavailable() {
        let (coordinator, _) = coordinator();
        let failures = vec![
            failure("openai", Severity::High),
            failure("openai", Severity::High),
            failure("anthropic", Severity::High),
        ];
        let health = table(vec![
            health("google", HealthStatus::Unavailable, 50.0, 9000.0, 0.1),
            health("mistral", HealthStatus::Healthy, 99.0, 700.0, 0.8),
        ]);
        let plan = coordinator.coordinate(&failures, &health);
        assert_eq!(plan.primary_service, "openai");
        assert_eq!(plan.backup_services, vec!["mistral"]);
        assert!(!plan.backup_services.contains(&plan.primary_service));
    }

    #[test]
    fn test_no_backup_escalates() {
        let (coordinator, alerts) = coordinator();
        let health = table(vec![
            health("mistral", HealthStatus::Unavailable, 10.0, 9000.0, 0.0),
            health("google", HealthStatus::Unavailable, 10.0, 9000.0, 0.0),
        ]);
        let plan = coordinator.coordinate(&[failure("local", Severity::Critical)], &health);
        assert!(!plan.valid);
        assert!(plan.backup_services.is_empty());
        assert!(plan.escalation.as_deref().unwrap_or("").contains("local"));
        assert_eq!(alerts.count(AlertKind::FailoverEscalation), 1);
    }

    #[test]
    fn test_empty_batch_is_invalid() {
        let (coordinator, _) = coordinator();
        let plan = coordinator.coordinate(&[], &BTreeMap::new());
        assert!(!plan.valid);
        assert!(plan.escalation.is_some());
    }

    #[test]
    fn test_plan_steps_and_recovery_form() {
        let (coordinator, _) = coordinator();
        let plan = coordinator.coordinate(&[failure("openai", Severity::Critical)], &BTreeMap::new());
        let actions: Vec<_> = plan.execution_steps.iter().map(|s| s.action.as_str()).collect();
        assert_eq!(
            actions,
            vec!["detect_failure", "validate_backups", "reroute_traffic", "monitor_backups", "finalize_failover"]
        );
        assert_eq!(plan.rollback_steps[2].action, "restore_primary_routing");

        let recovery = plan.to_recovery_plan(3);
        assert_eq!(recovery.strategy, RecoveryStrategy::Failover);
        assert_eq!(recovery.targets[0], "openai");
        assert_eq!(recovery.targets.len(), 1 + plan.backup_services.len());
        assert_eq!(recovery.risk_level, RiskLevel::High);
        assert_eq!(recovery.table_version, 3);
    }

    #[test]
    fn test_failure_kind_mapping() {
        assert_eq!(FailureKind::Timeout.anomaly_type(), Some(AnomalyType::Timeout));
        assert_eq!(FailureKind::RateLimited.anomaly_type(), Some(AnomalyType::CapacityOverload));
        assert_eq!(FailureKind::Other("quota".to_string()).anomaly_type(), None);
        assert_eq!(FailureKind::Other("quota".to_string()).to_string(), "quota");
    }
}
