//! Anomaly detection
//!
//! Evaluates a metrics snapshot against the threshold table. Detection is a
//! pure function of the (clamped) snapshot and the table version it is given:
//! out-of-range inputs are clamped first and simply fail to trigger a rule.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::metrics::SystemMetrics;

use super::tables::HealingTables;
use super::types::{Anomaly, AnomalyType, RecoveryStrategy, Severity};

/// Confidence assigned to a detected anomaly
pub trait ConfidenceScorer: Send + Sync {
    fn score(
        &self,
        anomaly_type: AnomalyType,
        strategy: RecoveryStrategy,
        ratio: f64,
        tables: &HealingTables,
    ) -> f64;
}

/// Seeded per-type constant plus the learned per-strategy adjustment
#[derive(Debug, Default, Clone, Copy)]
pub struct TableConfidenceScorer;

impl ConfidenceScorer for TableConfidenceScorer {
    fn score(
        &self,
        anomaly_type: AnomalyType,
        strategy: RecoveryStrategy,
        _ratio: f64,
        tables: &HealingTables,
    ) -> f64 {
        (tables.confidence_seed(anomaly_type) + tables.adjustment(strategy)).clamp(0.0, 1.0)
    }
}

/// Output of one rule before it becomes an `Anomaly`
struct Trigger {
    anomaly_type: AnomalyType,
    ratio: f64,
    force_critical: bool,
    targets: Option<Vec<String>>,
    observed: BTreeMap<String, f64>,
    description: String,
}

impl Trigger {
    fn new(anomaly_type: AnomalyType, ratio: f64, description: String) -> Self {
        Self {
            anomaly_type,
            ratio,
            force_critical: false,
            targets: None,
            observed: BTreeMap::new(),
            description,
        }
    }

    fn observe(mut self, name: &str, value: f64) -> Self {
        self.observed.insert(name.to_string(), value);
        self
    }
}

pub struct AnomalyDetector {
    scorer: Arc<dyn ConfidenceScorer>,
    system_target: String,
}

impl AnomalyDetector {
    pub fn new(system_target: impl Into<String>) -> Self {
        Self::with_scorer(system_target, Arc::new(TableConfidenceScorer))
    }

    pub fn with_scorer(system_target: impl Into<String>, scorer: Arc<dyn ConfidenceScorer>) -> Self {
        Self {
            scorer,
            system_target: system_target.into(),
        }
    }

    /// Detect anomalies in `metrics`. Rules are evaluated in a fixed order so
    /// identical inputs yield identical output.
    pub fn detect(&self, metrics: &SystemMetrics, tables: &HealingTables) -> Vec<Anomaly> {
        let metrics = metrics.clamped();
        let rules: [fn(&SystemMetrics, &HealingTables) -> Option<Trigger>; 8] = [
            performance_degradation,
            resource_exhaustion,
            capacity_overload,
            timeout,
            error_spike,
            connection_failure,
            service_unavailable,
            security,
        ];

        rules
            .iter()
            .filter_map(|rule| rule(&metrics, tables))
            .map(|trigger| self.build(trigger, &metrics, tables))
            .collect()
    }

    fn build(&self, trigger: Trigger, metrics: &SystemMetrics, tables: &HealingTables) -> Anomaly {
        let severity = if trigger.force_critical {
            Severity::Critical
        } else {
            Severity::from_ratio(trigger.ratio)
        };
        let strategy = tables
            .strategy_for(trigger.anomaly_type)
            .unwrap_or(RecoveryStrategy::GracefulDegradation);
        let confidence = self
            .scorer
            .score(trigger.anomaly_type, strategy, trigger.ratio, tables)
            .clamp(0.0, 1.0);
        let targets = trigger
            .targets
            .unwrap_or_else(|| vec![self.system_target.clone()]);
        let mut observed = trigger.observed;
        observed.insert("ratio".to_string(), trigger.ratio);

        Anomaly {
            id: format!(
                "{}-{}",
                trigger.anomaly_type,
                metrics.timestamp.timestamp_millis()
            ),
            anomaly_type: trigger.anomaly_type,
            severity,
            confidence,
            affected_targets: targets,
            recommended_strategy: strategy,
            observed,
            metrics: metrics.clone(),
            detected_at: metrics.timestamp,
            description: trigger.description,
            table_version: tables.version,
        }
    }
}

fn performance_degradation(m: &SystemMetrics, tables: &HealingTables) -> Option<Trigger> {
    let t = &tables.thresholds;
    if m.response_time <= t.response_time {
        return None;
    }
    let ratio = m.response_time / t.response_time;
    let mut trigger = Trigger::new(
        AnomalyType::PerformanceDegradation,
        ratio,
        format!(
            "Response time {:.2}s exceeds threshold {:.2}s",
            m.response_time, t.response_time
        ),
    )
    .observe("response_time", m.response_time)
    .observe("response_time_threshold", t.response_time)
    .observe("cpu_usage", m.cpu_usage)
    .observe("memory_usage", m.memory_usage);
    trigger.force_critical = m.response_time > t.response_time_critical;
    Some(trigger)
}

fn resource_exhaustion(m: &SystemMetrics, tables: &HealingTables) -> Option<Trigger> {
    let t = &tables.thresholds;
    // Triggered by the critical limits, banded against the pressure thresholds
    let checks = [
        ("cpu_usage", m.cpu_usage, t.cpu_critical, t.cpu_usage),
        ("memory_usage", m.memory_usage, t.memory_critical, t.memory_usage),
        ("disk_usage", m.disk_usage, t.disk_usage, t.disk_usage),
    ];
    let breached: Vec<_> = checks
        .iter()
        .filter(|(_, observed, limit, _)| observed > limit)
        .collect();
    if breached.is_empty() {
        return None;
    }
    let ratio = breached
        .iter()
        .map(|(_, observed, _, band)| observed / band)
        .fold(0.0, f64::max);
    let names: Vec<&str> = breached.iter().map(|(name, ..)| *name).collect();
    let mut trigger = Trigger::new(
        AnomalyType::ResourceExhaustion,
        ratio,
        format!("Resources near exhaustion: {}", names.join(", ")),
    );
    for (name, observed, ..) in breached {
        trigger = trigger.observe(name, *observed);
    }
    Some(trigger)
}

fn capacity_overload(m: &SystemMetrics, tables: &HealingTables) -> Option<Trigger> {
    let t = &tables.thresholds;
    let pressured = m.cpu_usage > t.cpu_usage || m.memory_usage > t.memory_usage;
    let queue_ratio = m.queue_depth as f64 / t.queue_depth.max(1) as f64;
    let conn_ratio = m.active_connections as f64 / t.active_connections.max(1) as f64;
    if !pressured || (queue_ratio <= 1.0 && conn_ratio <= 1.0) {
        return None;
    }
    let ratio = queue_ratio.max(conn_ratio);
    Some(
        Trigger::new(
            AnomalyType::CapacityOverload,
            ratio,
            format!(
                "Load exceeds capacity: queue depth {}, {} active connections",
                m.queue_depth, m.active_connections
            ),
        )
        .observe("queue_depth", m.queue_depth as f64)
        .observe("active_connections", m.active_connections as f64)
        .observe("cpu_usage", m.cpu_usage)
        .observe("memory_usage", m.memory_usage),
    )
}

fn timeout(m: &SystemMetrics, tables: &HealingTables) -> Option<Trigger> {
    let t = &tables.thresholds;
    if m.response_time < t.request_timeout {
        return None;
    }
    Some(
        Trigger::new(
            AnomalyType::Timeout,
            m.response_time / t.request_timeout,
            format!(
                "Requests hitting timeout: {:.2}s >= {:.2}s",
                m.response_time, t.request_timeout
            ),
        )
        .observe("response_time", m.response_time),
    )
}

fn error_spike(m: &SystemMetrics, tables: &HealingTables) -> Option<Trigger> {
    let t = &tables.thresholds;
    if m.error_rate <= t.error_rate {
        return None;
    }
    Some(
        Trigger::new(
            AnomalyType::ErrorSpike,
            m.error_rate / t.error_rate,
            format!(
                "Error rate {:.1}% exceeds {:.1}%",
                m.error_rate, t.error_rate
            ),
        )
        .observe("error_rate", m.error_rate),
    )
}

fn connection_failure(m: &SystemMetrics, tables: &HealingTables) -> Option<Trigger> {
    let t = &tables.thresholds;
    if m.network_latency_ms <= t.network_latency_ms {
        return None;
    }
    Some(
        Trigger::new(
            AnomalyType::ConnectionFailure,
            m.network_latency_ms / t.network_latency_ms,
            format!(
                "Network latency {:.0}ms exceeds {:.0}ms",
                m.network_latency_ms, t.network_latency_ms
            ),
        )
        .observe("network_latency_ms", m.network_latency_ms),
    )
}

fn service_unavailable(m: &SystemMetrics, tables: &HealingTables) -> Option<Trigger> {
    let t = &tables.thresholds;
    let failing: Vec<(&String, f64)> = m
        .service_health
        .iter()
        .filter(|(_, score)| **score < t.service_health_min)
        .map(|(name, score)| (name, *score))
        .collect();
    if failing.is_empty() {
        return None;
    }
    let worst = failing.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
    let ratio = t.service_health_min / worst.max(0.01);
    let names: Vec<String> = failing.iter().map(|(name, _)| (*name).clone()).collect();
    let mut trigger = Trigger::new(
        AnomalyType::ServiceUnavailable,
        ratio,
        format!("Services below health minimum: {}", names.join(", ")),
    );
    for (name, score) in &failing {
        trigger = trigger.observe(&format!("service_health.{}", name), *score);
    }
    // BTreeMap iteration keeps the targets sorted
    trigger.targets = Some(names);
    Some(trigger)
}

fn security(m: &SystemMetrics, tables: &HealingTables) -> Option<Trigger> {
    let t = &tables.thresholds;
    if m.request_rate <= t.request_rate_flood {
        return None;
    }
    Some(
        Trigger::new(
            AnomalyType::Security,
            m.request_rate / t.request_rate_flood,
            format!(
                "Request rate {:.0}/s looks like a flood (limit {:.0}/s)",
                m.request_rate, t.request_rate_flood
            ),
        )
        .observe("request_rate", m.request_rate),
    )
}
