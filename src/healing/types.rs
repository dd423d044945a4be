//! Core healing types
//!
//! Severity, anomaly and strategy variants shared by every component, plus
//! the `Anomaly` record emitted by detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::metrics::SystemMetrics;

/// Severity of an anomaly or failure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Band an `observed / threshold` ratio into a severity.
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= 2.0 {
            Severity::Critical
        } else if ratio >= 1.5 {
            Severity::High
        } else if ratio >= 1.2 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Kind of operational anomaly
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    PerformanceDegradation,
    ServiceUnavailable,
    ResourceExhaustion,
    ConnectionFailure,
    Timeout,
    ErrorSpike,
    CapacityOverload,
    Security,
}

impl AnomalyType {
    pub const ALL: [AnomalyType; 8] = [
        AnomalyType::PerformanceDegradation,
        AnomalyType::ServiceUnavailable,
        AnomalyType::ResourceExhaustion,
        AnomalyType::ConnectionFailure,
        AnomalyType::Timeout,
        AnomalyType::ErrorSpike,
        AnomalyType::CapacityOverload,
        AnomalyType::Security,
    ];
}

impl std::fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnomalyType::PerformanceDegradation => write!(f, "performance_degradation"),
            AnomalyType::ServiceUnavailable => write!(f, "service_unavailable"),
            AnomalyType::ResourceExhaustion => write!(f, "resource_exhaustion"),
            AnomalyType::ConnectionFailure => write!(f, "connection_failure"),
            AnomalyType::Timeout => write!(f, "timeout"),
            AnomalyType::ErrorSpike => write!(f, "error_spike"),
            AnomalyType::CapacityOverload => write!(f, "capacity_overload"),
            AnomalyType::Security => write!(f, "security"),
        }
    }
}

/// Named remediation approach
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Failover,
    ScaleUp,
    Restart,
    CircuitBreaker,
    LoadBalance,
    CacheBypass,
    RateLimit,
    GracefulDegradation,
}

impl RecoveryStrategy {
    pub const ALL: [RecoveryStrategy; 8] = [
        RecoveryStrategy::Failover,
        RecoveryStrategy::ScaleUp,
        RecoveryStrategy::Restart,
        RecoveryStrategy::CircuitBreaker,
        RecoveryStrategy::LoadBalance,
        RecoveryStrategy::CacheBypass,
        RecoveryStrategy::RateLimit,
        RecoveryStrategy::GracefulDegradation,
    ];

    /// Stronger strategy used when the incident is critical
    pub fn escalated(self, severity: Severity) -> Self {
        if severity < Severity::Critical {
            return self;
        }
        match self {
            RecoveryStrategy::LoadBalance => RecoveryStrategy::Failover,
            RecoveryStrategy::RateLimit => RecoveryStrategy::CircuitBreaker,
            other => other,
        }
    }
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryStrategy::Failover => write!(f, "failover"),
            RecoveryStrategy::ScaleUp => write!(f, "scale_up"),
            RecoveryStrategy::Restart => write!(f, "restart"),
            RecoveryStrategy::CircuitBreaker => write!(f, "circuit_breaker"),
            RecoveryStrategy::LoadBalance => write!(f, "load_balance"),
            RecoveryStrategy::CacheBypass => write!(f, "cache_bypass"),
            RecoveryStrategy::RateLimit => write!(f, "rate_limit"),
            RecoveryStrategy::GracefulDegradation => write!(f, "graceful_degradation"),
        }
    }
}

/// Risk band of a recovery plan
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// One band higher, saturating at critical
    pub fn elevated(self) -> Self {
        match self {
            RiskLevel::Low => RiskLevel::Medium,
            RiskLevel::Medium => RiskLevel::High,
            RiskLevel::High | RiskLevel::Critical => RiskLevel::Critical,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

/// A named success criterion: either a flag that must hold or a numeric bound
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Criterion {
    Flag(bool),
    Threshold(f64),
}

pub type SuccessCriteria = BTreeMap<String, Criterion>;

/// A detected deviation of system metrics from the configured thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Anomaly {
    /// Derived from the type and the metrics timestamp
    pub id: String,
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    /// Confidence level (0.0 - 1.0)
    pub confidence: f64,
    pub affected_targets: Vec<String>,
    pub recommended_strategy: RecoveryStrategy,
    /// Metric values that triggered the rule
    pub observed: BTreeMap<String, f64>,
    /// Originating snapshot (clamped)
    pub metrics: SystemMetrics,
    pub detected_at: DateTime<Utc>,
    pub description: String,
    /// Table version the detection ran against
    pub table_version: u64,
}

impl Anomaly {
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}
