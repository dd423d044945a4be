//! Alert events
//!
//! Structured alerts raised for critical anomalies, aborted or failed
//! executions, rollback failures, failover escalations and opened provider
//! circuits. Transport is pluggable through `AlertSink`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::types::Anomaly;

/// What the alert is about
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Detector produced a critical anomaly
    CriticalAnomaly,
    /// Execution hit a failed or timed out step and rolled back
    ExecutionAborted,
    /// Execution ended with a failed status
    ExecutionFailed,
    /// A rollback step failed; the system may be inconsistent
    RollbackFailed,
    /// No usable backup provider
    FailoverEscalation,
    /// Provider circuit breaker opened
    ProviderCircuitOpened,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertKind::CriticalAnomaly => write!(f, "critical_anomaly"),
            AlertKind::ExecutionAborted => write!(f, "execution_aborted"),
            AlertKind::ExecutionFailed => write!(f, "execution_failed"),
            AlertKind::RollbackFailed => write!(f, "rollback_failed"),
            AlertKind::FailoverEscalation => write!(f, "failover_escalation"),
            AlertKind::ProviderCircuitOpened => write!(f, "provider_circuit_opened"),
        }
    }
}

/// Severity level of an alert
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational - no action needed
    Info,
    /// Warning - may need attention
    Warning,
    /// Error - automatic recovery did not succeed
    Error,
    /// Critical - requires operator attention
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Error => write!(f, "error"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// An alert record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: String,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub description: String,

    /// Related plan (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,

    /// Related provider (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Affected targets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,

    /// Additional context
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub context: serde_json::Value,

    pub created_at: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(kind: AlertKind, severity: AlertSeverity, description: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            severity,
            description,
            plan_id: None,
            provider_id: None,
            targets: Vec::new(),
            context: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_plan(mut self, plan_id: &str) -> Self {
        self.plan_id = Some(plan_id.to_string());
        self
    }

    pub fn with_provider(mut self, provider_id: &str) -> Self {
        self.provider_id = Some(provider_id.to_string());
        self
    }

    pub fn with_targets(mut self, targets: &[String]) -> Self {
        self.targets = targets.to_vec();
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Create critical anomaly event
    pub fn critical_anomaly(anomaly: &Anomaly) -> Self {
        Self::new(
            AlertKind::CriticalAnomaly,
            AlertSeverity::Critical,
            format!(
                "Critical {} detected: {}",
                anomaly.anomaly_type, anomaly.description
            ),
        )
        .with_targets(&anomaly.affected_targets)
        .with_context(serde_json::json!({
            "anomaly_id": anomaly.id,
            "observed": anomaly.observed,
            "confidence": anomaly.confidence,
        }))
    }

    /// Create execution aborted event
    pub fn execution_aborted(plan_id: &str, targets: &[String], reason: &str) -> Self {
        Self::new(
            AlertKind::ExecutionAborted,
            AlertSeverity::Warning,
            format!("Recovery aborted and rolled back: {}", reason),
        )
        .with_plan(plan_id)
        .with_targets(targets)
    }

    /// Create execution failed event
    pub fn execution_failed(plan_id: &str, targets: &[String], success_rate: f64) -> Self {
        Self::new(
            AlertKind::ExecutionFailed,
            AlertSeverity::Error,
            format!(
                "Recovery failed with {:.0}% of steps verified",
                success_rate * 100.0
            ),
        )
        .with_plan(plan_id)
        .with_targets(targets)
    }

    /// Create rollback failed event
    pub fn rollback_failed(plan_id: &str, targets: &[String], action: &str, error: &str) -> Self {
        Self::new(
            AlertKind::RollbackFailed,
            AlertSeverity::Critical,
            format!("Rollback step '{}' failed: {}", action, error),
        )
        .with_plan(plan_id)
        .with_targets(targets)
    }

    /// Create failover escalation event
    pub fn failover_escalation(primary: &str, message: &str) -> Self {
        Self::new(
            AlertKind::FailoverEscalation,
            AlertSeverity::Critical,
            message.to_string(),
        )
        .with_provider(primary)
    }

    /// Create provider circuit opened event
    pub fn circuit_opened(provider_id: &str, failures: u32) -> Self {
        Self::new(
            AlertKind::ProviderCircuitOpened,
            AlertSeverity::Warning,
            format!(
                "Provider circuit opened after {} consecutive probe failures",
                failures
            ),
        )
        .with_provider(provider_id)
    }
}

/// Receiver of alert events
pub trait AlertSink: Send + Sync {
    fn emit(&self, event: AlertEvent);
}

/// Writes alerts to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, event: AlertEvent) {
        match event.severity {
            AlertSeverity::Critical | AlertSeverity::Error => {
                tracing::error!(kind = %event.kind, id = %event.id, "{}", event.description)
            }
            AlertSeverity::Warning => {
                tracing::warn!(kind = %event.kind, id = %event.id, "{}", event.description)
            }
            AlertSeverity::Info => {
                tracing::info!(kind = %event.kind, id = %event.id, "{}", event.description)
            }
        }
    }
}

/// Forwards alerts over an unbounded tokio channel
pub struct ChannelAlertSink {
    tx: mpsc::UnboundedSender<AlertEvent>,
}

impl ChannelAlertSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AlertEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelAlertSink {
    fn emit(&self, event: AlertEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Alert receiver dropped, discarding alert");
        }
    }
}

/// Keeps every alert in memory
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    events: Mutex<Vec<AlertEvent>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: AlertKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }
}

impl AlertSink for MemoryAlertSink {
    fn emit(&self, event: AlertEvent) {
        self.events.lock().push(event);
    }
}
