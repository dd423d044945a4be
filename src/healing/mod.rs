//! Self-Healing Module
//!
//! This module closes the loop from observation to remediation:
//! - Anomaly detection against versioned threshold tables
//! - Recovery planning and step-wise execution with rollback
//! - Provider health monitoring with circuit breakers
//! - Failover coordination across provider chains
//! - Learning from recovery history, applied as atomic table epochs

pub mod clock;
pub mod detector;
pub mod events;
pub mod executor;
pub mod failover;
pub mod health;
pub mod history;
pub mod learning;
pub mod orchestrator;
pub mod planner;
pub mod tables;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use detector::{AnomalyDetector, ConfidenceScorer, TableConfidenceScorer};
pub use events::{
    AlertEvent, AlertKind, AlertSeverity, AlertSink, ChannelAlertSink, MemoryAlertSink,
    TracingAlertSink,
};
pub use executor::{
    DryRunEffector, Effector, ExecutionPhase, ExecutionStatus, Lesson, RecoveryExecutor,
    RecoveryResult, ResourceLocks, RollbackReport, StepOutcome, StepRecord,
};
pub use failover::{
    FailoverCoordinator, FailoverPlan, FailoverStrategy, FailureKind, ServiceFailure,
};
pub use health::{
    CircuitState, HealthMonitor, HealthStatus, ProviderProbe, RawProviderMetrics, ServiceHealth,
    StaticProbe,
};
pub use history::{HistoryStore, InMemoryHistoryStore, RecoveryHistory, TimeWindow};
pub use learning::{
    LearnedPattern, LearningEngine, LearningUpdate, PatternType, Recommendation,
};
pub use orchestrator::{
    Collaborators, FailoverOutcome, HealingCycleStats, HealingOrchestrator, HealingStatus,
    MetricsOutcome,
};
pub use planner::{Incident, IncidentKind, RecoveryPlan, RecoveryPlanner, RecoveryStep};
pub use tables::{HealingTables, TableStore};
pub use types::{Anomaly, AnomalyType, RecoveryStrategy, RiskLevel, Severity};
