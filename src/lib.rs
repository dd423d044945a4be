pub mod config;
pub mod error;
pub mod healing;
pub mod metrics;
pub mod scenario;

pub use config::HealingConfig;
pub use error::{HealError, HealResult};
pub use healing::{
    Anomaly, AnomalyType, HealingOrchestrator, RecoveryPlan, RecoveryResult, RecoveryStrategy,
    Severity,
};
pub use metrics::{MetricsSource, MetricsWindow, StaticMetricsSource, SystemMetrics};
