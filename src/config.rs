//! Healing configuration
//!
//! Configuration settings for detection thresholds, the seeded strategy and
//! confidence tables, execution limits, provider monitoring, failover,
//! history retention and learning. Loaded from TOML; every field has a
//! default so partial files are valid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{HealError, HealResult};
use crate::healing::failover::FailoverStrategy;
use crate::healing::types::{AnomalyType, RecoveryStrategy};

/// Top-level configuration for the healing core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingConfig {
    #[serde(default)]
    pub thresholds: Thresholds,

    /// Default strategy per anomaly type (seed for the learned table)
    #[serde(default = "default_strategy_table")]
    pub strategies: BTreeMap<AnomalyType, RecoveryStrategy>,

    /// Seed confidence per anomaly type (0.0 - 1.0)
    #[serde(default = "default_anomaly_confidence")]
    pub anomaly_confidence: BTreeMap<AnomalyType, f64>,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub health: HealthConfig,

    /// Known providers keyed by provider id
    #[serde(default = "default_providers")]
    pub providers: BTreeMap<String, ProviderProfile>,

    #[serde(default)]
    pub failover: FailoverConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub learning: LearningConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Detection thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    /// CPU usage (%) counted as load pressure
    pub cpu_usage: f64,
    /// CPU usage (%) counted as exhaustion
    pub cpu_critical: f64,
    pub memory_usage: f64,
    pub memory_critical: f64,
    pub disk_usage: f64,
    /// Response time (seconds)
    pub response_time: f64,
    /// Response time (seconds) that is always critical
    pub response_time_critical: f64,
    /// Response time (seconds) treated as a request timeout
    pub request_timeout: f64,
    /// Error rate (%)
    pub error_rate: f64,
    pub network_latency_ms: f64,
    pub queue_depth: u64,
    pub active_connections: u64,
    /// Request rate (req/s) that looks like a flood
    pub request_rate_flood: f64,
    /// Minimum acceptable per-service health score (0.0 - 1.0)
    pub service_health_min: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_usage: 80.0,
            cpu_critical: 95.0,
            memory_usage: 85.0,
            memory_critical: 95.0,
            disk_usage: 90.0,
            response_time: 2.0,
            response_time_critical: 4.0,
            request_timeout: 10.0,
            error_rate: 5.0,
            network_latency_ms: 500.0,
            queue_depth: 1000,
            active_connections: 5000,
            request_rate_flood: 10_000.0,
            service_health_min: 0.5,
        }
    }
}

fn default_strategy_table() -> BTreeMap<AnomalyType, RecoveryStrategy> {
    let mut table = BTreeMap::new();
    table.insert(AnomalyType::PerformanceDegradation, RecoveryStrategy::ScaleUp);
    table.insert(AnomalyType::ServiceUnavailable, RecoveryStrategy::Failover);
    table.insert(AnomalyType::ResourceExhaustion, RecoveryStrategy::ScaleUp);
    table.insert(AnomalyType::ConnectionFailure, RecoveryStrategy::CircuitBreaker);
    table.insert(AnomalyType::Timeout, RecoveryStrategy::Restart);
    table.insert(AnomalyType::ErrorSpike, RecoveryStrategy::CircuitBreaker);
    table.insert(AnomalyType::CapacityOverload, RecoveryStrategy::LoadBalance);
    table.insert(AnomalyType::Security, RecoveryStrategy::RateLimit);
    table
}

fn default_anomaly_confidence() -> BTreeMap<AnomalyType, f64> {
    let mut table = BTreeMap::new();
    table.insert(AnomalyType::PerformanceDegradation, 0.85);
    table.insert(AnomalyType::ServiceUnavailable, 0.95);
    table.insert(AnomalyType::ResourceExhaustion, 0.90);
    table.insert(AnomalyType::ConnectionFailure, 0.80);
    table.insert(AnomalyType::Timeout, 0.85);
    table.insert(AnomalyType::ErrorSpike, 0.90);
    table.insert(AnomalyType::CapacityOverload, 0.75);
    table.insert(AnomalyType::Security, 0.60);
    table
}

/// Limits for plan execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Retries per step after the first attempt
    #[serde(default = "default_max_step_retries")]
    pub max_step_retries: u32,

    /// Timeout for one step attempt (seconds)
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,

    /// Timeout for the whole plan (seconds)
    #[serde(default = "default_plan_timeout")]
    pub plan_timeout_secs: u64,

    /// Wait between executing a step and verifying it (milliseconds)
    #[serde(default = "default_verify_delay")]
    pub verify_delay_ms: u64,

    /// Backoff between step retries (milliseconds)
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

fn default_max_step_retries() -> u32 {
    2
}

fn default_step_timeout() -> u64 {
    30
}

fn default_plan_timeout() -> u64 {
    600 // 10 min
}

fn default_verify_delay() -> u64 {
    500
}

fn default_retry_backoff() -> u64 {
    1000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_step_retries: default_max_step_retries(),
            step_timeout_secs: default_step_timeout(),
            plan_timeout_secs: default_plan_timeout(),
            verify_delay_ms: default_verify_delay(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl ExecutorConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn plan_timeout(&self) -> Duration {
        Duration::from_secs(self.plan_timeout_secs)
    }

    pub fn verify_delay(&self) -> Duration {
        Duration::from_millis(self.verify_delay_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Provider health monitoring settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// How long a polled record stays fresh (seconds)
    pub cache_ttl_secs: u64,
    pub success_rate_warning: f64,
    pub success_rate_critical: f64,
    pub uptime_warning: f64,
    pub uptime_critical: f64,
    pub response_time_warning_ms: f64,
    pub response_time_critical_ms: f64,
    /// Response time used to normalize provider latency
    pub reference_response_time_ms: f64,
    /// Consecutive probe failures before the circuit opens
    pub circuit_failure_threshold: u32,
    /// How long an open circuit waits before a half-open probe (seconds)
    pub circuit_cooldown_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 120,
            success_rate_warning: 95.0,
            success_rate_critical: 80.0,
            uptime_warning: 99.0,
            uptime_critical: 95.0,
            response_time_warning_ms: 2000.0,
            response_time_critical_ms: 5000.0,
            reference_response_time_ms: 1000.0,
            circuit_failure_threshold: 5,
            circuit_cooldown_secs: 300, // 5 min
        }
    }
}

impl HealthConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_cooldown_secs)
    }
}

/// Static profile of an external provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderProfile {
    /// Baseline quality (0.0 - 1.0)
    #[serde(default = "default_baseline_quality")]
    pub baseline_quality: f64,
    /// Relative cost per 1k requests
    #[serde(default = "default_cost")]
    pub cost: f64,
    /// Lower value = preferred
    #[serde(default)]
    pub priority: u32,
    /// Ordered backup providers
    #[serde(default)]
    pub failover_chain: Vec<String>,
}

fn default_baseline_quality() -> f64 {
    0.8
}

fn default_cost() -> f64 {
    1.0
}

fn provider(baseline_quality: f64, cost: f64, priority: u32, chain: &[&str]) -> ProviderProfile {
    ProviderProfile {
        baseline_quality,
        cost,
        priority,
        failover_chain: chain.iter().map(|s| s.to_string()).collect(),
    }
}

fn default_providers() -> BTreeMap<String, ProviderProfile> {
    let mut providers = BTreeMap::new();
    providers.insert(
        "openai".to_string(),
        provider(0.95, 3.0, 1, &["anthropic", "google", "mistral"]),
    );
    providers.insert(
        "anthropic".to_string(),
        provider(0.95, 3.0, 2, &["openai", "google", "mistral"]),
    );
    providers.insert(
        "google".to_string(),
        provider(0.90, 2.0, 3, &["openai", "anthropic", "mistral"]),
    );
    providers.insert(
        "mistral".to_string(),
        provider(0.85, 1.0, 4, &["local", "google", "openai"]),
    );
    providers.insert(
        "local".to_string(),
        provider(0.70, 0.2, 5, &["mistral", "google"]),
    );
    providers
}

/// Failover coordination settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Backups retained in a plan
    pub max_backups: usize,
    /// Strategy used below medium severity
    pub low_severity_strategy: FailoverStrategy,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_backups: 2,
            low_severity_strategy: FailoverStrategy::RoundRobin,
        }
    }
}

/// Longest history retention accepted (ten years)
pub const MAX_RETENTION_DAYS: i64 = 3650;

/// Longest learning window accepted (one year)
pub const MAX_LEARNING_WINDOW_HOURS: i64 = 24 * 365;

/// History retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_entries: usize,
    pub retention_days: i64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            retention_days: 7,
        }
    }
}

/// Learning settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Minimum results per strategy before it influences the tables
    pub min_samples: usize,
    /// Occurrences before a lesson cause becomes a recommendation
    pub recurrence_threshold: usize,
    /// History window analysed per epoch (hours)
    pub window_hours: i64,
    pub confidence_boost: f64,
    pub confidence_penalty: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            min_samples: 1,
            recurrence_threshold: 2,
            window_hours: 24,
            confidence_boost: 0.1,
            confidence_penalty: 0.2,
        }
    }
}

/// Background loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// How often to sample metrics (seconds)
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Run a learning epoch every N cycles (0 disables)
    #[serde(default = "default_learning_every")]
    pub learning_every_cycles: u64,

    /// Snapshots kept in the rolling window
    #[serde(default = "default_metrics_window")]
    pub metrics_window: usize,

    /// Target name for system-wide anomalies
    #[serde(default = "default_system_target")]
    pub system_target: String,
}

fn default_scan_interval() -> u64 {
    30
}

fn default_learning_every() -> u64 {
    10
}

fn default_metrics_window() -> usize {
    120
}

fn default_system_target() -> String {
    "system".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            learning_every_cycles: default_learning_every(),
            metrics_window: default_metrics_window(),
            system_target: default_system_target(),
        }
    }
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            strategies: default_strategy_table(),
            anomaly_confidence: default_anomaly_confidence(),
            executor: ExecutorConfig::default(),
            health: HealthConfig::default(),
            providers: default_providers(),
            failover: FailoverConfig::default(),
            history: HistoryConfig::default(),
            learning: LearningConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl HealingConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(raw: &str) -> HealResult<Self> {
        let config: HealingConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> HealResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Reject settings the components cannot work with
    pub fn validate(&self) -> HealResult<()> {
        let t = &self.thresholds;
        let positive = [
            ("cpu_usage", t.cpu_usage),
            ("cpu_critical", t.cpu_critical),
            ("memory_usage", t.memory_usage),
            ("memory_critical", t.memory_critical),
            ("disk_usage", t.disk_usage),
            ("response_time", t.response_time),
            ("response_time_critical", t.response_time_critical),
            ("request_timeout", t.request_timeout),
            ("error_rate", t.error_rate),
            ("network_latency_ms", t.network_latency_ms),
            ("request_rate_flood", t.request_rate_flood),
            ("service_health_min", t.service_health_min),
        ];
        for (name, value) in positive {
            if !(value > 0.0) {
                return Err(HealError::Config(format!(
                    "threshold '{}' must be positive, got {}",
                    name, value
                )));
            }
        }
        let ordered = [
            ("cpu_critical", t.cpu_critical, "cpu_usage", t.cpu_usage),
            ("memory_critical", t.memory_critical, "memory_usage", t.memory_usage),
            (
                "response_time_critical",
                t.response_time_critical,
                "response_time",
                t.response_time,
            ),
        ];
        for (critical, critical_value, warning, warning_value) in ordered {
            if critical_value < warning_value {
                return Err(HealError::Config(format!(
                    "threshold '{}' ({}) must not be below '{}' ({})",
                    critical, critical_value, warning, warning_value
                )));
            }
        }
        if t.service_health_min > 1.0 {
            return Err(HealError::Config(
                "threshold 'service_health_min' must be at most 1.0".to_string(),
            ));
        }
        if self.failover.max_backups == 0 {
            return Err(HealError::Config(
                "failover.max_backups must be at least 1".to_string(),
            ));
        }
        if self.history.max_entries == 0 {
            return Err(HealError::Config(
                "history.max_entries must be at least 1".to_string(),
            ));
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&self.history.retention_days) {
            return Err(HealError::Config(format!(
                "history.retention_days must be within 1 - {}, got {}",
                MAX_RETENTION_DAYS, self.history.retention_days
            )));
        }
        if !(1..=MAX_LEARNING_WINDOW_HOURS).contains(&self.learning.window_hours) {
            return Err(HealError::Config(format!(
                "learning.window_hours must be within 1 - {}, got {}",
                MAX_LEARNING_WINDOW_HOURS, self.learning.window_hours
            )));
        }
        if self.health.reference_response_time_ms <= 0.0 {
            return Err(HealError::Config(
                "health.reference_response_time_ms must be positive".to_string(),
            ));
        }
        for (id, profile) in &self.providers {
            if profile.cost <= 0.0 {
                return Err(HealError::Config(format!(
                    "provider '{}' must have a positive cost",
                    id
                )));
            }
            if !(0.0..=1.0).contains(&profile.baseline_quality) {
                return Err(HealError::Config(format!(
                    "provider '{}' baseline_quality must be within 0.0 - 1.0",
                    id
                )));
            }
        }
        Ok(())
    }

    /// Create a fast config for testing
    #[cfg(test)]
    pub fn minimal() -> Self {
        Self {
            executor: ExecutorConfig {
                max_step_retries: 2,
                step_timeout_secs: 5,
                plan_timeout_secs: 60,
                verify_delay_ms: 10,
                retry_backoff_ms: 10,
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HealingConfig::default();
        assert_eq!(config.thresholds.cpu_usage, 80.0);
        assert_eq!(config.thresholds.response_time, 2.0);
        assert_eq!(config.executor.max_step_retries, 2);
        assert_eq!(config.failover.max_backups, 2);
        assert_eq!(config.strategies.len(), AnomalyType::ALL.len());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_chains_exclude_self() {
        let config = HealingConfig::default();
        for (id, profile) in &config.providers {
            assert!(!profile.failover_chain.contains(id));
        }
    }

    #[test]
    fn test_partial_toml() {
        let raw = r#"
            [thresholds]
            cpu_usage = 70.0

            [executor]
            max_step_retries = 4

            [failover]
            low_severity_strategy = "cost_optimized"
        "#;
        let config = HealingConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.thresholds.cpu_usage, 70.0);
        assert_eq!(config.thresholds.memory_usage, 85.0);
        assert_eq!(config.executor.max_step_retries, 4);
        assert_eq!(config.executor.step_timeout_secs, 30);
        assert_eq!(
            config.failover.low_severity_strategy,
            FailoverStrategy::CostOptimized
        );
        assert!(config.providers.contains_key("openai"));
    }

    #[test]
    fn test_strategy_table_from_toml() {
        let raw = r#"
            [strategies]
            timeout = "circuit_breaker"
        "#;
        let config = HealingConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.strategies.len(), 1);
        assert_eq!(
            config.strategies[&AnomalyType::Timeout],
            RecoveryStrategy::CircuitBreaker
        );
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let raw = r#"
            [thresholds]
            response_time = 0.0
        "#;
        let err = HealingConfig::from_toml_str(raw).unwrap_err();
        assert!(matches!(err, HealError::Config(_)));
    }

    #[test]
    fn test_critical_below_warning_rejected() {
        let raw = r#"
            [thresholds]
            response_time = 2.0
            response_time_critical = 1.0
        "#;
        let err = HealingConfig::from_toml_str(raw).unwrap_err();
        assert!(err.to_string().contains("response_time_critical"));

        let mut config = HealingConfig::default();
        config.thresholds.cpu_critical = config.thresholds.cpu_usage - 1.0;
        assert!(config.validate().is_err());

        let mut config = HealingConfig::default();
        config.thresholds.memory_critical = config.thresholds.memory_usage - 1.0;
        assert!(config.validate().is_err());

        // Equal thresholds are allowed
        let mut config = HealingConfig::default();
        config.thresholds.response_time_critical = config.thresholds.response_time;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_history_and_learning_windows_bounded() {
        for retention_days in [0, -1, MAX_RETENTION_DAYS + 1] {
            let mut config = HealingConfig::default();
            config.history.retention_days = retention_days;
            assert!(config.validate().is_err(), "retention_days {}", retention_days);
        }
        for window_hours in [0, -24, i64::MAX] {
            let mut config = HealingConfig::default();
            config.learning.window_hours = window_hours;
            assert!(config.validate().is_err(), "window_hours {}", window_hours);
        }

        let raw = r#"
            [history]
            retention_days = -1
        "#;
        assert!(matches!(
            HealingConfig::from_toml_str(raw),
            Err(HealError::Config(_))
        ));
    }

    #[test]
    fn test_zero_backups_rejected() {
        let mut config = HealingConfig::default();
        config.failover.max_backups = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("selfheal.toml");
        std::fs::write(&path, "[history]\nmax_entries = 50\n").unwrap();
        let config = HealingConfig::load(&path).unwrap();
        assert_eq!(config.history.max_entries, 50);
        assert_eq!(config.history.retention_days, 7);
    }

    #[test]
    fn test_config_serialization() {
        let config = HealingConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: HealingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.thresholds, config.thresholds);
        assert_eq!(parsed.strategies, config.strategies);
    }
}
