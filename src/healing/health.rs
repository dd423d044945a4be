//! Provider health monitoring
//!
//! Polls external providers through a `ProviderProbe`, classifies their
//! health, computes a quality score and keeps one cached record per
//! provider. Each provider has a circuit breaker that stops probing after
//! repeated probe failures.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{HealingConfig, HealthConfig, ProviderProfile};
use crate::error::{HealError, HealResult};

use super::clock::{to_chrono, Clock};
use super::events::{AlertEvent, AlertSink};

/// Baseline quality for providers without a configured profile
const UNPROFILED_BASELINE: f64 = 0.8;

/// Utilization (%) above which quality starts to drop
const CAPACITY_KNEE: f64 = 80.0;

/// Coarse provider health
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unavailable,
    /// Probe failed and no verdict is possible yet
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unavailable => write!(f, "unavailable"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - probing normally
    #[default]
    Closed,
    /// Circuit is open - provider treated as unavailable
    Open,
    /// Circuit is half-open - next probe decides
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Raw measurements returned by a probe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawProviderMetrics {
    pub response_time_ms: f64,
    /// Percent of successful requests
    pub success_rate: f64,
    /// Percent of failed requests
    pub error_rate: f64,
    /// Percent
    pub uptime: f64,
    /// Percent of provisioned capacity in use
    #[serde(default)]
    pub capacity_utilization: f64,
}

/// Live health record for one provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceHealth {
    pub provider_id: String,
    pub status: HealthStatus,
    pub response_time_ms: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub uptime: f64,
    pub capacity_utilization: f64,
    /// Quality score (0.0 - 1.0)
    pub quality_score: f64,
    pub last_checked: DateTime<Utc>,
    pub circuit_state: CircuitState,
}

impl ServiceHealth {
    fn from_raw(
        provider_id: &str,
        raw: &RawProviderMetrics,
        status: HealthStatus,
        quality_score: f64,
        checked_at: DateTime<Utc>,
        circuit_state: CircuitState,
    ) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            status,
            response_time_ms: raw.response_time_ms,
            success_rate: raw.success_rate,
            error_rate: raw.error_rate,
            uptime: raw.uptime,
            capacity_utilization: raw.capacity_utilization,
            quality_score,
            last_checked: checked_at,
            circuit_state,
        }
    }

    /// Record for a provider that could not be measured
    fn unmeasured(
        provider_id: &str,
        status: HealthStatus,
        checked_at: DateTime<Utc>,
        circuit_state: CircuitState,
    ) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            status,
            response_time_ms: 0.0,
            success_rate: 0.0,
            error_rate: 100.0,
            uptime: 0.0,
            capacity_utilization: 0.0,
            quality_score: 0.0,
            last_checked: checked_at,
            circuit_state,
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self.status, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// Source of provider measurements
#[async_trait::async_trait]
pub trait ProviderProbe: Send + Sync {
    async fn probe(&self, provider_id: &str) -> HealResult<RawProviderMetrics>;
}

/// Probe that serves preset measurements
#[derive(Default)]
pub struct StaticProbe {
    samples: Mutex<BTreeMap<String, RawProviderMetrics>>,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, provider_id: &str, metrics: RawProviderMetrics) {
        self.samples.lock().insert(provider_id.to_string(), metrics);
    }

    pub fn remove(&self, provider_id: &str) {
        self.samples.lock().remove(provider_id);
    }
}

#[async_trait::async_trait]
impl ProviderProbe for StaticProbe {
    async fn probe(&self, provider_id: &str) -> HealResult<RawProviderMetrics> {
        self.samples
            .lock()
            .get(provider_id)
            .cloned()
            .ok_or_else(|| HealError::Probe(provider_id.to_string(), "no sample".to_string()))
    }
}

/// Classify raw measurements into a status band
pub fn classify(raw: &RawProviderMetrics, config: &HealthConfig) -> HealthStatus {
    let critical = raw.success_rate < config.success_rate_critical
        || raw.uptime < config.uptime_critical
        || raw.response_time_ms > config.response_time_critical_ms;
    if critical {
        return HealthStatus::Unavailable;
    }

    let warning = raw.success_rate < config.success_rate_warning
        || raw.uptime < config.uptime_warning
        || raw.response_time_ms > config.response_time_warning_ms;
    if warning {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// 1.0 up to the knee, falling linearly to 0.5 at full utilization
fn capacity_factor(utilization: f64) -> f64 {
    if utilization <= CAPACITY_KNEE {
        return 1.0;
    }
    let over = (utilization - CAPACITY_KNEE) / (100.0 - CAPACITY_KNEE);
    (1.0 - 0.5 * over).clamp(0.5, 1.0)
}

fn fraction(percent: f64) -> f64 {
    if percent.is_nan() {
        0.0
    } else {
        (percent / 100.0).clamp(0.0, 1.0)
    }
}

/// Quality score in [0, 1]
pub fn quality_score(baseline: f64, raw: &RawProviderMetrics) -> f64 {
    let score = baseline
        * fraction(raw.success_rate)
        * fraction(raw.uptime)
        * capacity_factor(raw.capacity_utilization);
    score.clamp(0.0, 1.0)
}

/// Per-provider circuit breaker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCircuit {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_changed_at: Option<DateTime<Utc>>,
    /// When to try half-open state (if circuit is open)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
}

impl ProviderCircuit {
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = 0;
        if self.state == CircuitState::HalfOpen {
            self.transition_to_closed(now);
        }
    }

    /// Record a probe failure; returns true if this opened the circuit
    pub fn record_failure(&mut self, failure_threshold: u32, now: DateTime<Utc>) -> bool {
        self.consecutive_failures += 1;

        let should_open = match self.state {
            CircuitState::Closed => self.consecutive_failures >= failure_threshold,
            // Any failure in half-open reopens circuit
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if should_open {
            self.transition_to_open(now);
        }
        should_open
    }

    pub fn transition_to_closed(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Closed;
        self.state_changed_at = Some(now);
        self.retry_at = None;
        self.consecutive_failures = 0;
    }

    pub fn transition_to_open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.state_changed_at = Some(now);
    }

    pub fn transition_to_half_open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::HalfOpen;
        self.state_changed_at = Some(now);
        self.retry_at = None;
    }

    pub fn should_try_half_open(&self, now: DateTime<Utc>) -> bool {
        if self.state != CircuitState::Open {
            return false;
        }
        match self.retry_at {
            Some(retry_at) => now >= retry_at,
            None => false,
        }
    }
}

/// Polls providers and caches their health
pub struct HealthMonitor {
    config: HealthConfig,
    providers: BTreeMap<String, ProviderProfile>,
    probe: Arc<dyn ProviderProbe>,
    clock: Arc<dyn Clock>,
    alerts: Arc<dyn AlertSink>,
    cache: DashMap<String, ServiceHealth>,
    circuits: DashMap<String, ProviderCircuit>,
}

impl HealthMonitor {
    pub fn new(
        config: &HealingConfig,
        probe: Arc<dyn ProviderProbe>,
        clock: Arc<dyn Clock>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            config: config.health.clone(),
            providers: config.providers.clone(),
            probe,
            clock,
            alerts,
            cache: DashMap::new(),
            circuits: DashMap::new(),
        }
    }

    /// Cached record if still fresh, otherwise a new probe
    pub async fn poll(&self, provider_id: &str) -> ServiceHealth {
        if let Some(record) = self.fresh(provider_id) {
            return record;
        }
        self.refresh(provider_id).await
    }

    /// Probe now, bypassing the cache
    pub async fn refresh(&self, provider_id: &str) -> ServiceHealth {
        let now = self.clock.now();

        // Open circuits short-circuit to unavailable until the cooldown elapses
        let gate = {
            let mut circuit = self.circuits.entry(provider_id.to_string()).or_default();
            if circuit.state == CircuitState::Open {
                if circuit.should_try_half_open(now) {
                    circuit.transition_to_half_open(now);
                    tracing::info!("Provider {} circuit half-open, probing", provider_id);
                    None
                } else {
                    Some(circuit.state)
                }
            } else {
                None
            }
        };
        if let Some(state) = gate {
            let record =
                ServiceHealth::unmeasured(provider_id, HealthStatus::Unavailable, now, state);
            self.cache.insert(provider_id.to_string(), record.clone());
            return record;
        }

        let outcome = self.probe.probe(provider_id).await;
        let checked_at = self.clock.now();

        let record = match outcome {
            Ok(raw) => {
                let state = {
                    let mut circuit = self.circuits.entry(provider_id.to_string()).or_default();
                    circuit.record_success(checked_at);
                    circuit.state
                };
                let status = classify(&raw, &self.config);
                let baseline = self
                    .providers
                    .get(provider_id)
                    .map(|p| p.baseline_quality)
                    .unwrap_or(UNPROFILED_BASELINE);
                if status != HealthStatus::Healthy {
                    tracing::warn!(
                        "Provider {} is {}: success {:.1}%, uptime {:.1}%, {:.0}ms",
                        provider_id,
                        status,
                        raw.success_rate,
                        raw.uptime,
                        raw.response_time_ms
                    );
                }
                ServiceHealth::from_raw(
                    provider_id,
                    &raw,
                    status,
                    quality_score(baseline, &raw),
                    checked_at,
                    state,
                )
            }
            Err(e) => {
                tracing::warn!("Health probe failed for {}: {}", provider_id, e);
                let (opened, state, failures) = {
                    let mut circuit = self.circuits.entry(provider_id.to_string()).or_default();
                    let opened =
                        circuit.record_failure(self.config.circuit_failure_threshold, checked_at);
                    if opened {
                        circuit.retry_at =
                            Some(checked_at + to_chrono(self.config.circuit_cooldown()));
                    }
                    (opened, circuit.state, circuit.consecutive_failures)
                };
                if opened {
                    self.alerts
                        .emit(AlertEvent::circuit_opened(provider_id, failures));
                }
                let status = if state == CircuitState::Open {
                    HealthStatus::Unavailable
                } else {
                    HealthStatus::Unknown
                };
                ServiceHealth::unmeasured(provider_id, status, checked_at, state)
            }
        };

        self.cache.insert(provider_id.to_string(), record.clone());
        record
    }

    /// Poll several providers concurrently
    pub async fn poll_all(&self, provider_ids: &[String]) -> Vec<ServiceHealth> {
        join_all(provider_ids.iter().map(|id| self.poll(id))).await
    }

    /// Every configured provider
    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// Last record regardless of age
    pub fn cached(&self, provider_id: &str) -> Option<ServiceHealth> {
        self.cache.get(provider_id).map(|r| r.value().clone())
    }

    /// All cached records keyed by provider
    pub fn snapshot(&self) -> BTreeMap<String, ServiceHealth> {
        self.cache
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn circuit_state(&self, provider_id: &str) -> CircuitState {
        self.circuits
            .get(provider_id)
            .map(|c| c.state)
            .unwrap_or_default()
    }

    pub fn open_circuits(&self) -> usize {
        self.circuits
            .iter()
            .filter(|c| c.state == CircuitState::Open)
            .count()
    }

    fn fresh(&self, provider_id: &str) -> Option<ServiceHealth> {
        let record = self.cache.get(provider_id)?;
        let age = self.clock.now() - record.last_checked;
        if age < to_chrono(self.config.cache_ttl()) {
            Some(record.value().clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healing::clock::ManualClock;
    use crate::healing::events::{AlertKind, MemoryAlertSink};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn raw(response_time_ms: f64, success_rate: f64, uptime: f64) -> RawProviderMetrics {
        RawProviderMetrics {
            response_time_ms,
            success_rate,
            error_rate: 100.0 - success_rate,
            uptime,
            capacity_utilization: 50.0,
        }
    }

    /// Counts probes and fails while `failing` is set
    struct CountingProbe {
        calls: AtomicUsize,
        failing: Mutex<bool>,
        sample: RawProviderMetrics,
    }

    impl CountingProbe {
        fn new(sample: RawProviderMetrics) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failing: Mutex::new(false),
                sample,
            }
        }
    }

    #[async_trait::async_trait]
    impl ProviderProbe for CountingProbe {
        async fn probe(&self, provider_id: &str) -> HealResult<RawProviderMetrics> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if *self.failing.lock() {
                Err(HealError::Probe(provider_id.to_string(), "refused".to_string()))
            } else {
                Ok(self.sample.clone())
            }
        }
    }

    fn monitor(
        probe: Arc<dyn ProviderProbe>,
    ) -> (HealthMonitor, Arc<ManualClock>, Arc<MemoryAlertSink>) {
        let clock = Arc::new(ManualClock::default());
        let alerts = Arc::new(MemoryAlertSink::new());
        let monitor = HealthMonitor::new(
            &HealingConfig::default(),
            probe,
            clock.clone(),
            alerts.clone(),
        );
        (monitor, clock, alerts)
    }

    #[test]
    fn test_classify_bands() {
        let config = HealthConfig::default();
        assert_eq!(classify(&raw(500.0, 99.5, 99.9), &config), HealthStatus::Healthy);
        assert_eq!(classify(&raw(2500.0, 99.5, 99.9), &config), HealthStatus::Degraded);
        assert_eq!(classify(&raw(500.0, 90.0, 99.9), &config), HealthStatus::Degraded);
        assert_eq!(classify(&raw(500.0, 99.5, 98.0), &config), HealthStatus::Degraded);
        assert_eq!(classify(&raw(6000.0, 99.5, 99.9), &config), HealthStatus::Unavailable);
        assert_eq!(classify(&raw(500.0, 70.0, 99.9), &config), HealthStatus::Unavailable);
        assert_eq!(classify(&raw(500.0, 99.5, 90.0), &config), HealthStatus::Unavailable);
    }

    #[test]
    fn test_quality_score() {
        let mut sample = raw(500.0, 100.0, 100.0);
        assert!((quality_score(0.9, &sample) - 0.9).abs() < 1e-9);

        sample.capacity_utilization = 90.0;
        assert!((quality_score(1.0, &sample) - 0.75).abs() < 1e-9);

        sample.capacity_utilization = 100.0;
        assert!((quality_score(1.0, &sample) - 0.5).abs() < 1e-9);

        let sample = raw(500.0, 50.0, 50.0);
        assert!((quality_score(1.0, &sample) - 0.25).abs() < 1e-9);

        let sample = raw(500.0, 150.0, 100.0);
        assert!(quality_score(1.0, &sample) <= 1.0);
    }

    #[tokio::test]
    async fn test_poll_uses_cache_within_ttl() {
        let probe = Arc::new(CountingProbe::new(raw(400.0, 99.0, 99.5)));
        let (monitor, clock, _) = monitor(probe.clone());

        let first = monitor.poll("openai").await;
        assert_eq!(first.status, HealthStatus::Healthy);
        assert!((first.quality_score - 0.95 * 0.99 * 0.995).abs() < 1e-9);

        clock.advance(Duration::from_secs(60));
        let second = monitor.poll("openai").await;
        assert_eq!(second.last_checked, first.last_checked);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(61));
        monitor.poll("openai").await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_bypasses_cache() {
        let probe = Arc::new(CountingProbe::new(raw(400.0, 99.0, 99.5)));
        let (monitor, _, _) = monitor(probe.clone());
        monitor.poll("openai").await;
        monitor.refresh("openai").await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_probe_reports_unknown() {
        let probe = Arc::new(CountingProbe::new(raw(400.0, 99.0, 99.5)));
        *probe.failing.lock() = true;
        let (monitor, _, _) = monitor(probe);
        let record = monitor.poll("openai").await;
        assert_eq!(record.status, HealthStatus::Unknown);
        assert_eq!(record.quality_score, 0.0);
        assert_eq!(record.circuit_state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_opens_and_recovers() {
        let probe = Arc::new(CountingProbe::new(raw(400.0, 99.0, 99.5)));
        *probe.failing.lock() = true;
        let (monitor, clock, alerts) = monitor(probe.clone());

        for _ in 0..5 {
            monitor.refresh("google").await;
        }
        assert_eq!(monitor.circuit_state("google"), CircuitState::Open);
        assert_eq!(alerts.count(AlertKind::ProviderCircuitOpened), 1);
        assert_eq!(monitor.open_circuits(), 1);

        // Open circuit: no probing during cooldown
        let record = monitor.refresh("google").await;
        assert_eq!(record.status, HealthStatus::Unavailable);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 5);

        // Half-open probe succeeds and closes the circuit
        *probe.failing.lock() = false;
        clock.advance(Duration::from_secs(301));
        let record = monitor.refresh("google").await;
        assert_eq!(record.status, HealthStatus::Healthy);
        assert_eq!(record.circuit_state, CircuitState::Closed);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let probe = Arc::new(CountingProbe::new(raw(400.0, 99.0, 99.5)));
        *probe.failing.lock() = true;
        let (monitor, clock, alerts) = monitor(probe);
        for _ in 0..5 {
            monitor.refresh("local").await;
        }
        clock.advance(Duration::from_secs(301));
        let record = monitor.refresh("local").await;
        assert_eq!(record.status, HealthStatus::Unavailable);
        assert_eq!(monitor.circuit_state("local"), CircuitState::Open);
        assert_eq!(alerts.count(AlertKind::ProviderCircuitOpened), 2);
    }

    #[tokio::test]
    async fn test_poll_all_concurrent() {
        let probe = Arc::new(StaticProbe::new());
        probe.set("openai", raw(300.0, 99.9, 99.9));
        probe.set("anthropic", raw(2500.0, 99.9, 99.9));
        let (monitor, _, _) = monitor(probe);

        let ids = vec!["openai".to_string(), "anthropic".to_string(), "mistral".to_string()];
        let records = monitor.poll_all(&ids).await;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].status, HealthStatus::Healthy);
        assert_eq!(records[1].status, HealthStatus::Degraded);
        assert_eq!(records[2].status, HealthStatus::Unknown);
        assert_eq!(monitor.snapshot().len(), 3);
    }
}
