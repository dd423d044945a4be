//! System metrics
//!
//! Snapshots supplied by the external metric source, the bounded rolling
//! window the orchestrator keeps them in, and the `MetricsSource` seam the
//! executor uses to capture before/after snapshots.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::error::HealResult;

/// Timestamped snapshot of system and service metrics.
///
/// Percentages are 0-100, `response_time` is in seconds, latency in
/// milliseconds, service health scores are 0-1.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemMetrics {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub disk_usage: f64,
    #[serde(default)]
    pub network_latency_ms: f64,
    #[serde(default)]
    pub request_rate: f64,
    #[serde(default)]
    pub error_rate: f64,
    #[serde(default)]
    pub response_time: f64,
    #[serde(default)]
    pub active_connections: u64,
    #[serde(default)]
    pub queue_depth: u64,
    #[serde(default)]
    pub service_health: BTreeMap<String, f64>,
}

fn percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_nan() || value < 0.0 {
        0.0
    } else {
        value
    }
}

fn unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

impl SystemMetrics {
    /// Empty snapshot taken at `timestamp`
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }

    /// Sanitized copy: NaN becomes 0, percentages are clamped to 0-100,
    /// rates and durations to >= 0, health scores to 0-1.
    pub fn clamped(&self) -> Self {
        Self {
            timestamp: self.timestamp,
            cpu_usage: percent(self.cpu_usage),
            memory_usage: percent(self.memory_usage),
            disk_usage: percent(self.disk_usage),
            network_latency_ms: non_negative(self.network_latency_ms),
            request_rate: non_negative(self.request_rate),
            error_rate: percent(self.error_rate),
            response_time: non_negative(self.response_time),
            active_connections: self.active_connections,
            queue_depth: self.queue_depth,
            service_health: self
                .service_health
                .iter()
                .map(|(name, score)| (name.clone(), unit(*score)))
                .collect(),
        }
    }
}

/// Bounded rolling window of recent snapshots
#[derive(Debug, Clone)]
pub struct MetricsWindow {
    samples: VecDeque<SystemMetrics>,
    capacity: usize,
}

impl MetricsWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a snapshot, evicting the oldest once full
    pub fn push(&mut self, metrics: SystemMetrics) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(metrics);
    }

    pub fn latest(&self) -> Option<&SystemMetrics> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SystemMetrics> {
        self.samples.iter()
    }

    /// Mean response time over the window, in seconds
    pub fn mean_response_time(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let total: f64 = self.samples.iter().map(|m| m.response_time).sum();
        Some(total / self.samples.len() as f64)
    }
}

/// Source of live metrics snapshots
#[async_trait::async_trait]
pub trait MetricsSource: Send + Sync {
    async fn snapshot(&self) -> HealResult<SystemMetrics>;
}

/// Metrics source that always returns the last snapshot it was given
pub struct StaticMetricsSource {
    current: Mutex<SystemMetrics>,
}

impl StaticMetricsSource {
    pub fn new(initial: SystemMetrics) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }

    pub fn set(&self, metrics: SystemMetrics) {
        *self.current.lock() = metrics;
    }
}

#[async_trait::async_trait]
impl MetricsSource for StaticMetricsSource {
    async fn snapshot(&self) -> HealResult<SystemMetrics> {
        Ok(self.current.lock().clone())
    }
}
