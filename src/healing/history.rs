//! Recovery history
//!
//! Append-only store of finalized `RecoveryResult`s with a retention window,
//! and the per-strategy summary the learning engine consumes.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::config::HistoryConfig;
use crate::error::HealResult;

use super::clock::Clock;
use super::executor::{ExecutionStatus, RecoveryResult};
use super::types::RecoveryStrategy;

/// Inclusive time range over result finish times
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `hours` leading up to `now`, saturating at the earliest
    /// representable time
    pub fn last_hours(now: DateTime<Utc>, hours: i64) -> Self {
        let start = Duration::try_hours(hours)
            .and_then(|span| now.checked_sub_signed(span))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { start, end: now }
    }

    pub fn all() -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

/// Outcome counts for one strategy
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StrategyStats {
    pub attempts: usize,
    pub completed: usize,
    pub partial: usize,
    pub failed: usize,
    /// Mean success rate over every finalized result
    pub mean_success_rate: f64,
}

impl StrategyStats {
    fn record(&mut self, result: &RecoveryResult) {
        let total = self.mean_success_rate * self.attempts as f64 + result.success_rate;
        self.attempts += 1;
        self.mean_success_rate = total / self.attempts as f64;
        match result.status {
            ExecutionStatus::Completed => self.completed += 1,
            ExecutionStatus::Partial => self.partial += 1,
            ExecutionStatus::Failed => self.failed += 1,
            ExecutionStatus::Pending | ExecutionStatus::InProgress => {}
        }
    }
}

/// A lesson cause and how often it occurred
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CauseCount {
    pub cause: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HistorySummary {
    pub total: usize,
    pub by_strategy: BTreeMap<RecoveryStrategy, StrategyStats>,
    /// Most frequent first
    pub causes: Vec<CauseCount>,
}

impl HistorySummary {
    pub fn from_results(results: &[RecoveryResult]) -> Self {
        let mut by_strategy: BTreeMap<RecoveryStrategy, StrategyStats> = BTreeMap::new();
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();

        for result in results.iter().filter(|r| r.status.is_terminal()) {
            by_strategy.entry(result.strategy).or_default().record(result);
            for lesson in &result.lessons_learned {
                *counts.entry(lesson.cause.as_str()).or_insert(0) += 1;
            }
        }

        let mut causes: Vec<CauseCount> = counts
            .into_iter()
            .map(|(cause, count)| CauseCount {
                cause: cause.to_string(),
                count,
            })
            .collect();
        // Stable: ties stay in cause order
        causes.sort_by(|a, b| b.count.cmp(&a.count));

        Self {
            total: results.len(),
            by_strategy,
            causes,
        }
    }

    /// Causes seen at least `threshold` times
    pub fn recurring(&self, threshold: usize) -> impl Iterator<Item = &CauseCount> {
        self.causes.iter().filter(move |c| c.count >= threshold)
    }
}

/// Results in a window plus their summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryHistory {
    pub window: TimeWindow,
    pub results: Vec<RecoveryResult>,
    pub summary: HistorySummary,
}

impl RecoveryHistory {
    pub fn new(window: TimeWindow, results: Vec<RecoveryResult>) -> Self {
        let summary = HistorySummary::from_results(&results);
        Self {
            window,
            results,
            summary,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Persistence boundary for recovery results
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, result: RecoveryResult) -> HealResult<()>;

    async fn query(&self, window: TimeWindow) -> HealResult<RecoveryHistory>;
}

/// Bounded in-memory history
pub struct InMemoryHistoryStore {
    entries: RwLock<VecDeque<RecoveryResult>>,
    max_entries: usize,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl InMemoryHistoryStore {
    pub fn new(config: &HistoryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            max_entries: config.max_entries.max(1),
            retention: Duration::try_days(config.retention_days.max(1)).unwrap_or(Duration::MAX),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn prune(&self, entries: &mut VecDeque<RecoveryResult>) {
        if let Some(cutoff) = self.clock.now().checked_sub_signed(self.retention) {
            while entries.front().is_some_and(|r| r.finished_at < cutoff) {
                entries.pop_front();
            }
        }
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, result: RecoveryResult) -> HealResult<()> {
        let mut entries = self.entries.write();
        entries.push_back(result);
        self.prune(&mut entries);
        Ok(())
    }

    async fn query(&self, window: TimeWindow) -> HealResult<RecoveryHistory> {
        let results: Vec<RecoveryResult> = {
            let mut entries = self.entries.write();
            self.prune(&mut entries);
            entries
                .iter()
                .filter(|r| window.contains(r.finished_at))
                .cloned()
                .collect()
        };
        Ok(RecoveryHistory::new(window, results))
    }
}
