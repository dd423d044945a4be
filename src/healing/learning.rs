//! Learning from recovery history
//!
//! Reads finalized recovery results and proposes a `LearningUpdate`: better
//! default strategies per anomaly type, per-strategy confidence deltas,
//! extracted patterns and recommendations for recurring failure causes. The
//! update is applied to the shared tables as one epoch by `TableStore`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::LearningConfig;

use super::executor::{ExecutionStatus, RecoveryResult};
use super::history::RecoveryHistory;
use super::tables::HealingTables;
use super::types::{AnomalyType, RecoveryStrategy};

/// Mean success at or above which a strategy is considered reliable
const SUCCESS_MEAN: f64 = 0.8;

/// Mean success at or below which a strategy is considered unreliable
const FAILURE_MEAN: f64 = 0.3;

// ============================================================================
// Pattern Types
// ============================================================================

/// Type of learned pattern
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// Strategy that reliably resolves an anomaly type
    SuccessPattern,
    /// Strategy that should be avoided
    AntiPattern,
    /// Failure cause that keeps coming back
    RecurringFailure,
}

impl std::fmt::Display for PatternType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatternType::SuccessPattern => write!(f, "success_pattern"),
            PatternType::AntiPattern => write!(f, "anti_pattern"),
            PatternType::RecurringFailure => write!(f, "recurring_failure"),
        }
    }
}

/// What a pattern matches on
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PatternSignature {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly_type: Option<AnomalyType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RecoveryStrategy>,
    /// Lesson causes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
}

/// Types of suggested actions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    PreferStrategy,
    AvoidStrategy,
    /// Look into a step that keeps failing
    InvestigateStep,
    RaiseStepTimeout,
    ExtendPlanTimeout,
    /// A rollback step is unreliable
    ReviewRollback,
    /// Plans keep contending for the same targets
    ReduceConcurrency,
    /// Log and monitor
    Monitor,
}

/// Suggested action when a pattern is matched
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuggestedAction {
    pub action_type: ActionType,
    pub description: String,
    /// Priority (higher = more important)
    pub priority: i32,
}

/// A pattern extracted from recovery history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub id: String,
    pub pattern_type: PatternType,
    pub signature: PatternSignature,
    /// Confidence level (0.0 - 1.0)
    pub confidence: f64,
    /// Number of results this pattern was observed in
    pub occurrence_count: u64,
    pub suggested_actions: Vec<SuggestedAction>,
    pub created_at: DateTime<Utc>,
}

/// A recommendation for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    /// The pattern that triggered this recommendation
    pub pattern_id: String,
    pub action: SuggestedAction,
    pub confidence: f64,
    pub reason: String,
}

/// Output of one learning pass, applied atomically to the tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningUpdate {
    pub id: String,
    /// Table version the update was computed against
    pub base_version: u64,
    pub new_patterns: Vec<LearnedPattern>,
    /// Changed default strategies only
    pub strategy_table: BTreeMap<AnomalyType, RecoveryStrategy>,
    /// Additive confidence adjustment per strategy
    pub confidence_deltas: BTreeMap<RecoveryStrategy, f64>,
    pub recommendations: Vec<Recommendation>,
    pub results_analyzed: usize,
    pub generated_at: DateTime<Utc>,
}

impl LearningUpdate {
    pub fn empty(base_version: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            base_version,
            new_patterns: Vec::new(),
            strategy_table: BTreeMap::new(),
            confidence_deltas: BTreeMap::new(),
            recommendations: Vec::new(),
            results_analyzed: 0,
            generated_at: Utc::now(),
        }
    }

    /// True if applying the update would not change any table
    pub fn changes_nothing(&self) -> bool {
        self.strategy_table.is_empty() && self.confidence_deltas.is_empty()
    }
}

/// Running mean
#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    count: usize,
    sum: f64,
}

impl Tally {
    fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

// ============================================================================
// Learning Engine
// ============================================================================

pub struct LearningEngine {
    config: LearningConfig,
}

impl LearningEngine {
    pub fn new(config: &LearningConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Derive a table update from a history window
    pub fn learn(&self, history: &RecoveryHistory, tables: &HealingTables) -> LearningUpdate {
        let mut update = LearningUpdate::empty(tables.version);
        let finalized: Vec<&RecoveryResult> = history
            .results
            .iter()
            .filter(|r| r.status.is_terminal())
            .collect();
        update.results_analyzed = finalized.len();
        if finalized.is_empty() {
            return update;
        }

        // Completed results per anomaly type and strategy
        let mut completed: BTreeMap<AnomalyType, BTreeMap<RecoveryStrategy, Tally>> =
            BTreeMap::new();
        // Every finalized result per strategy
        let mut by_strategy: BTreeMap<RecoveryStrategy, Tally> = BTreeMap::new();

        for result in &finalized {
            by_strategy
                .entry(result.strategy)
                .or_default()
                .add(result.success_rate);
            if let (ExecutionStatus::Completed, Some(anomaly_type)) =
                (result.status, result.anomaly_type)
            {
                completed
                    .entry(anomaly_type)
                    .or_default()
                    .entry(result.strategy)
                    .or_default()
                    .add(result.success_rate);
            }
        }

        for (anomaly_type, candidates) in &completed {
            let current = tables.strategy_for(*anomaly_type);
            let Some((best, tally)) = self.best_strategy(candidates, current) else {
                continue;
            };

            if tally.mean() >= SUCCESS_MEAN {
                update.new_patterns.push(success_pattern(*anomaly_type, best, tally));
            }
            if Some(best) != current {
                tracing::info!(
                    "Learning: default strategy for {} {:?} -> {} (mean success {:.2} over {} runs)",
                    anomaly_type,
                    current,
                    best,
                    tally.mean(),
                    tally.count
                );
                update.strategy_table.insert(*anomaly_type, best);
            }
        }

        for (strategy, tally) in &by_strategy {
            if tally.count < self.config.min_samples {
                continue;
            }
            let mean = tally.mean();
            if mean >= SUCCESS_MEAN {
                update
                    .confidence_deltas
                    .insert(*strategy, self.config.confidence_boost);
            } else if mean <= FAILURE_MEAN {
                update
                    .confidence_deltas
                    .insert(*strategy, -self.config.confidence_penalty);
                update.new_patterns.push(anti_pattern(*strategy, tally));
            }
        }

        for cause in history.summary.recurring(self.config.recurrence_threshold) {
            let confidence = (cause.count as f64 / finalized.len() as f64).min(1.0);
            let pattern = recurring_pattern(&cause.cause, cause.count, confidence);
            if let Some(action) = pattern.suggested_actions.first() {
                update.recommendations.push(Recommendation {
                    pattern_id: pattern.id.clone(),
                    action: action.clone(),
                    confidence,
                    reason: format!(
                        "'{}' occurred {} times in {} recoveries",
                        cause.cause,
                        cause.count,
                        finalized.len()
                    ),
                });
            }
            update.new_patterns.push(pattern);
        }

        update
    }

    /// Highest mean, then most samples, then the current default
    fn best_strategy(
        &self,
        candidates: &BTreeMap<RecoveryStrategy, Tally>,
        current: Option<RecoveryStrategy>,
    ) -> Option<(RecoveryStrategy, Tally)> {
        candidates
            .iter()
            .filter(|(_, tally)| tally.count >= self.config.min_samples)
            .map(|(strategy, tally)| (*strategy, *tally))
            .max_by(|(a, a_tally), (b, b_tally)| {
                a_tally
                    .mean()
                    .partial_cmp(&b_tally.mean())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a_tally.count.cmp(&b_tally.count))
                    .then((Some(*a) == current).cmp(&(Some(*b) == current)))
            })
    }
}

fn success_pattern(anomaly_type: AnomalyType, strategy: RecoveryStrategy, tally: Tally) -> LearnedPattern {
    LearnedPattern {
        id: format!("success_{}", uuid::Uuid::new_v4()),
        pattern_type: PatternType::SuccessPattern,
        signature: PatternSignature {
            anomaly_type: Some(anomaly_type),
            strategy: Some(strategy),
            ..Default::default()
        },
        confidence: tally.mean().clamp(0.0, 1.0),
        occurrence_count: tally.count as u64,
        suggested_actions: vec![SuggestedAction {
            action_type: ActionType::PreferStrategy,
            description: format!("Use {} for {}", strategy, anomaly_type),
            priority: 1,
        }],
        created_at: Utc::now(),
    }
}

fn anti_pattern(strategy: RecoveryStrategy, tally: &Tally) -> LearnedPattern {
    LearnedPattern {
        id: format!("anti_{}", uuid::Uuid::new_v4()),
        pattern_type: PatternType::AntiPattern,
        signature: PatternSignature {
            strategy: Some(strategy),
            ..Default::default()
        },
        confidence: (1.0 - tally.mean()).clamp(0.0, 1.0),
        occurrence_count: tally.count as u64,
        suggested_actions: vec![SuggestedAction {
            action_type: ActionType::AvoidStrategy,
            description: format!(
                "{} succeeds {:.0}% of the time; prefer an alternative",
                strategy,
                tally.mean() * 100.0
            ),
            priority: 2,
        }],
        created_at: Utc::now(),
    }
}

fn recurring_pattern(cause: &str, count: usize, confidence: f64) -> LearnedPattern {
    let (kind, subject) = match cause.split_once(':') {
        Some((kind, subject)) => (kind, subject),
        None => (cause, ""),
    };
    let (action_type, description, priority) = match kind {
        "step_failed" => (
            ActionType::InvestigateStep,
            format!("Investigate why '{}' keeps failing", subject),
            2,
        ),
        "verification_failed" => (
            ActionType::InvestigateStep,
            format!("'{}' runs but does not verify; check its effect", subject),
            2,
        ),
        "step_timeout" => (
            ActionType::RaiseStepTimeout,
            format!("'{}' keeps timing out; raise the step timeout", subject),
            1,
        ),
        "plan_timeout" => (
            ActionType::ExtendPlanTimeout,
            "Plans keep exceeding their time budget".to_string(),
            1,
        ),
        "rollback_failed" => (
            ActionType::ReviewRollback,
            format!("Rollback '{}' is unreliable; review it manually", subject),
            3,
        ),
        "lock_wait" => (
            ActionType::ReduceConcurrency,
            "Plans keep contending for the same targets".to_string(),
            1,
        ),
        _ => (ActionType::Monitor, format!("Monitor '{}'", cause), 0),
    };

    LearnedPattern {
        id: format!("recurring_{}", uuid::Uuid::new_v4()),
        pattern_type: PatternType::RecurringFailure,
        signature: PatternSignature {
            causes: vec![cause.to_string()],
            ..Default::default()
        },
        confidence,
        occurrence_count: count as u64,
        suggested_actions: vec![SuggestedAction {
            action_type,
            description,
            priority,
        }],
        created_at: Utc::now(),
    }
}
