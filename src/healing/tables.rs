//! Versioned strategy, threshold and confidence tables
//!
//! Detection and planning read an immutable `Arc` snapshot; learning epochs
//! publish a complete new version under the write lock, so concurrent
//! readers never observe a partial update.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{HealingConfig, Thresholds};
use crate::error::{HealError, HealResult};

use super::learning::LearningUpdate;
use super::types::{AnomalyType, RecoveryStrategy};

/// Bound on the learned per-strategy confidence adjustment
pub const MAX_CONFIDENCE_ADJUSTMENT: f64 = 0.5;

/// Seed confidence for anomaly types missing from the table
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// One version of the shared configuration tables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealingTables {
    pub version: u64,
    pub thresholds: Thresholds,
    pub strategies: BTreeMap<AnomalyType, RecoveryStrategy>,
    pub anomaly_confidence: BTreeMap<AnomalyType, f64>,
    /// Learned additive adjustment per strategy
    pub strategy_adjustment: BTreeMap<RecoveryStrategy, f64>,
    pub updated_at: DateTime<Utc>,
    /// Update that produced this version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_id: Option<String>,
}

impl HealingTables {
    /// Version 1, seeded from configuration
    pub fn from_config(config: &HealingConfig) -> Self {
        Self {
            version: 1,
            thresholds: config.thresholds.clone(),
            strategies: config.strategies.clone(),
            anomaly_confidence: config.anomaly_confidence.clone(),
            strategy_adjustment: BTreeMap::new(),
            updated_at: Utc::now(),
            last_update_id: None,
        }
    }

    pub fn strategy_for(&self, anomaly_type: AnomalyType) -> Option<RecoveryStrategy> {
        self.strategies.get(&anomaly_type).copied()
    }

    pub fn confidence_seed(&self, anomaly_type: AnomalyType) -> f64 {
        self.anomaly_confidence
            .get(&anomaly_type)
            .copied()
            .unwrap_or(DEFAULT_CONFIDENCE)
    }

    pub fn adjustment(&self, strategy: RecoveryStrategy) -> f64 {
        self.strategy_adjustment
            .get(&strategy)
            .copied()
            .unwrap_or(0.0)
    }

    /// Next version with a learning update folded in
    pub fn with_update(&self, update: &LearningUpdate) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.updated_at = Utc::now();
        next.last_update_id = Some(update.id.clone());

        for (anomaly_type, strategy) in &update.strategy_table {
            next.strategies.insert(*anomaly_type, *strategy);
        }

        for (strategy, delta) in &update.confidence_deltas {
            let current = next.adjustment(*strategy);
            let adjusted = (current + delta)
                .clamp(-MAX_CONFIDENCE_ADJUSTMENT, MAX_CONFIDENCE_ADJUSTMENT);
            next.strategy_adjustment.insert(*strategy, adjusted);
        }

        next
    }
}

/// Owner of the current table version
pub struct TableStore {
    current: RwLock<Arc<HealingTables>>,
}

impl TableStore {
    pub fn new(tables: HealingTables) -> Self {
        Self {
            current: RwLock::new(Arc::new(tables)),
        }
    }

    pub fn from_config(config: &HealingConfig) -> Self {
        Self::new(HealingTables::from_config(config))
    }

    /// Consistent snapshot for one detection or planning pass
    pub fn snapshot(&self) -> Arc<HealingTables> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Apply a learning update as one epoch; returns the new version.
    ///
    /// The update must have been computed against the current version.
    /// Anything older is rejected so a delta is never counted twice and a
    /// stale strategy pick never overwrites a newer one.
    pub fn apply(&self, update: &LearningUpdate) -> HealResult<u64> {
        let mut current = self.current.write();
        if update.base_version != current.version {
            tracing::warn!(
                "Rejected learning update {}: computed against table v{} but current is v{}",
                update.id,
                update.base_version,
                current.version
            );
            return Err(HealError::StaleUpdate(update.base_version, current.version));
        }
        let next = current.with_update(update);
        let version = next.version;
        *current = Arc::new(next);
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(base_version: u64) -> LearningUpdate {
        let mut update = LearningUpdate::empty(base_version);
        update
            .strategy_table
            .insert(AnomalyType::Timeout, RecoveryStrategy::CircuitBreaker);
        update
            .confidence_deltas
            .insert(RecoveryStrategy::CircuitBreaker, 0.1);
        update
    }

    #[test]
    fn test_seeded_from_config() {
        let tables = HealingTables::from_config(&HealingConfig::default());
        assert_eq!(tables.version, 1);
        assert_eq!(
            tables.strategy_for(AnomalyType::ServiceUnavailable),
            Some(RecoveryStrategy::Failover)
        );
        assert_eq!(tables.confidence_seed(AnomalyType::ErrorSpike), 0.90);
        assert_eq!(tables.adjustment(RecoveryStrategy::Restart), 0.0);
    }

    #[test]
    fn test_apply_publishes_new_version() {
        let store = TableStore::from_config(&HealingConfig::default());
        let before = store.snapshot();

        let version = store.apply(&update(1)).unwrap();
        assert_eq!(version, 2);

        let after = store.snapshot();
        assert_eq!(
            after.strategy_for(AnomalyType::Timeout),
            Some(RecoveryStrategy::CircuitBreaker)
        );
        assert!((after.adjustment(RecoveryStrategy::CircuitBreaker) - 0.1).abs() < 1e-9);

        // Earlier snapshot is untouched
        assert_eq!(before.version, 1);
        assert_eq!(
            before.strategy_for(AnomalyType::Timeout),
            Some(RecoveryStrategy::Restart)
        );
    }

    #[test]
    fn test_stale_update_rejected() {
        let store = TableStore::from_config(&HealingConfig::default());
        let mut first = LearningUpdate::empty(1);
        first.confidence_deltas.insert(RecoveryStrategy::Restart, 0.1);
        let mut second = LearningUpdate::empty(1);
        second.confidence_deltas.insert(RecoveryStrategy::Restart, 0.1);
        second
            .strategy_table
            .insert(AnomalyType::Timeout, RecoveryStrategy::CircuitBreaker);

        assert_eq!(store.apply(&first).unwrap(), 2);
        let err = store.apply(&second).unwrap_err();
        assert!(matches!(err, HealError::StaleUpdate(1, 2)));

        let tables = store.snapshot();
        assert_eq!(tables.version, 2);
        assert!((tables.adjustment(RecoveryStrategy::Restart) - 0.1).abs() < 1e-9);
        assert_eq!(
            tables.strategy_for(AnomalyType::Timeout),
            Some(RecoveryStrategy::Restart)
        );
    }

    #[test]
    fn test_adjustment_is_bounded() {
        let store = TableStore::from_config(&HealingConfig::default());
        for _ in 0..10 {
            let mut update = LearningUpdate::empty(store.version());
            update
                .confidence_deltas
                .insert(RecoveryStrategy::Restart, -0.2);
            store.apply(&update).unwrap();
        }
        assert_eq!(
            store.snapshot().adjustment(RecoveryStrategy::Restart),
            -MAX_CONFIDENCE_ADJUSTMENT
        );
        assert_eq!(store.version(), 11);
    }

    #[test]
    fn test_concurrent_readers_see_whole_versions() {
        let store = Arc::new(TableStore::from_config(&HealingConfig::default()));
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let mut update = LearningUpdate::empty(store.version());
                    update
                        .confidence_deltas
                        .insert(RecoveryStrategy::ScaleUp, 0.01);
                    update
                        .confidence_deltas
                        .insert(RecoveryStrategy::Restart, 0.01);
                    store.apply(&update).unwrap();
                }
            })
        };
        for _ in 0..200 {
            let snapshot = store.snapshot();
            assert_eq!(
                snapshot.adjustment(RecoveryStrategy::ScaleUp),
                snapshot.adjustment(RecoveryStrategy::Restart)
            );
        }
        writer.join().unwrap();
    }
}
