//! Static partitioning of a test list into shards.
//!
//! Sharding is a pure function of the input tests, the shard count, the
//! strategy and the recorded duration history. It never looks at live node
//! state; the dispatcher decides where shards actually run.
//!
//! # Strategies
//!
//! See [`ShardStrategy`]. `Duration` is the default: it bin-packs estimated
//! durations longest-first, which keeps the slowest shard as short as the
//! greedy heuristic allows.
//!
//! # Duration estimates
//!
//! A test's known duration wins; otherwise the median of its last recorded
//! samples in [`DurationHistory`]; otherwise the configured default.

pub mod history;
pub mod strategy;

use serde::{Deserialize, Serialize};

use crate::capability::TaskRequirements;
use crate::config::ShardingConfig;
use crate::error::{OrchestratorError, Result};

pub use history::DurationHistory;
pub use strategy::ShardStrategy;

/// One logical test to be scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Source file, used by file sharding.
    #[serde(default)]
    pub file: Option<String>,
    /// Known duration in milliseconds, if any.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub requirements: TaskRequirements,
}

impl TestCase {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            file: None,
            duration_ms: None,
            priority: 0,
            requirements: TaskRequirements::default(),
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_requirements(mut self, requirements: TaskRequirements) -> Self {
        self.requirements = requirements;
        self
    }
}

/// One precomputed partition of the test list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub index: usize,
    pub total: usize,
    pub tests: Vec<TestCase>,
    pub estimated_duration_ms: u64,
    pub weight: u64,
}

impl Shard {
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn contains(&self, test_id: &str) -> bool {
        self.tests.iter().any(|t| t.id == test_id)
    }
}

/// `min(max(ceil(total / target), 1), max_shards, test_count)`, never below 1.
pub fn calculate_optimal_shard_count(
    total_duration_ms: u64,
    target_duration_ms: u64,
    max_shards: usize,
    test_count: usize,
) -> usize {
    let by_duration = total_duration_ms.div_ceil(target_duration_ms.max(1)).max(1) as usize;
    by_duration.min(max_shards).min(test_count).max(1)
}

/// Creates shards from test lists using the duration history for estimates.
#[derive(Debug, Clone)]
pub struct ShardingEngine {
    config: ShardingConfig,
    history: DurationHistory,
}

impl Default for ShardingEngine {
    fn default() -> Self {
        Self::new(ShardingConfig::default())
    }
}

impl ShardingEngine {
    pub fn new(config: ShardingConfig) -> Self {
        let history = DurationHistory::new(config.history_window);
        Self { config, history }
    }

    pub fn with_history(config: ShardingConfig, history: DurationHistory) -> Self {
        Self { config, history }
    }

    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    pub fn history(&self) -> &DurationHistory {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut DurationHistory {
        &mut self.history
    }

    pub fn estimate_duration(&self, test: &TestCase) -> u64 {
        test.duration_ms
            .or_else(|| self.history.median(&test.id))
            .unwrap_or(self.config.default_duration_ms)
    }

    pub fn total_estimated_duration(&self, tests: &[TestCase]) -> u64 {
        tests.iter().map(|t| self.estimate_duration(t)).sum()
    }

    /// Shard count for `tests` under the configured target duration and cap.
    pub fn optimal_shard_count(&self, tests: &[TestCase]) -> usize {
        calculate_optimal_shard_count(
            self.total_estimated_duration(tests),
            self.config.target_shard_duration_ms,
            self.config.max_shards,
            tests.len(),
        )
    }

    /// Split `tests` into `shard_count` shards with the configured strategy.
    pub fn shard(&self, tests: &[TestCase], shard_count: usize) -> Result<Vec<Shard>> {
        self.create_shards(tests, shard_count, self.config.strategy)
    }

    /// Split `tests` into exactly `shard_count` shards. Every input test lands
    /// in exactly one shard; an empty list yields empty shards.
    pub fn create_shards(
        &self,
        tests: &[TestCase],
        shard_count: usize,
        strategy: ShardStrategy,
    ) -> Result<Vec<Shard>> {
        if shard_count == 0 {
            return Err(OrchestratorError::InvalidShardCount(shard_count));
        }

        let durations: Vec<u64> = tests.iter().map(|t| self.estimate_duration(t)).collect();
        let groups = strategy::partition(
            strategy,
            tests,
            &durations,
            shard_count,
            &self.config.hash_seed,
        );

        let shards: Vec<Shard> = groups
            .into_iter()
            .enumerate()
            .map(|(index, members)| Shard {
                index,
                total: shard_count,
                estimated_duration_ms: members.iter().map(|&i| durations[i]).sum(),
                weight: members.iter().map(|&i| strategy::test_weight(&tests[i])).sum(),
                tests: members.into_iter().map(|i| tests[i].clone()).collect(),
            })
            .collect();

        tracing::debug!(
            strategy = %strategy,
            shard_count,
            tests = tests.len(),
            max_shard_ms = shards.iter().map(|s| s.estimated_duration_ms).max().unwrap_or(0),
            "Created shards"
        );

        Ok(shards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tests_with_durations(durations: &[u64]) -> Vec<TestCase> {
        durations
            .iter()
            .enumerate()
            .map(|(i, &d)| TestCase::new(format!("t{}", i)).with_duration_ms(d))
            .collect()
    }

    #[test]
    fn zero_shards_is_an_error() {
        let engine = ShardingEngine::default();
        let result = engine.create_shards(&tests_with_durations(&[1]), 0, ShardStrategy::Count);
        assert!(matches!(result, Err(OrchestratorError::InvalidShardCount(0))));
    }

    #[test]
    fn empty_list_yields_empty_shards() {
        let engine = ShardingEngine::default();
        let shards = engine.create_shards(&[], 3, ShardStrategy::Duration).unwrap();
        assert_eq!(shards.len(), 3);
        assert!(shards.iter().all(Shard::is_empty));
        assert!(shards.iter().all(|s| s.total == 3));
    }

    #[test]
    fn estimate_prefers_known_then_history_then_default() {
        let mut engine = ShardingEngine::default();
        engine.history_mut().record("b", 4_000);

        assert_eq!(engine.estimate_duration(&TestCase::new("a").with_duration_ms(10)), 10);
        assert_eq!(engine.estimate_duration(&TestCase::new("b")), 4_000);
        assert_eq!(engine.estimate_duration(&TestCase::new("c")), 60_000);
    }

    #[test]
    fn optimal_shard_count_formula() {
        assert_eq!(calculate_optimal_shard_count(1_000, 300, 50, 100), 4);
        assert_eq!(calculate_optimal_shard_count(1_000, 300, 2, 100), 2);
        assert_eq!(calculate_optimal_shard_count(1_000, 300, 50, 3), 3);
        assert_eq!(calculate_optimal_shard_count(0, 300, 50, 10), 1);
        assert_eq!(calculate_optimal_shard_count(0, 300, 50, 0), 1);
    }

    #[test]
    fn engine_optimal_shard_count_uses_estimates() {
        let config = ShardingConfig {
            target_shard_duration_ms: 1_000,
            ..Default::default()
        };
        let engine = ShardingEngine::new(config);
        let tests = tests_with_durations(&[900, 900, 900]);
        assert_eq!(engine.optimal_shard_count(&tests), 3);
    }

    #[test]
    fn shard_weight_accumulates_priority() {
        let engine = ShardingEngine::default();
        let tests = vec![
            TestCase::new("a").with_priority(5),
            TestCase::new("b").with_priority(0),
        ];
        let shards = engine.create_shards(&tests, 1, ShardStrategy::Weighted).unwrap();
        assert_eq!(shards[0].weight, 6);
    }
}
