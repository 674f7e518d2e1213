use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::balancer::BalancingAlgorithm;
use crate::error::{OrchestratorError, Result};
use crate::scheduler::policy::SelectionStrategy;
use crate::sharding::ShardStrategy;

/// Configuration for the node registry and task dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Interval between heartbeat-timeout sweeps.
    pub heartbeat_interval_ms: u64,
    /// A node silent for more than `multiplier × interval` is marked offline.
    pub heartbeat_timeout_multiplier: u32,
    /// Maximum number of live (non-terminal) tasks accepted at once.
    pub max_live_tasks: usize,
    /// Load ceiling per core when a node descriptor does not set one.
    pub load_per_core: usize,
    /// Window used for the trailing throughput statistic.
    pub throughput_window_secs: u64,
    /// Node-selection policy.
    pub selection: SelectionStrategy,
    /// Capacity of the command channel into the dispatcher service.
    pub command_buffer: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_multiplier: 3,
            max_live_tasks: 10_000,
            load_per_core: 2,
            throughput_window_secs: 60,
            selection: SelectionStrategy::LeastLoaded,
            command_buffer: 256,
        }
    }
}

impl DispatcherConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_timeout_multiplier
    }

    pub fn throughput_window(&self) -> Duration {
        Duration::from_secs(self.throughput_window_secs)
    }

    pub fn with_selection(mut self, selection: SelectionStrategy) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(invalid("heartbeat_interval_ms must be positive"));
        }
        if self.heartbeat_timeout_multiplier == 0 {
            return Err(invalid("heartbeat_timeout_multiplier must be positive"));
        }
        if self.max_live_tasks == 0 {
            return Err(invalid("max_live_tasks must be positive"));
        }
        if self.load_per_core == 0 {
            return Err(invalid("load_per_core must be positive"));
        }
        if self.throughput_window_secs == 0 {
            return Err(invalid("throughput_window_secs must be positive"));
        }
        if self.command_buffer == 0 {
            return Err(invalid("command_buffer must be positive"));
        }
        Ok(())
    }
}

/// Configuration for the worker load balancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub algorithm: BalancingAlgorithm,
    pub sticky_sessions: bool,
    pub session_ttl_ms: u64,
    /// Consecutive failures that flip a worker unhealthy.
    pub max_failures: u32,
    /// Age after which one recorded failure decays away.
    pub failure_reset_ms: u64,
    pub health_check_interval_ms: u64,
    /// Connection ceiling for workers added without an explicit one.
    pub default_max_connections: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: BalancingAlgorithm::LeastConnections,
            sticky_sessions: false,
            session_ttl_ms: 300_000,
            max_failures: 3,
            failure_reset_ms: 60_000,
            health_check_interval_ms: 10_000,
            default_max_connections: 100,
        }
    }
}

impl BalancerConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }

    pub fn failure_reset(&self) -> Duration {
        Duration::from_millis(self.failure_reset_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn with_algorithm(mut self, algorithm: BalancingAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_sticky_sessions(mut self, ttl_ms: u64) -> Self {
        self.sticky_sessions = true;
        self.session_ttl_ms = ttl_ms;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_failures == 0 {
            return Err(invalid("max_failures must be positive"));
        }
        if self.health_check_interval_ms == 0 {
            return Err(invalid("health_check_interval_ms must be positive"));
        }
        if self.default_max_connections == 0 {
            return Err(invalid("default_max_connections must be positive"));
        }
        if self.sticky_sessions && self.session_ttl_ms == 0 {
            return Err(invalid("session_ttl_ms must be positive when sticky sessions are on"));
        }
        Ok(())
    }
}

/// Configuration for the sharding engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    pub strategy: ShardStrategy,
    /// Estimate used for tests with neither a known duration nor history.
    pub default_duration_ms: u64,
    /// Number of samples kept per test in the duration history.
    pub history_window: usize,
    /// Seed mixed into the hash strategy.
    pub hash_seed: String,
    /// Desired wall-clock duration of one shard.
    pub target_shard_duration_ms: u64,
    pub max_shards: usize,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            strategy: ShardStrategy::Duration,
            default_duration_ms: 60_000,
            history_window: 10,
            hash_seed: String::new(),
            target_shard_duration_ms: 300_000,
            max_shards: 50,
        }
    }
}

impl ShardingConfig {
    pub fn with_strategy(mut self, strategy: ShardStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.history_window == 0 {
            return Err(invalid("history_window must be positive"));
        }
        if self.target_shard_duration_ms == 0 {
            return Err(invalid("target_shard_duration_ms must be positive"));
        }
        if self.max_shards == 0 {
            return Err(invalid("max_shards must be positive"));
        }
        Ok(())
    }
}

/// Top-level configuration for [`crate::orchestrator::Orchestrator`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub dispatcher: DispatcherConfig,
    pub balancer: BalancerConfig,
    pub sharding: ShardingConfig,
    /// Deadline for a whole run to drain. `None` waits indefinitely.
    pub run_timeout_ms: Option<u64>,
}

impl OrchestratorConfig {
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.dispatcher.validate()?;
        self.balancer.validate()?;
        self.sharding.validate()?;
        if self.run_timeout_ms == Some(0) {
            return Err(invalid("run_timeout_ms must be positive when set"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> OrchestratorError {
    OrchestratorError::InvalidConfig(msg.to_string())
}
