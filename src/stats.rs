//! Read-only snapshots derived from dispatcher, sharding and balancer state.

use serde::Serialize;

use crate::balancer::Worker;
use crate::scheduler::{NodeStatus, TaskStatus};
use crate::sharding::Shard;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeCounts {
    pub idle: usize,
    pub busy: usize,
    pub offline: usize,
    pub draining: usize,
}

impl NodeCounts {
    pub fn record(&mut self, status: NodeStatus) {
        match status {
            NodeStatus::Idle => self.idle += 1,
            NodeStatus::Busy => self.busy += 1,
            NodeStatus::Offline => self.offline += 1,
            NodeStatus::Draining => self.draining += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.idle + self.busy + self.offline + self.draining
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_submitted: usize,
}

impl TaskCounts {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Assigned => self.assigned += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn sum(&self) -> usize {
        self.pending + self.assigned + self.running + self.completed + self.failed + self.cancelled
    }

    pub fn in_flight(&self) -> usize {
        self.pending + self.assigned + self.running
    }

    /// Nothing left to schedule or wait for.
    pub fn is_drained(&self) -> bool {
        self.in_flight() == 0
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub nodes: NodeCounts,
    pub tasks: TaskCounts,
    pub queue_depth: usize,
    /// Tasks finished (completed or failed) per second over the trailing window.
    pub throughput_per_sec: f64,
    pub total_load: usize,
    pub total_capacity: usize,
}

impl DispatcherStats {
    pub fn utilization(&self) -> f64 {
        if self.total_capacity == 0 {
            0.0
        } else {
            self.total_load as f64 / self.total_capacity as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShardStats {
    pub shard_count: usize,
    pub total_tests: usize,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub mean_duration_ms: f64,
    /// `1 - stddev / mean` of shard durations; 1.0 is perfectly even.
    pub balance: f64,
}

impl ShardStats {
    pub fn from_shards(shards: &[Shard]) -> Self {
        let durations: Vec<u64> = shards.iter().map(|s| s.estimated_duration_ms).collect();
        let count = durations.len();
        let mean = if count == 0 {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / count as f64
        };

        let balance = if mean == 0.0 {
            1.0
        } else {
            let variance = durations
                .iter()
                .map(|&d| (d as f64 - mean).powi(2))
                .sum::<f64>()
                / count as f64;
            1.0 - variance.sqrt() / mean
        };

        Self {
            shard_count: count,
            total_tests: shards.iter().map(Shard::len).sum(),
            min_duration_ms: durations.iter().copied().min().unwrap_or(0),
            max_duration_ms: durations.iter().copied().max().unwrap_or(0),
            mean_duration_ms: mean,
            balance,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BalancerStats {
    pub total_workers: usize,
    pub healthy_workers: usize,
    pub active_connections: usize,
    pub avg_response_time_ms: f64,
    pub total_requests: u64,
    pub total_failures: u64,
}

impl BalancerStats {
    pub fn from_workers(workers: &[Worker]) -> Self {
        let avg_response_time_ms = if workers.is_empty() {
            0.0
        } else {
            workers.iter().map(|w| w.response_time_ms).sum::<f64>() / workers.len() as f64
        };
        Self {
            total_workers: workers.len(),
            healthy_workers: workers.iter().filter(|w| w.healthy).count(),
            active_connections: workers.iter().map(|w| w.active_connections).sum(),
            avg_response_time_ms,
            total_requests: workers.iter().map(|w| w.total_requests).sum(),
            total_failures: workers.iter().map(|w| w.total_failures).sum(),
        }
    }
}
