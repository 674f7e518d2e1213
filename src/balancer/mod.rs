//! Health-aware selection of one worker out of a weighted pool.
//!
//! The balancer is a simpler, session-aware sibling of the dispatcher: it
//! knows nothing about capabilities, only weight, health, connections and
//! response time. The orchestrator keeps one [`Worker`] per registered node.
//!
//! Failure accounting is central: `mark_failure` bumps a counter and flips
//! the worker unhealthy at the configured threshold, `mark_success` walks it
//! back, and [`LoadBalancer::decay_failures`] ages out old failures on a
//! single periodic tick driven by the health-check loop.

pub mod algorithm;
pub mod health;
pub mod worker;

use std::collections::HashMap;
use std::time::Instant;

use crate::config::BalancerConfig;
use crate::stats::BalancerStats;

pub use algorithm::BalancingAlgorithm;
pub use health::{spawn_health_checks, HealthProbe, SharedBalancer};
pub use worker::Worker;

#[derive(Debug, Clone)]
struct SessionBinding {
    worker_id: String,
    last_seen: Instant,
}

/// Weighted, health-aware worker selection.
#[derive(Debug)]
pub struct LoadBalancer {
    config: BalancerConfig,
    workers: Vec<Worker>,
    cursor: usize,
    sessions: HashMap<String, SessionBinding>,
}

impl LoadBalancer {
    pub fn new(config: BalancerConfig) -> Self {
        Self {
            config,
            workers: Vec::new(),
            cursor: 0,
            sessions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// Add a worker, replacing any existing worker with the same id.
    pub fn add_worker(&mut self, mut worker: Worker) {
        if worker.max_connections == usize::MAX {
            worker.max_connections = self.config.default_max_connections;
        }
        tracing::info!(worker_id = %worker.id, weight = worker.weight, "Worker added");
        match self.workers.iter_mut().find(|w| w.id == worker.id) {
            Some(existing) => *existing = worker,
            None => self.workers.push(worker),
        }
    }

    pub fn remove_worker(&mut self, worker_id: &str) -> bool {
        let before = self.workers.len();
        self.workers.retain(|w| w.id != worker_id);
        if self.workers.len() == before {
            return false;
        }
        self.sessions.retain(|_, b| b.worker_id != worker_id);
        tracing::info!(worker_id, "Worker removed");
        true
    }

    pub fn update_weight(&mut self, worker_id: &str, weight: u32) -> bool {
        self.with_worker(worker_id, |w| w.weight = weight)
    }

    pub fn worker(&self, worker_id: &str) -> Option<&Worker> {
        self.workers.iter().find(|w| w.id == worker_id)
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn healthy_workers(&self) -> Vec<&Worker> {
        self.workers.iter().filter(|w| w.healthy).collect()
    }

    /// Pick the next worker. With sticky sessions on, a keyed request goes
    /// back to its bound worker while that worker is healthy and the binding
    /// is younger than the session TTL.
    pub fn get_next(&mut self, session_key: Option<&str>) -> Option<Worker> {
        let now = Instant::now();
        let sticky_key = session_key.filter(|_| self.config.sticky_sessions);

        if let Some(key) = sticky_key {
            if let Some(worker) = self.sticky_worker(key, now) {
                return Some(worker);
            }
        }

        let candidates: Vec<&Worker> = self.workers.iter().filter(|w| w.is_available()).collect();
        let index = self
            .config
            .algorithm
            .select(&candidates, &mut self.cursor, session_key)?;
        let worker = candidates[index].clone();

        if let Some(key) = sticky_key {
            self.sessions.insert(
                key.to_string(),
                SessionBinding {
                    worker_id: worker.id.clone(),
                    last_seen: now,
                },
            );
        }

        Some(worker)
    }

    fn sticky_worker(&mut self, key: &str, now: Instant) -> Option<Worker> {
        let ttl = self.config.session_ttl();
        let binding = self.sessions.get_mut(key)?;
        if now.duration_since(binding.last_seen) > ttl {
            self.sessions.remove(key);
            return None;
        }
        let worker = self
            .workers
            .iter()
            .find(|w| w.id == binding.worker_id && w.healthy)?;
        binding.last_seen = now;
        Some(worker.clone())
    }

    pub fn connection_start(&mut self, worker_id: &str) -> bool {
        self.with_worker(worker_id, |w| {
            w.active_connections += 1;
            w.total_requests += 1;
        })
    }

    pub fn connection_end(&mut self, worker_id: &str, response_time_ms: Option<f64>) -> bool {
        self.with_worker(worker_id, |w| {
            w.active_connections = w.active_connections.saturating_sub(1);
            if let Some(sample) = response_time_ms {
                w.record_response_time(sample);
            }
        })
    }

    pub fn mark_failure(&mut self, worker_id: &str) -> bool {
        let max_failures = self.config.max_failures;
        self.with_worker(worker_id, |w| {
            w.consecutive_failures += 1;
            w.total_failures += 1;
            w.last_failure = Some(Instant::now());
            if w.healthy && w.consecutive_failures >= max_failures {
                w.healthy = false;
                tracing::warn!(
                    worker_id = %w.id,
                    failures = w.consecutive_failures,
                    "Worker marked unhealthy"
                );
            }
        })
    }

    pub fn mark_success(&mut self, worker_id: &str) -> bool {
        self.with_worker(worker_id, |w| {
            w.consecutive_failures = w.consecutive_failures.saturating_sub(1);
            if w.consecutive_failures == 0 {
                restore(w);
            }
        })
    }

    /// Apply a health probe result.
    pub fn apply_probe(&mut self, worker_id: &str, healthy: bool) -> bool {
        self.with_worker(worker_id, |w| {
            if healthy {
                w.consecutive_failures = 0;
                restore(w);
            } else if w.healthy {
                w.healthy = false;
                tracing::warn!(worker_id = %w.id, "Health probe failed, worker marked unhealthy");
            }
        })
    }

    /// Erode one failure from every worker whose last failure is older than
    /// the reset window. Returns the number of workers touched.
    pub fn decay_failures(&mut self) -> usize {
        self.decay_failures_at(Instant::now())
    }

    pub fn decay_failures_at(&mut self, now: Instant) -> usize {
        let reset = self.config.failure_reset();
        let mut decayed = 0;
        for w in &mut self.workers {
            let due = w
                .last_failure
                .is_some_and(|at| now.saturating_duration_since(at) >= reset);
            if w.consecutive_failures > 0 && due {
                w.consecutive_failures -= 1;
                w.last_failure = Some(now);
                if w.consecutive_failures == 0 {
                    restore(w);
                }
                decayed += 1;
            }
        }
        decayed
    }

    /// Drop sticky bindings older than the session TTL.
    pub fn prune_sessions(&mut self) -> usize {
        let ttl = self.config.session_ttl();
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, b| now.duration_since(b.last_seen) <= ttl);
        before - self.sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> BalancerStats {
        BalancerStats::from_workers(&self.workers)
    }

    fn with_worker(&mut self, worker_id: &str, f: impl FnOnce(&mut Worker)) -> bool {
        match self.workers.iter_mut().find(|w| w.id == worker_id) {
            Some(worker) => {
                f(worker);
                true
            }
            None => false,
        }
    }
}

fn restore(w: &mut Worker) {
    if !w.healthy {
        w.healthy = true;
        tracing::info!(worker_id = %w.id, "Worker restored to healthy");
    }
}
