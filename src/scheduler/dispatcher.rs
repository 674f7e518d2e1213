use std::collections::VecDeque;

use chrono::Utc;
use tokio::time::Instant;

use crate::capability::TaskRequirements;
use crate::config::DispatcherConfig;
use crate::error::{OrchestratorError, Result};
use crate::scheduler::node::{Node, NodeDescriptor, NodeId, NodeStatus};
use crate::scheduler::policy::SelectionPolicy;
use crate::scheduler::queue::TaskQueue;
use crate::scheduler::task::{Task, TaskId, TaskResult, TaskStatus};
use crate::sharding::TestCase;
use crate::stats::{DispatcherStats, NodeCounts, TaskCounts};

/// A task handed to a node, to be forwarded to the executor.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub node_address: String,
    pub test: TestCase,
    /// The task's requeue count when it was handed out. Reports must quote
    /// it, so a run abandoned on a lost node cannot settle a later attempt.
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Was still queued; removed and cancelled.
    Dequeued,
    /// Was assigned or running; marked cancelled, the node must be told.
    Signalled { node_id: Option<NodeId> },
    AlreadyFinished,
    NotFound,
}

impl CancelOutcome {
    pub fn cancelled(&self) -> bool {
        matches!(self, CancelOutcome::Dequeued | CancelOutcome::Signalled { .. })
    }
}

/// Node timed out by the heartbeat sweep, with the tasks it gave back.
#[derive(Debug, Clone)]
pub struct NodeTimeout {
    pub node_id: NodeId,
    pub requeued: Vec<TaskId>,
}

/// Node registry, task queue and assignment logic.
///
/// This is a plain state machine with no I/O and no clock of its own beyond
/// `Instant::now()` for heartbeats; the [`DispatcherService`] wraps it in a
/// single-owner task so every mutation is serialized.
///
/// [`DispatcherService`]: crate::scheduler::service::DispatcherService
#[derive(Debug)]
pub struct Dispatcher {
    config: DispatcherConfig,
    /// Registration order; round-robin depends on it.
    nodes: Vec<Node>,
    next_node_id: NodeId,
    queue: TaskQueue,
    policy: Box<dyn SelectionPolicy>,
    finished_at: VecDeque<Instant>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let policy = config.selection.build();
        Self::with_policy(config, policy)
    }

    pub fn with_policy(config: DispatcherConfig, policy: Box<dyn SelectionPolicy>) -> Self {
        Self {
            queue: TaskQueue::with_capacity(config.max_live_tasks),
            config,
            nodes: Vec::new(),
            next_node_id: 1,
            policy,
            finished_at: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    // ---------------------------------------------------------------------
    // Node registry
    // ---------------------------------------------------------------------

    pub fn register_node(&mut self, descriptor: NodeDescriptor) -> NodeId {
        let id = self.next_node_id;
        self.next_node_id += 1;
        let node = Node::from_descriptor(id, descriptor, self.config.load_per_core);
        tracing::info!(
            node_id = id,
            name = %node.name,
            address = %node.address(),
            max_load = node.max_load,
            "Node registered"
        );
        self.nodes.push(node);
        id
    }

    /// Drain and remove a node. Its in-flight tasks go back to the head of
    /// the queue. Returns `None` if the node is unknown.
    pub fn unregister_node(&mut self, node_id: NodeId) -> Option<Vec<TaskId>> {
        let index = self.nodes.iter().position(|n| n.id == node_id)?;
        self.nodes[index].status = NodeStatus::Draining;

        let requeued = self.queue.in_flight_for_node(node_id);
        self.queue.requeue_front(&requeued);
        self.queue.detach_cancelled(node_id);
        self.policy.node_removed(node_id);
        self.nodes.remove(index);

        tracing::info!(node_id, requeued = requeued.len(), "Node unregistered");
        Some(requeued)
    }

    /// Record a heartbeat, optionally with the node's own load figure. An
    /// offline node that heartbeats again rejoins the pool.
    pub fn heartbeat(&mut self, node_id: NodeId, load: Option<usize>) -> bool {
        let Some(node) = self.node_mut(node_id) else {
            return false;
        };
        node.update_heartbeat();
        if let Some(load) = load {
            node.load = load;
        }
        if node.status == NodeStatus::Offline {
            node.status = NodeStatus::Idle;
            tracing::info!(node_id, "Node back online");
        }
        node.refresh_status();
        true
    }

    /// Mark every node silent for longer than the heartbeat timeout as
    /// offline and hand its in-flight tasks back to the queue.
    pub fn check_heartbeats(&mut self) -> Vec<NodeTimeout> {
        self.check_heartbeats_at(Instant::now())
    }

    pub fn check_heartbeats_at(&mut self, now: Instant) -> Vec<NodeTimeout> {
        let timeout = self.config.heartbeat_timeout();
        let expired: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| n.is_schedulable() && !n.is_alive_at(now, timeout))
            .map(|n| n.id)
            .collect();

        let mut timeouts = Vec::with_capacity(expired.len());
        for node_id in expired {
            if let Some(node) = self.node_mut(node_id) {
                node.status = NodeStatus::Offline;
                node.load = 0;
            }
            // Load was just reset; late reports for these must not lower it again.
            self.queue.detach_cancelled(node_id);
            let requeued = self.queue.in_flight_for_node(node_id);
            tracing::warn!(
                node_id,
                requeued = requeued.len(),
                "Node missed heartbeats, marked offline"
            );
            timeouts.push(NodeTimeout { node_id, requeued });
        }

        // One batch, so the first timed-out node's tasks lead the queue.
        let requeued: Vec<TaskId> = timeouts
            .iter()
            .flat_map(|t| t.requeued.iter().copied())
            .collect();
        self.queue.requeue_front(&requeued);
        timeouts
    }

    pub fn node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    fn node_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == node_id)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.status == status).collect()
    }

    // ---------------------------------------------------------------------
    // Tasks
    // ---------------------------------------------------------------------

    /// Queue a test. `requirements` defaults to the test's own.
    pub fn submit(
        &mut self,
        test: TestCase,
        priority: i32,
        requirements: Option<TaskRequirements>,
    ) -> Result<TaskId> {
        let requirements = requirements.unwrap_or_else(|| test.requirements.clone());
        let task = Task::new(test, priority, requirements);
        let task_id = task.id;
        if !self.queue.push(task) {
            tracing::warn!(max_live = self.config.max_live_tasks, "Task queue full, rejecting task");
            return Err(OrchestratorError::QueueFull(self.config.max_live_tasks));
        }
        tracing::debug!(task_id = %task_id, priority, "Task submitted");
        Ok(task_id)
    }

    pub fn cancel(&mut self, task_id: &TaskId) -> CancelOutcome {
        let Some(task) = self.queue.get(task_id) else {
            return CancelOutcome::NotFound;
        };
        match task.status {
            TaskStatus::Pending => {
                self.queue.retire(task_id, TaskStatus::Cancelled);
                tracing::info!(task_id = %task_id, "Pending task cancelled");
                CancelOutcome::Dequeued
            }
            TaskStatus::Assigned | TaskStatus::Running => {
                // Keep node_id: the executor's eventual report releases the load.
                let node_id = task.node_id;
                self.queue.retire(task_id, TaskStatus::Cancelled);
                tracing::info!(task_id = %task_id, node_id = ?node_id, "In-flight task cancelled");
                CancelOutcome::Signalled { node_id }
            }
            _ => CancelOutcome::AlreadyFinished,
        }
    }

    /// Assigned to running. `attempt` is the [`Assignment::attempt`] the
    /// executor was handed.
    pub fn task_started(&mut self, task_id: &TaskId, attempt: u32) -> bool {
        match self.queue.get_mut(task_id) {
            Some(task) if task.status == TaskStatus::Assigned && task.requeue_count == attempt => {
                task.status = TaskStatus::Running;
                task.started_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    pub fn task_completed(&mut self, task_id: &TaskId, attempt: u32, result: TaskResult) -> bool {
        self.finish(task_id, attempt, TaskStatus::Completed, |task| {
            task.result = Some(result)
        })
    }

    pub fn task_failed(&mut self, task_id: &TaskId, attempt: u32, error: String) -> bool {
        self.finish(task_id, attempt, TaskStatus::Failed, |task| task.error = Some(error))
    }

    /// Apply a terminal executor report. A cancelled task only gets its node
    /// load released; a task that is not in flight, or that has been
    /// requeued since `attempt` was handed out, is left untouched.
    fn finish(
        &mut self,
        task_id: &TaskId,
        attempt: u32,
        status: TaskStatus,
        record: impl FnOnce(&mut Task),
    ) -> bool {
        let Some(task) = self.queue.get_mut(task_id) else {
            return false;
        };
        if task.requeue_count != attempt {
            tracing::warn!(
                task_id = %task_id,
                attempt,
                current = task.requeue_count,
                "Ignoring report from an abandoned attempt"
            );
            return false;
        }

        let node_id = match task.status {
            TaskStatus::Assigned | TaskStatus::Running => {
                let node_id = task.node_id;
                let Some(task) = self.queue.retire(task_id, status) else {
                    return false;
                };
                record(task);
                self.finished_at.push_back(Instant::now());
                node_id
            }
            TaskStatus::Cancelled if task.node_id.is_some() => task.node_id.take(),
            _ => {
                tracing::warn!(task_id = %task_id, status = %task.status, "Ignoring late task report");
                return false;
            }
        };

        tracing::debug!(task_id = %task_id, node_id = ?node_id, status = %status, "Task finished");
        if let Some(node_id) = node_id {
            self.release_node(node_id);
        }
        true
    }

    fn release_node(&mut self, node_id: NodeId) {
        if let Some(node) = self.node_mut(node_id) {
            node.load = node.load.saturating_sub(1);
            node.refresh_status();
        }
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&Task> {
        self.queue.get(task_id)
    }

    pub fn tasks(&self) -> Vec<&Task> {
        self.queue.all_tasks()
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.queue.tasks_with_status(status)
    }

    pub fn task_counts(&self) -> TaskCounts {
        self.queue.counts()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.pending_len()
    }

    // ---------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------

    /// Assign queued tasks until the queue is empty or the head task has no
    /// qualifying node. The head is never skipped, so priority order holds.
    pub fn dispatch(&mut self) -> Result<Vec<Assignment>> {
        let mut assignments = Vec::new();
        self.dispatch_into(&mut assignments)?;
        Ok(assignments)
    }

    /// Like [`dispatch`](Self::dispatch), but assignments made before a
    /// policy error are still delivered through `out`.
    pub fn dispatch_into(&mut self, out: &mut Vec<Assignment>) -> Result<()> {
        loop {
            let Some(task) = self.queue.peek() else {
                return Ok(());
            };
            let candidates: Vec<&Node> = self
                .nodes
                .iter()
                .filter(|n| {
                    n.is_schedulable()
                        && n.has_capacity()
                        && task.requirements.is_satisfied_by(&n.capabilities)
                })
                .collect();
            if candidates.is_empty() {
                tracing::debug!(
                    task_id = %task.id,
                    queued = self.queue.pending_len(),
                    "No qualifying node for head task"
                );
                return Ok(());
            }

            let Some(node_id) = self.policy.select(task, &candidates) else {
                return Ok(());
            };
            if !candidates.iter().any(|n| n.id == node_id) {
                return Err(OrchestratorError::InvalidSelection {
                    policy: self.policy.name(),
                    node_id,
                    task_id: task.id,
                });
            }

            let Some(task_id) = self.queue.pop_front() else {
                return Ok(());
            };
            match self.assign(task_id, node_id) {
                Some(assignment) => out.push(assignment),
                None => return Ok(()),
            }
        }
    }

    fn assign(&mut self, task_id: TaskId, node_id: NodeId) -> Option<Assignment> {
        let node = self.nodes.iter_mut().find(|n| n.id == node_id)?;
        let task = self.queue.get_mut(&task_id)?;

        node.load += 1;
        node.refresh_status();
        task.status = TaskStatus::Assigned;
        task.node_id = Some(node_id);

        tracing::info!(task_id = %task_id, node_id, test = %task.test.id, "Task assigned");
        Some(Assignment {
            task_id,
            node_id,
            node_address: node.address(),
            test: task.test.clone(),
            attempt: task.requeue_count,
        })
    }

    // ---------------------------------------------------------------------
    // Stats
    // ---------------------------------------------------------------------

    pub fn stats(&mut self) -> DispatcherStats {
        let window = self.config.throughput_window();
        let now = Instant::now();
        while self
            .finished_at
            .front()
            .is_some_and(|at| now.duration_since(*at) > window)
        {
            self.finished_at.pop_front();
        }

        let mut nodes = NodeCounts::default();
        for node in &self.nodes {
            nodes.record(node.status);
        }

        DispatcherStats {
            nodes,
            tasks: self.queue.counts(),
            queue_depth: self.queue.pending_len(),
            throughput_per_sec: self.finished_at.len() as f64 / window.as_secs_f64(),
            total_load: self.nodes.iter().map(|n| n.load).sum(),
            total_capacity: self
                .nodes
                .iter()
                .filter(|n| n.is_schedulable())
                .map(|n| n.max_load)
                .sum(),
        }
    }
}
