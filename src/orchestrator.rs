use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::balancer::{spawn_health_checks, HealthProbe, LoadBalancer, SharedBalancer, Worker};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::executor::{ExecutionRequest, Executor, HeartbeatSender};
use crate::scheduler::{
    Assignment, DispatchEvent, DispatcherHandle, DispatcherService, NodeDescriptor, NodeId, Task,
    TaskId, TaskStatus, TestOutcome,
};
use crate::sharding::{DurationHistory, Shard, ShardingEngine, TestCase};
use crate::stats::{BalancerStats, DispatcherStats, ShardStats};

/// Outcome of one shard in a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShardReport {
    pub index: usize,
    /// Tests planned into the shard.
    pub tests: usize,
    /// Tests that reached an executor verdict.
    pub tests_run: usize,
    pub passed: usize,
    /// Failed verdicts plus executor errors.
    pub failed: usize,
    /// Skipped verdicts plus cancelled tasks.
    pub skipped: usize,
    /// Sum of reported test durations.
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub shards: Vec<ShardReport>,
    pub shard_stats: ShardStats,
    pub dispatcher: DispatcherStats,
    pub balancer: BalancerStats,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub wall_time_ms: u64,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Ties sharding, dispatching, load balancing and an [`Executor`] together
/// for one test suite.
///
/// Construction spawns the dispatcher service and an event pump that turns
/// assignments into executor calls; both stop on [`shutdown`](Self::shutdown)
/// or when the orchestrator is dropped.
pub struct Orchestrator<E: Executor> {
    config: OrchestratorConfig,
    handle: DispatcherHandle,
    balancer: SharedBalancer,
    sharding: ShardingEngine,
    token: CancellationToken,
    heartbeats: HashMap<NodeId, CancellationToken>,
    executor: Arc<E>,
    service_task: JoinHandle<()>,
    pump_task: JoinHandle<()>,
}

impl<E: Executor> Orchestrator<E> {
    pub fn new(config: OrchestratorConfig, executor: E) -> Result<Self> {
        let history = DurationHistory::new(config.sharding.history_window);
        Self::with_history(config, executor, history)
    }

    pub fn with_history(
        config: OrchestratorConfig,
        executor: E,
        history: DurationHistory,
    ) -> Result<Self> {
        config.validate()?;

        let token = CancellationToken::new();
        let (service, handle, events_rx) = DispatcherService::new(config.dispatcher.clone())?;
        let service_task = service.spawn(token.clone());

        let balancer: SharedBalancer =
            Arc::new(Mutex::new(LoadBalancer::new(config.balancer.clone())));
        let executor = Arc::new(executor);
        let pump_task = tokio::spawn(event_pump(
            events_rx,
            handle.clone(),
            balancer.clone(),
            executor.clone(),
            token.clone(),
        ));

        Ok(Self {
            sharding: ShardingEngine::with_history(config.sharding.clone(), history),
            config,
            handle,
            balancer,
            token,
            heartbeats: HashMap::new(),
            executor,
            service_task,
            pump_task,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn handle(&self) -> &DispatcherHandle {
        &self.handle
    }

    pub fn balancer(&self) -> &SharedBalancer {
        &self.balancer
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    pub fn sharding(&self) -> &ShardingEngine {
        &self.sharding
    }

    pub fn history(&self) -> &DurationHistory {
        self.sharding.history()
    }

    /// Register a node with the dispatcher, mirror it as a balancer worker
    /// and keep it alive with a heartbeat sender.
    pub async fn register_node(&mut self, descriptor: NodeDescriptor) -> Result<NodeId> {
        let weight = descriptor.capabilities.cores.max(1) as u32;
        let node_id = self.handle.register_node(descriptor).await?;
        let node = self
            .handle
            .node(node_id)
            .await?
            .ok_or(OrchestratorError::DispatcherStopped)?;

        self.balancer.lock().await.add_worker(
            Worker::new(node_id.to_string(), node.address(), weight)
                .with_max_connections(node.max_load),
        );

        let heartbeat_token = self.token.child_token();
        HeartbeatSender::new(node_id, self.config.dispatcher.heartbeat_interval_ms)
            .spawn(self.handle.clone(), heartbeat_token.clone());
        self.heartbeats.insert(node_id, heartbeat_token);

        Ok(node_id)
    }

    pub async fn unregister_node(&mut self, node_id: NodeId) -> Result<bool> {
        if let Some(heartbeat) = self.heartbeats.remove(&node_id) {
            heartbeat.cancel();
        }
        self.balancer
            .lock()
            .await
            .remove_worker(&node_id.to_string());
        self.handle.unregister_node(node_id).await
    }

    /// Stop heartbeating for a node without unregistering it, so the
    /// dispatcher eventually times it out.
    pub fn silence_node(&mut self, node_id: NodeId) -> bool {
        match self.heartbeats.remove(&node_id) {
            Some(heartbeat) => {
                heartbeat.cancel();
                true
            }
            None => false,
        }
    }

    /// Split `tests` into the shard count derived from their estimated
    /// durations.
    pub fn plan(&self, tests: &[TestCase]) -> Result<Vec<Shard>> {
        let count = self.sharding.optimal_shard_count(tests);
        self.sharding.shard(tests, count)
    }

    pub fn plan_with_shards(&self, tests: &[TestCase], shard_count: usize) -> Result<Vec<Shard>> {
        self.sharding.shard(tests, shard_count)
    }

    /// Plan, then run every shard to completion.
    pub async fn run(&mut self, tests: &[TestCase]) -> Result<RunReport> {
        let shards = self.plan(tests)?;
        self.run_shards(shards).await
    }

    /// Submit every test of `shards`, wait for the dispatcher to drain within
    /// the configured run timeout, and report per shard. On timeout the
    /// remaining tasks are cancelled before the error is returned.
    pub async fn run_shards(&mut self, shards: Vec<Shard>) -> Result<RunReport> {
        let started = Instant::now();
        tracing::info!(
            shards = shards.len(),
            tests = shards.iter().map(Shard::len).sum::<usize>(),
            "Starting run"
        );

        self.handle.start().await?;

        let mut shard_of: HashMap<TaskId, usize> = HashMap::new();
        for (position, shard) in shards.iter().enumerate() {
            for test in &shard.tests {
                let task_id = self
                    .handle
                    .submit_task(test.clone(), test.priority, None)
                    .await?;
                shard_of.insert(task_id, position);
            }
        }

        if let Err(e) = self.handle.wait_for_drain(self.config.run_timeout()).await {
            if matches!(e, OrchestratorError::Timeout(_)) {
                self.cancel_tasks(shard_of.keys().copied()).await?;
            }
            return Err(e);
        }

        let tasks = self.handle.tasks(None).await?;
        let mut reports: Vec<ShardReport> = shards
            .iter()
            .map(|s| ShardReport {
                index: s.index,
                tests: s.len(),
                ..Default::default()
            })
            .collect();

        for task in tasks {
            let Some(&position) = shard_of.get(&task.id) else {
                continue;
            };
            record_task(&mut reports[position], &task);
            if let Some(result) = &task.result {
                if task.status == TaskStatus::Completed && result.outcome != TestOutcome::Skipped {
                    self.sharding
                        .history_mut()
                        .record(&task.test.id, result.duration_ms);
                }
            }
        }

        let report = RunReport {
            passed: reports.iter().map(|r| r.passed).sum(),
            failed: reports.iter().map(|r| r.failed).sum(),
            skipped: reports.iter().map(|r| r.skipped).sum(),
            shard_stats: ShardStats::from_shards(&shards),
            dispatcher: self.handle.stats().await?,
            balancer: self.balancer.lock().await.stats(),
            wall_time_ms: started.elapsed().as_millis() as u64,
            shards: reports,
        };
        tracing::info!(
            passed = report.passed,
            failed = report.failed,
            skipped = report.skipped,
            wall_time_ms = report.wall_time_ms,
            "Run finished"
        );
        Ok(report)
    }

    async fn cancel_tasks(&self, task_ids: impl Iterator<Item = TaskId>) -> Result<()> {
        let mut cancelled = 0;
        for task_id in task_ids {
            if self.handle.cancel_task(task_id).await? {
                cancelled += 1;
            }
        }
        tracing::warn!(cancelled, "Run timed out, outstanding tasks cancelled");
        Ok(())
    }

    pub fn start_health_checks<P: HealthProbe>(&self, probe: Arc<P>) -> JoinHandle<()> {
        spawn_health_checks(self.balancer.clone(), probe, self.token.child_token())
    }

    /// Stop the dispatcher, the event pump, heartbeats and in-flight
    /// executions.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        let _ = (&mut self.service_task).await;
        let _ = (&mut self.pump_task).await;
    }
}

impl<E: Executor> Drop for Orchestrator<E> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn record_task(report: &mut ShardReport, task: &Task) {
    match task.status {
        TaskStatus::Completed => {
            report.tests_run += 1;
            if let Some(result) = &task.result {
                report.duration_ms += result.duration_ms;
                match result.outcome {
                    TestOutcome::Passed => report.passed += 1,
                    TestOutcome::Failed => report.failed += 1,
                    TestOutcome::Skipped => report.skipped += 1,
                }
            }
        }
        TaskStatus::Failed => {
            report.tests_run += 1;
            report.failed += 1;
        }
        TaskStatus::Cancelled => report.skipped += 1,
        TaskStatus::Pending | TaskStatus::Assigned | TaskStatus::Running => {}
    }
}

/// Turn dispatch events into executor calls until `token` is cancelled.
async fn event_pump<E: Executor>(
    mut events_rx: mpsc::UnboundedReceiver<DispatchEvent>,
    handle: DispatcherHandle,
    balancer: SharedBalancer,
    executor: Arc<E>,
    token: CancellationToken,
) {
    // Cancel token per execution; an execution cancels its own on exit.
    let mut executions: HashMap<TaskId, CancellationToken> = HashMap::new();

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = events_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        executions.retain(|_, cancel| !cancel.is_cancelled());

        match event {
            DispatchEvent::Assigned(assignment) => {
                let cancel = token.child_token();
                executions.insert(assignment.task_id, cancel.clone());
                tokio::spawn(execute_assignment(
                    handle.clone(),
                    balancer.clone(),
                    executor.clone(),
                    assignment,
                    cancel,
                ));
            }
            DispatchEvent::Cancelled { task_id, .. } => {
                if let Some(cancel) = executions.remove(&task_id) {
                    tracing::debug!(task_id = %task_id, "Cancelling execution");
                    cancel.cancel();
                }
            }
            DispatchEvent::Requeued { task_id, node_id } => {
                if let Some(cancel) = executions.remove(&task_id) {
                    tracing::debug!(task_id = %task_id, node_id, "Abandoning execution on lost node");
                    cancel.cancel();
                }
            }
        }
    }

    for cancel in executions.values() {
        cancel.cancel();
    }
    tracing::debug!("Event pump stopped");
}

/// Whether this attempt on `node_id` still owns `task_id`. A task that was
/// requeued since, even back onto the same node, does not. The dispatcher
/// enforces the same rule; checking first keeps abandoned runs quiet.
async fn still_owned(
    handle: &DispatcherHandle,
    task_id: TaskId,
    node_id: NodeId,
    attempt: u32,
) -> bool {
    matches!(
        handle.task(task_id).await,
        Ok(Some(task)) if task.node_id == Some(node_id) && task.requeue_count == attempt
    )
}

async fn execute_assignment<E: Executor>(
    handle: DispatcherHandle,
    balancer: SharedBalancer,
    executor: Arc<E>,
    assignment: Assignment,
    cancel: CancellationToken,
) {
    let Assignment {
        task_id,
        node_id,
        node_address,
        test,
        attempt,
    } = assignment;
    let worker_id = node_id.to_string();

    match handle.task_started(task_id, attempt).await {
        Ok(true) => {}
        Ok(false) => {
            // Cancelled between assignment and start: release the node load.
            if still_owned(&handle, task_id, node_id, attempt).await {
                let _ = handle
                    .task_failed(task_id, attempt, "cancelled before start")
                    .await;
            }
            cancel.cancel();
            return;
        }
        Err(_) => {
            cancel.cancel();
            return;
        }
    }

    balancer.lock().await.connection_start(&worker_id);
    let started = Instant::now();

    let request = ExecutionRequest {
        task_id,
        test,
        node_id,
        node_address,
        attempt,
        cancel: cancel.clone(),
    };
    let outcome = executor.execute(request).await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    {
        let mut lb = balancer.lock().await;
        lb.connection_end(&worker_id, Some(elapsed_ms));
        match &outcome {
            Ok(_) => lb.mark_success(&worker_id),
            Err(_) => lb.mark_failure(&worker_id),
        };
    }

    if still_owned(&handle, task_id, node_id, attempt).await {
        let reported = match outcome {
            Ok(result) => handle.task_completed(task_id, attempt, result).await,
            Err(error) => {
                tracing::warn!(task_id = %task_id, node_id, error = %error, "Execution failed");
                handle.task_failed(task_id, attempt, error).await
            }
        };
        if let Err(e) = reported {
            tracing::debug!(task_id = %task_id, error = %e, "Could not report task result");
        }
    } else {
        tracing::debug!(task_id = %task_id, node_id, attempt, "Dropping report from abandoned attempt");
    }

    cancel.cancel();
}
