use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capability::TaskRequirements;
use crate::config::DispatcherConfig;
use crate::error::{OrchestratorError, Result};
use crate::scheduler::dispatcher::{Assignment, CancelOutcome, Dispatcher};
use crate::scheduler::node::{Node, NodeDescriptor, NodeId, NodeStatus};
use crate::scheduler::policy::SelectionPolicy;
use crate::scheduler::task::{Task, TaskId, TaskResult, TaskStatus};
use crate::sharding::TestCase;
use crate::stats::{DispatcherStats, TaskCounts};

/// Notifications for the executor side.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    /// Run this task on this node.
    Assigned(Assignment),
    /// Stop working on this task if it is still running.
    Cancelled {
        task_id: TaskId,
        node_id: Option<NodeId>,
    },
    /// The node lost this task (timeout or unregister); it is queued again.
    Requeued { task_id: TaskId, node_id: NodeId },
}

/// Message types for the dispatcher event loop
#[derive(Debug)]
pub enum DispatcherMessage {
    RegisterNode {
        descriptor: NodeDescriptor,
        response_tx: oneshot::Sender<NodeId>,
    },
    UnregisterNode {
        node_id: NodeId,
        response_tx: oneshot::Sender<bool>,
    },
    Heartbeat {
        node_id: NodeId,
        load: Option<usize>,
        response_tx: oneshot::Sender<bool>,
    },
    SubmitTask {
        test: TestCase,
        priority: i32,
        requirements: Option<TaskRequirements>,
        response_tx: oneshot::Sender<Result<TaskId>>,
    },
    CancelTask {
        task_id: TaskId,
        response_tx: oneshot::Sender<bool>,
    },
    TaskStarted {
        task_id: TaskId,
        attempt: u32,
        response_tx: oneshot::Sender<bool>,
    },
    TaskCompleted {
        task_id: TaskId,
        attempt: u32,
        result: TaskResult,
        response_tx: oneshot::Sender<bool>,
    },
    TaskFailed {
        task_id: TaskId,
        attempt: u32,
        error: String,
        response_tx: oneshot::Sender<bool>,
    },
    Start {
        response_tx: oneshot::Sender<()>,
    },
    Stop {
        response_tx: oneshot::Sender<()>,
    },
    GetTask {
        task_id: TaskId,
        response_tx: oneshot::Sender<Option<Task>>,
    },
    ListTasks {
        status: Option<TaskStatus>,
        response_tx: oneshot::Sender<Vec<Task>>,
    },
    GetNode {
        node_id: NodeId,
        response_tx: oneshot::Sender<Option<Node>>,
    },
    ListNodes {
        status: Option<NodeStatus>,
        response_tx: oneshot::Sender<Vec<Node>>,
    },
    Stats {
        response_tx: oneshot::Sender<DispatcherStats>,
    },
}

/// Single owner of the [`Dispatcher`].
///
/// Every mutation arrives as a [`DispatcherMessage`] and is applied in order,
/// so dispatch passes and heartbeat sweeps never interleave. Task counts are
/// published on a watch channel after each message for
/// [`DispatcherHandle::wait_for_drain`].
pub struct DispatcherService {
    dispatcher: Dispatcher,
    running: bool,
    message_rx: mpsc::Receiver<DispatcherMessage>,
    events_tx: mpsc::UnboundedSender<DispatchEvent>,
    counts_tx: watch::Sender<TaskCounts>,
}

impl DispatcherService {
    pub fn new(
        config: DispatcherConfig,
    ) -> Result<(
        Self,
        DispatcherHandle,
        mpsc::UnboundedReceiver<DispatchEvent>,
    )> {
        let policy = config.selection.build();
        Self::with_policy(config, policy)
    }

    pub fn with_policy(
        config: DispatcherConfig,
        policy: Box<dyn SelectionPolicy>,
    ) -> Result<(
        Self,
        DispatcherHandle,
        mpsc::UnboundedReceiver<DispatchEvent>,
    )> {
        config.validate()?;
        let (message_tx, message_rx) = mpsc::channel(config.command_buffer);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (counts_tx, counts_rx) = watch::channel(TaskCounts::default());

        let service = Self {
            dispatcher: Dispatcher::with_policy(config, policy),
            running: false,
            message_rx,
            events_tx,
            counts_tx,
        };
        let handle = DispatcherHandle {
            message_tx,
            counts_rx,
        };
        Ok((service, handle, events_rx))
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }

    /// Run the dispatcher loop until `token` is cancelled or every handle is
    /// dropped.
    pub async fn run(mut self, token: CancellationToken) {
        let mut sweep = tokio::time::interval(self.dispatcher.config().heartbeat_interval());
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(policy = self.dispatcher.policy_name(), "Dispatcher service started");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Dispatcher service shutting down");
                    break;
                }

                msg = self.message_rx.recv() => {
                    match msg {
                        Some(msg) => self.handle_message(msg),
                        None => {
                            tracing::debug!("All dispatcher handles dropped");
                            break;
                        }
                    }
                }

                _ = sweep.tick(), if self.running => {
                    self.sweep_heartbeats();
                }
            }

            self.publish_counts();
        }
    }

    fn handle_message(&mut self, msg: DispatcherMessage) {
        match msg {
            DispatcherMessage::RegisterNode {
                descriptor,
                response_tx,
            } => {
                let node_id = self.dispatcher.register_node(descriptor);
                self.dispatch_pass();
                let _ = response_tx.send(node_id);
            }
            DispatcherMessage::UnregisterNode {
                node_id,
                response_tx,
            } => {
                let removed = match self.dispatcher.unregister_node(node_id) {
                    Some(requeued) => {
                        self.emit_requeued(node_id, &requeued);
                        self.dispatch_pass();
                        true
                    }
                    None => false,
                };
                let _ = response_tx.send(removed);
            }
            DispatcherMessage::Heartbeat {
                node_id,
                load,
                response_tx,
            } => {
                let known = self.dispatcher.heartbeat(node_id, load);
                if known {
                    self.dispatch_pass();
                }
                let _ = response_tx.send(known);
            }
            DispatcherMessage::SubmitTask {
                test,
                priority,
                requirements,
                response_tx,
            } => {
                let result = self.dispatcher.submit(test, priority, requirements);
                if result.is_ok() {
                    self.dispatch_pass();
                }
                let _ = response_tx.send(result);
            }
            DispatcherMessage::CancelTask {
                task_id,
                response_tx,
            } => {
                let outcome = self.dispatcher.cancel(&task_id);
                if let CancelOutcome::Signalled { node_id } = outcome {
                    self.emit(DispatchEvent::Cancelled { task_id, node_id });
                }
                let _ = response_tx.send(outcome.cancelled());
            }
            DispatcherMessage::TaskStarted {
                task_id,
                attempt,
                response_tx,
            } => {
                let _ = response_tx.send(self.dispatcher.task_started(&task_id, attempt));
            }
            DispatcherMessage::TaskCompleted {
                task_id,
                attempt,
                result,
                response_tx,
            } => {
                let applied = self.dispatcher.task_completed(&task_id, attempt, result);
                if applied {
                    self.dispatch_pass();
                }
                let _ = response_tx.send(applied);
            }
            DispatcherMessage::TaskFailed {
                task_id,
                attempt,
                error,
                response_tx,
            } => {
                let applied = self.dispatcher.task_failed(&task_id, attempt, error);
                if applied {
                    self.dispatch_pass();
                }
                let _ = response_tx.send(applied);
            }
            DispatcherMessage::Start { response_tx } => {
                if !self.running {
                    self.running = true;
                    tracing::info!("Dispatching started");
                }
                self.dispatch_pass();
                let _ = response_tx.send(());
            }
            DispatcherMessage::Stop { response_tx } => {
                if self.running {
                    self.running = false;
                    tracing::info!("Dispatching stopped");
                }
                let _ = response_tx.send(());
            }
            DispatcherMessage::GetTask {
                task_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.dispatcher.task(&task_id).cloned());
            }
            DispatcherMessage::ListTasks {
                status,
                response_tx,
            } => {
                let tasks = match status {
                    Some(status) => self.dispatcher.tasks_with_status(status),
                    None => self.dispatcher.tasks(),
                };
                let _ = response_tx.send(tasks.into_iter().cloned().collect());
            }
            DispatcherMessage::GetNode {
                node_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.dispatcher.node(node_id).cloned());
            }
            DispatcherMessage::ListNodes {
                status,
                response_tx,
            } => {
                let nodes = match status {
                    Some(status) => self.dispatcher.nodes_with_status(status),
                    None => self.dispatcher.nodes().iter().collect(),
                };
                let _ = response_tx.send(nodes.into_iter().cloned().collect());
            }
            DispatcherMessage::Stats { response_tx } => {
                let _ = response_tx.send(self.dispatcher.stats());
            }
        }
    }

    fn sweep_heartbeats(&mut self) {
        let timeouts = self.dispatcher.check_heartbeats();
        for timeout in &timeouts {
            self.emit_requeued(timeout.node_id, &timeout.requeued);
        }
        self.dispatch_pass();
    }

    fn dispatch_pass(&mut self) {
        if !self.running {
            return;
        }
        let mut assignments = Vec::new();
        let result = self.dispatcher.dispatch_into(&mut assignments);
        for assignment in assignments {
            self.emit(DispatchEvent::Assigned(assignment));
        }
        if let Err(e) = result {
            tracing::error!(error = %e, "Dispatch pass aborted");
        }
    }

    fn emit_requeued(&self, node_id: NodeId, task_ids: &[TaskId]) {
        for &task_id in task_ids {
            self.emit(DispatchEvent::Requeued { task_id, node_id });
        }
    }

    fn emit(&self, event: DispatchEvent) {
        // Nobody listening is fine; tasks stay tracked either way.
        let _ = self.events_tx.send(event);
    }

    fn publish_counts(&self) {
        let counts = self.dispatcher.task_counts();
        self.counts_tx.send_if_modified(|current| {
            if *current == counts {
                false
            } else {
                *current = counts;
                true
            }
        });
    }
}

/// Cloneable client for a running [`DispatcherService`].
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    message_tx: mpsc::Sender<DispatcherMessage>,
    counts_rx: watch::Receiver<TaskCounts>,
}

impl DispatcherHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> DispatcherMessage,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.message_tx
            .send(build(response_tx))
            .await
            .map_err(|_| OrchestratorError::DispatcherStopped)?;
        response_rx
            .await
            .map_err(|_| OrchestratorError::DispatcherStopped)
    }

    pub async fn register_node(&self, descriptor: NodeDescriptor) -> Result<NodeId> {
        self.request(|response_tx| DispatcherMessage::RegisterNode {
            descriptor,
            response_tx,
        })
        .await
    }

    pub async fn unregister_node(&self, node_id: NodeId) -> Result<bool> {
        self.request(|response_tx| DispatcherMessage::UnregisterNode {
            node_id,
            response_tx,
        })
        .await
    }

    pub async fn heartbeat(&self, node_id: NodeId, load: Option<usize>) -> Result<bool> {
        self.request(|response_tx| DispatcherMessage::Heartbeat {
            node_id,
            load,
            response_tx,
        })
        .await
    }

    pub async fn submit_task(
        &self,
        test: TestCase,
        priority: i32,
        requirements: Option<TaskRequirements>,
    ) -> Result<TaskId> {
        self.request(|response_tx| DispatcherMessage::SubmitTask {
            test,
            priority,
            requirements,
            response_tx,
        })
        .await?
    }

    pub async fn cancel_task(&self, task_id: TaskId) -> Result<bool> {
        self.request(|response_tx| DispatcherMessage::CancelTask {
            task_id,
            response_tx,
        })
        .await
    }

    /// Executor reports quote the [`Assignment::attempt`] they were handed;
    /// a report from an attempt the task has since moved past is rejected.
    ///
    /// [`Assignment::attempt`]: crate::scheduler::Assignment::attempt
    pub async fn task_started(&self, task_id: TaskId, attempt: u32) -> Result<bool> {
        self.request(|response_tx| DispatcherMessage::TaskStarted {
            task_id,
            attempt,
            response_tx,
        })
        .await
    }

    pub async fn task_completed(
        &self,
        task_id: TaskId,
        attempt: u32,
        result: TaskResult,
    ) -> Result<bool> {
        self.request(|response_tx| DispatcherMessage::TaskCompleted {
            task_id,
            attempt,
            result,
            response_tx,
        })
        .await
    }

    pub async fn task_failed(
        &self,
        task_id: TaskId,
        attempt: u32,
        error: impl Into<String>,
    ) -> Result<bool> {
        let error = error.into();
        self.request(|response_tx| DispatcherMessage::TaskFailed {
            task_id,
            attempt,
            error,
            response_tx,
        })
        .await
    }

    /// Begin heartbeat sweeps and dispatching.
    pub async fn start(&self) -> Result<()> {
        self.request(|response_tx| DispatcherMessage::Start { response_tx })
            .await
    }

    /// Stop sweeps and new assignments. In-flight tasks are left alone.
    pub async fn stop(&self) -> Result<()> {
        self.request(|response_tx| DispatcherMessage::Stop { response_tx })
            .await
    }

    pub async fn task(&self, task_id: TaskId) -> Result<Option<Task>> {
        self.request(|response_tx| DispatcherMessage::GetTask {
            task_id,
            response_tx,
        })
        .await
    }

    pub async fn tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        self.request(|response_tx| DispatcherMessage::ListTasks {
            status,
            response_tx,
        })
        .await
    }

    pub async fn node(&self, node_id: NodeId) -> Result<Option<Node>> {
        self.request(|response_tx| DispatcherMessage::GetNode {
            node_id,
            response_tx,
        })
        .await
    }

    pub async fn nodes(&self, status: Option<NodeStatus>) -> Result<Vec<Node>> {
        self.request(|response_tx| DispatcherMessage::ListNodes {
            status,
            response_tx,
        })
        .await
    }

    pub async fn stats(&self) -> Result<DispatcherStats> {
        self.request(|response_tx| DispatcherMessage::Stats { response_tx })
            .await
    }

    /// Latest published task counts, without a round trip.
    pub fn task_counts(&self) -> TaskCounts {
        *self.counts_rx.borrow()
    }

    /// Wait until nothing is pending, assigned or running. Woken on every
    /// published change; gives up with [`OrchestratorError::Timeout`] after
    /// `deadline`.
    pub async fn wait_for_drain(&self, deadline: Option<Duration>) -> Result<TaskCounts> {
        let mut counts_rx = self.counts_rx.clone();
        let wait = async move {
            loop {
                let counts = *counts_rx.borrow_and_update();
                if counts.is_drained() {
                    return Ok::<_, OrchestratorError>(counts);
                }
                counts_rx
                    .changed()
                    .await
                    .map_err(|_| OrchestratorError::DispatcherStopped)?;
            }
        };

        match deadline {
            Some(deadline) => tokio::time::timeout(deadline, wait)
                .await
                .map_err(|_| OrchestratorError::Timeout(deadline))?,
            None => wait.await,
        }
    }
}
