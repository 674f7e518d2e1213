use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capability::TaskRequirements;
use crate::scheduler::node::NodeId;
use crate::sharding::TestCase;

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Owned by a node and not yet reported back.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Verdict of one test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
}

/// What the executor reports when a test finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub outcome: TestOutcome,
    pub duration_ms: u64,
    pub message: Option<String>,
}

impl TaskResult {
    pub fn passed(duration_ms: u64) -> Self {
        Self {
            outcome: TestOutcome::Passed,
            duration_ms,
            message: None,
        }
    }

    pub fn failed(duration_ms: u64, message: impl Into<String>) -> Self {
        Self {
            outcome: TestOutcome::Failed,
            duration_ms,
            message: Some(message.into()),
        }
    }

    pub fn skipped() -> Self {
        Self {
            outcome: TestOutcome::Skipped,
            duration_ms: 0,
            message: None,
        }
    }
}

/// One scheduled execution of a single test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub test: TestCase,
    pub priority: i32,
    pub requirements: TaskRequirements,
    pub status: TaskStatus,
    /// Owning node; cleared whenever the task goes back to pending.
    pub node_id: Option<NodeId>,
    /// Submission order, used to keep equal priorities first-in first-out.
    pub sequence: u64,
    /// Times the task was handed back to the queue by a failed node.
    pub requeue_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(test: TestCase, priority: i32, requirements: TaskRequirements) -> Self {
        Self {
            id: Uuid::new_v4(),
            test,
            priority,
            requirements,
            status: TaskStatus::Pending,
            node_id: None,
            sequence: 0,
            requeue_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Back to the queue after losing its node.
    pub fn reset_to_pending(&mut self) {
        self.status = TaskStatus::Pending;
        self.node_id = None;
        self.started_at = None;
        self.requeue_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_creation() {
        let task = Task::new(TestCase::new("login"), 3, TaskRequirements::default());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.test.id, "login");
        assert_eq!(task.priority, 3);
        assert!(task.node_id.is_none());
    }

    #[test]
    fn reset_clears_node() {
        let mut task = Task::new(TestCase::new("login"), 0, TaskRequirements::default());
        task.status = TaskStatus::Running;
        task.node_id = Some(4);
        task.started_at = Some(Utc::now());

        task.reset_to_pending();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.node_id.is_none());
        assert!(task.started_at.is_none());
        assert_eq!(task.requeue_count, 1);
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(TaskStatus::Running.is_in_flight());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert_eq!(TaskStatus::Assigned.to_string(), "assigned");
    }
}
