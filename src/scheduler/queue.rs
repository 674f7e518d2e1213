use std::collections::{HashMap, VecDeque};

use chrono::Utc;

use crate::scheduler::node::NodeId;
use crate::scheduler::task::{Task, TaskId, TaskStatus};
use crate::stats::TaskCounts;

const DEFAULT_MAX_LIVE_TASKS: usize = 10_000;

/// Owns every submitted task plus the priority-ordered pending queue.
///
/// Tasks are never removed, so the per-status counts always add up to the
/// number of submissions. Terminal transitions go through [`retire`], which
/// keeps the live count in step.
///
/// [`retire`]: TaskQueue::retire
#[derive(Debug)]
pub struct TaskQueue {
    tasks: HashMap<TaskId, Task>,
    pending: VecDeque<TaskId>,
    next_sequence: u64,
    /// Tasks not yet completed, failed or cancelled.
    live: usize,
    max_live: usize,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_LIVE_TASKS)
    }

    pub fn with_capacity(max_live: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            pending: VecDeque::new(),
            next_sequence: 0,
            live: 0,
            max_live,
        }
    }

    /// Add a pending task behind every queued task of equal or higher
    /// priority. Returns false if the live-task ceiling is reached.
    pub fn push(&mut self, mut task: Task) -> bool {
        if self.is_full() {
            return false;
        }
        task.sequence = self.next_sequence;
        self.next_sequence += 1;

        // Scan from the tail: a suite of equal priorities appends in O(1).
        let position = self
            .pending
            .iter()
            .rposition(|id| self.tasks[id].priority >= task.priority)
            .map_or(0, |i| i + 1);
        self.pending.insert(position, task.id);
        self.tasks.insert(task.id, task);
        self.live += 1;
        true
    }

    /// Move a live task to the terminal `status`, taking it out of the
    /// pending queue if it was still waiting. Returns `None` for unknown or
    /// already-terminal tasks.
    pub fn retire(&mut self, id: &TaskId, status: TaskStatus) -> Option<&mut Task> {
        let was_pending = match self.tasks.get(id) {
            Some(task) if !task.status.is_terminal() => task.status == TaskStatus::Pending,
            _ => return None,
        };
        if was_pending {
            self.remove_pending(id);
        }
        self.live = self.live.saturating_sub(1);

        let task = self.tasks.get_mut(id)?;
        task.status = status;
        task.completed_at = Some(Utc::now());
        Some(task)
    }

    /// Clear `node_id` on cancelled tasks still charged to `node_id`, so their
    /// late reports release nothing. Returns how many were detached.
    pub fn detach_cancelled(&mut self, node_id: NodeId) -> usize {
        let mut detached = 0;
        for task in self.tasks.values_mut() {
            if task.status == TaskStatus::Cancelled && task.node_id == Some(node_id) {
                task.node_id = None;
                detached += 1;
            }
        }
        detached
    }

    /// Put tasks that lost their node back at the head of the queue, keeping
    /// their relative order.
    pub fn requeue_front(&mut self, ids: &[TaskId]) {
        for id in ids.iter().rev() {
            if let Some(task) = self.tasks.get_mut(id) {
                task.reset_to_pending();
                self.pending.push_front(*id);
            }
        }
    }

    pub fn peek(&self) -> Option<&Task> {
        self.pending.front().and_then(|id| self.tasks.get(id))
    }

    pub fn pop_front(&mut self) -> Option<TaskId> {
        self.pending.pop_front()
    }

    /// Take a task out of the pending queue without touching its status.
    pub fn remove_pending(&mut self, id: &TaskId) -> bool {
        match self.pending.iter().position(|p| p == id) {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Pending task ids in dispatch order.
    pub fn pending_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// All tasks in submission order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().filter(|t| t.status == status).collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// Assigned or running tasks owned by `node_id`, in submission order.
    pub fn in_flight_for_node(&self, node_id: NodeId) -> Vec<TaskId> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.node_id == Some(node_id) && t.status.is_in_flight())
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks.into_iter().map(|t| t.id).collect()
    }

    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts {
            total_submitted: self.tasks.len(),
            ..Default::default()
        };
        for task in self.tasks.values() {
            counts.record(task.status);
        }
        counts
    }

    pub fn live_len(&self) -> usize {
        self.live
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.live_len() >= self.max_live
    }
}
