use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid shard count: {0} (must be at least 1)")]
    InvalidShardCount(usize),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Task queue full: {0} live tasks")]
    QueueFull(usize),

    #[error("Selection policy {policy} picked node {node_id} which is not a candidate for task {task_id}")]
    InvalidSelection {
        policy: &'static str,
        node_id: u64,
        task_id: Uuid,
    },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Dispatcher service is not running")]
    DispatcherStopped,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
