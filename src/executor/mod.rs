//! Contract between the orchestrator and whatever actually runs tests.
//!
//! The orchestrator turns every [`DispatchEvent::Assigned`] into an
//! [`ExecutionRequest`], reports `task_started` before calling
//! [`Executor::execute`] and exactly one of `task_completed` / `task_failed`
//! after. Cancellation is pushed: the request's token fires when the task is
//! cancelled or its node is lost, and the executor is expected to give up
//! promptly.
//!
//! - [`SimulatedExecutor`]: sleeps for the estimated duration, used by the
//!   CLI `simulate` command and the tests
//! - [`HeartbeatSender`]: keeps a node alive in the dispatcher registry
//!
//! [`DispatchEvent::Assigned`]: crate::scheduler::DispatchEvent::Assigned

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::scheduler::{NodeId, TaskId, TaskResult};
use crate::sharding::TestCase;

pub mod heartbeat;
pub mod simulated;

pub use heartbeat::HeartbeatSender;
pub use simulated::SimulatedExecutor;

/// One test to run on one node.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: TaskId,
    pub test: TestCase,
    pub node_id: NodeId,
    pub node_address: String,
    /// Which requeue of the task this run is; 0 for the first.
    pub attempt: u32,
    pub cancel: CancellationToken,
}

pub trait Executor: Send + Sync + 'static {
    /// Run the test. `Ok` carries the verdict, including a failed test;
    /// `Err` means the run itself broke (node unreachable, harness crash).
    fn execute(
        &self,
        request: ExecutionRequest,
    ) -> impl Future<Output = Result<TaskResult, String>> + Send;
}
