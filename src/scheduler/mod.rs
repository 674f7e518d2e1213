//! Test-task dispatching across a pool of execution nodes.
//!
//! - **Registry**: nodes join with a [`NodeDescriptor`], heartbeat, and are
//!   marked offline when they go quiet
//! - **Queue**: tasks wait in priority order, equal priorities first-in
//!   first-out
//! - **Dispatch**: the head task goes to a node chosen by a pluggable
//!   [`SelectionPolicy`]; if no node qualifies, nothing behind it moves
//!
//! # Components
//!
//! - [`Dispatcher`]: the synchronous state machine
//! - [`DispatcherService`]: owns a `Dispatcher` on a tokio task and applies
//!   [`DispatcherMessage`](service::DispatcherMessage)s one at a time
//! - [`DispatcherHandle`]: cloneable async client for the service
//! - [`DispatchEvent`]: assignments, cancellations and requeues for the
//!   executor side
//!
//! # Task lifecycle
//!
//! ```text
//! Pending ──dispatch──▶ Assigned ──started──▶ Running ──▶ Completed | Failed
//!    ▲                     │                     │
//!    └──── node lost ──────┴─────────────────────┘
//!
//! Pending | Assigned | Running ──cancel──▶ Cancelled
//! ```

pub mod dispatcher;
pub mod node;
pub mod policy;
pub mod queue;
pub mod service;
pub mod task;

pub use dispatcher::{Assignment, CancelOutcome, Dispatcher, NodeTimeout};
pub use node::{Node, NodeDescriptor, NodeId, NodeStatus};
pub use policy::{SelectionPolicy, SelectionStrategy};
pub use queue::TaskQueue;
pub use service::{DispatchEvent, DispatcherHandle, DispatcherService};
pub use task::{Task, TaskId, TaskResult, TaskStatus, TestOutcome};
