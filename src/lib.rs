//! Distributed test orchestration: shard a suite, dispatch tests to a pool of
//! execution nodes, balance connections across them, and report per shard.

pub mod balancer;
pub mod capability;
pub mod config;
pub mod error;
pub mod executor;
pub mod hashing;
pub mod orchestrator;
pub mod scheduler;
pub mod sharding;
pub mod shutdown;
pub mod stats;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use orchestrator::{Orchestrator, RunReport, ShardReport};
