use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::capability::NodeCapabilities;

pub type NodeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Idle,
    Busy,
    Offline,
    Draining,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Idle => write!(f, "idle"),
            NodeStatus::Busy => write!(f, "busy"),
            NodeStatus::Offline => write!(f, "offline"),
            NodeStatus::Draining => write!(f, "draining"),
        }
    }
}

/// What a node announces about itself when it joins the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub capabilities: NodeCapabilities,
    /// Overrides the `load_per_core × cores` ceiling.
    #[serde(default)]
    pub max_load: Option<usize>,
}

impl NodeDescriptor {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        capabilities: NodeCapabilities,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            capabilities,
            max_load: None,
        }
    }

    pub fn with_max_load(mut self, max_load: usize) -> Self {
        self.max_load = Some(max_load);
        self
    }
}

/// Registry entry for one execution node.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub capabilities: NodeCapabilities,
    pub status: NodeStatus,
    pub load: usize,
    pub max_load: usize,
    pub last_heartbeat: Instant,
    pub registered_at: DateTime<Utc>,
}

impl Node {
    pub fn from_descriptor(id: NodeId, descriptor: NodeDescriptor, load_per_core: usize) -> Self {
        let max_load = descriptor
            .max_load
            .unwrap_or(descriptor.capabilities.cores * load_per_core)
            .max(1);
        Self {
            id,
            name: descriptor.name,
            host: descriptor.host,
            port: descriptor.port,
            capabilities: descriptor.capabilities,
            status: NodeStatus::Idle,
            load: 0,
            max_load,
            last_heartbeat: Instant::now(),
            registered_at: Utc::now(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Idle or busy; offline and draining nodes take no new work.
    pub fn is_schedulable(&self) -> bool {
        matches!(self.status, NodeStatus::Idle | NodeStatus::Busy)
    }

    pub fn has_capacity(&self) -> bool {
        self.load < self.max_load
    }

    pub fn load_ratio(&self) -> f64 {
        self.load as f64 / self.max_load as f64
    }

    /// Recompute idle/busy from the current load. Offline and draining are
    /// left alone.
    pub fn refresh_status(&mut self) {
        if self.is_schedulable() {
            self.status = if self.has_capacity() {
                NodeStatus::Idle
            } else {
                NodeStatus::Busy
            };
        }
    }

    pub fn update_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    pub fn is_alive_at(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat) <= timeout
    }
}
