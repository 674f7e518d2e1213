use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::scheduler::{DispatcherHandle, NodeId};

/// Periodically reports a node as alive to the dispatcher.
#[derive(Debug, Clone)]
pub struct HeartbeatSender {
    node_id: NodeId,
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(node_id: NodeId, interval_ms: u64) -> Self {
        Self {
            node_id,
            interval: Duration::from_millis(interval_ms),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Send heartbeats until `token` is cancelled, the node is no longer
    /// registered, or the dispatcher goes away.
    pub async fn run(&self, handle: DispatcherHandle, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    match handle.heartbeat(self.node_id, None).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::debug!(node_id = self.node_id, "Node unregistered, stopping heartbeats");
                            break;
                        }
                        Err(e) => {
                            tracing::debug!(node_id = self.node_id, error = %e, "Dispatcher gone, stopping heartbeats");
                            break;
                        }
                    }
                }
            }
        }
    }

    pub fn spawn(self, handle: DispatcherHandle, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(handle, token).await })
    }
}
