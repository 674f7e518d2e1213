use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::scheduler::node::{Node, NodeId};
use crate::scheduler::task::Task;

/// Chooses one node for a task.
///
/// `candidates` is never empty and contains only schedulable nodes with spare
/// capacity whose capabilities satisfy the task, in registration order.
/// Returning a node outside `candidates` is a bug in the policy and aborts
/// the dispatch pass.
pub trait SelectionPolicy: Send + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn select(&mut self, task: &Task, candidates: &[&Node]) -> Option<NodeId>;

    /// Called when a node leaves the registry.
    fn node_removed(&mut self, _node_id: NodeId) {}
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    RoundRobin,
    #[default]
    LeastLoaded,
    CapabilityMatch,
    Affinity,
}

impl SelectionStrategy {
    pub fn build(self) -> Box<dyn SelectionPolicy> {
        match self {
            SelectionStrategy::RoundRobin => Box::new(RoundRobinPolicy),
            SelectionStrategy::LeastLoaded => Box::new(LeastLoadedPolicy),
            SelectionStrategy::CapabilityMatch => Box::new(CapabilityMatchPolicy),
            SelectionStrategy::Affinity => Box::new(AffinityPolicy::default()),
        }
    }
}

/// First qualifying node in registration order.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy;

impl SelectionPolicy for RoundRobinPolicy {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(&mut self, _task: &Task, candidates: &[&Node]) -> Option<NodeId> {
        candidates.first().map(|n| n.id)
    }
}

/// Lowest load/ceiling ratio.
#[derive(Debug, Default)]
pub struct LeastLoadedPolicy;

impl SelectionPolicy for LeastLoadedPolicy {
    fn name(&self) -> &'static str {
        "least-loaded"
    }

    fn select(&mut self, _task: &Task, candidates: &[&Node]) -> Option<NodeId> {
        least_loaded(candidates)
    }
}

/// Strongest hardware, regardless of current load, so heavy suites stay off
/// weak machines.
#[derive(Debug, Default)]
pub struct CapabilityMatchPolicy;

impl SelectionPolicy for CapabilityMatchPolicy {
    fn name(&self) -> &'static str {
        "capability-match"
    }

    fn select(&mut self, _task: &Task, candidates: &[&Node]) -> Option<NodeId> {
        candidates
            .iter()
            .enumerate()
            // Prefer the earlier node on equal scores.
            .max_by_key(|(i, n)| (n.capabilities.hardware_score(), std::cmp::Reverse(*i)))
            .map(|(_, n)| n.id)
    }
}

/// Pins each test id to the node that first ran it.
#[derive(Debug, Default)]
pub struct AffinityPolicy {
    pins: HashMap<String, NodeId>,
}

impl AffinityPolicy {
    pub fn pinned(&self, test_id: &str) -> Option<NodeId> {
        self.pins.get(test_id).copied()
    }

    pub fn pin_count(&self) -> usize {
        self.pins.len()
    }
}

impl SelectionPolicy for AffinityPolicy {
    fn name(&self) -> &'static str {
        "affinity"
    }

    fn select(&mut self, task: &Task, candidates: &[&Node]) -> Option<NodeId> {
        if let Some(pinned) = self.pinned(&task.test.id) {
            if candidates.iter().any(|n| n.id == pinned) {
                return Some(pinned);
            }
        }
        let chosen = least_loaded(candidates)?;
        self.pins.insert(task.test.id.clone(), chosen);
        Some(chosen)
    }

    fn node_removed(&mut self, node_id: NodeId) {
        self.pins.retain(|_, pinned| *pinned != node_id);
    }
}

fn least_loaded(candidates: &[&Node]) -> Option<NodeId> {
    candidates
        .iter()
        .min_by(|a, b| a.load_ratio().total_cmp(&b.load_ratio()))
        .map(|n| n.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{NodeCapabilities, TaskRequirements};
    use crate::scheduler::node::NodeDescriptor;
    use crate::sharding::TestCase;

    fn node(id: NodeId, cores: usize, memory_mb: u64, load: usize) -> Node {
        let caps = NodeCapabilities {
            cores,
            memory_mb,
            ..Default::default()
        };
        let mut node = Node::from_descriptor(id, NodeDescriptor::new("n", "h", 1, caps), 2);
        node.load = load;
        node
    }

    fn task(test_id: &str) -> Task {
        Task::new(TestCase::new(test_id), 0, TaskRequirements::default())
    }

    #[test]
    fn round_robin_takes_first() {
        let (a, b) = (node(1, 2, 0, 3), node(2, 2, 0, 0));
        assert_eq!(RoundRobinPolicy.select(&task("t"), &[&a, &b]), Some(1));
    }

    #[test]
    fn least_loaded_uses_ratio() {
        // 2/4 = 0.5 vs 2/8 = 0.25
        let (a, b) = (node(1, 2, 0, 2), node(2, 4, 0, 2));
        assert_eq!(LeastLoadedPolicy.select(&task("t"), &[&a, &b]), Some(2));
    }

    #[test]
    fn capability_match_ignores_load() {
        let weak = node(1, 2, 4096, 0);
        let strong = node(2, 8, 16_384, 7);
        assert_eq!(
            CapabilityMatchPolicy.select(&task("t"), &[&weak, &strong]),
            Some(2)
        );
    }

    #[test]
    fn capability_match_ties_go_to_first() {
        let (a, b) = (node(1, 2, 1024, 0), node(2, 2, 1024, 0));
        assert_eq!(CapabilityMatchPolicy.select(&task("t"), &[&a, &b]), Some(1));
    }

    #[test]
    fn affinity_pins_and_falls_back() {
        let mut policy = AffinityPolicy::default();
        let (a, b) = (node(1, 2, 0, 1), node(2, 2, 0, 0));

        assert_eq!(policy.select(&task("login"), &[&a, &b]), Some(2));
        assert_eq!(policy.pinned("login"), Some(2));

        // Pinned node wins even when no longer least loaded.
        let b_busy = node(2, 2, 0, 3);
        assert_eq!(policy.select(&task("login"), &[&a, &b_busy]), Some(2));

        // Pinned node not a candidate: fall back and re-pin.
        assert_eq!(policy.select(&task("login"), &[&a]), Some(1));
        assert_eq!(policy.pinned("login"), Some(1));
    }

    #[test]
    fn affinity_forgets_removed_nodes() {
        let mut policy = AffinityPolicy::default();
        let a = node(1, 2, 0, 0);
        policy.select(&task("login"), &[&a]);
        policy.select(&task("logout"), &[&a]);
        assert_eq!(policy.pin_count(), 2);

        policy.node_removed(1);
        assert_eq!(policy.pin_count(), 0);
    }

    #[test]
    fn build_matches_strategy() {
        assert_eq!(SelectionStrategy::RoundRobin.build().name(), "round-robin");
        assert_eq!(SelectionStrategy::LeastLoaded.build().name(), "least-loaded");
        assert_eq!(SelectionStrategy::CapabilityMatch.build().name(), "capability-match");
        assert_eq!(SelectionStrategy::Affinity.build().name(), "affinity");
    }
}
