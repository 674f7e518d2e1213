use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::balancer::worker::Worker;
use crate::hashing;

/// Worker selection algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BalancingAlgorithm {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    WeightedLeastConnections,
    IpHash,
    Random,
    ResponseTime,
}

impl std::fmt::Display for BalancingAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BalancingAlgorithm::RoundRobin => write!(f, "round-robin"),
            BalancingAlgorithm::WeightedRoundRobin => write!(f, "weighted-round-robin"),
            BalancingAlgorithm::LeastConnections => write!(f, "least-connections"),
            BalancingAlgorithm::WeightedLeastConnections => write!(f, "weighted-least-connections"),
            BalancingAlgorithm::IpHash => write!(f, "ip-hash"),
            BalancingAlgorithm::Random => write!(f, "random"),
            BalancingAlgorithm::ResponseTime => write!(f, "response-time"),
        }
    }
}

impl BalancingAlgorithm {
    /// Pick an index into `candidates`. `cursor` is the rotating state shared
    /// by the round-robin variants.
    pub(crate) fn select(
        self,
        candidates: &[&Worker],
        cursor: &mut usize,
        session_key: Option<&str>,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        match self {
            BalancingAlgorithm::RoundRobin => Some(rotate(candidates.len(), cursor)),
            BalancingAlgorithm::WeightedRoundRobin => Some(weighted_draw(candidates, cursor)),
            BalancingAlgorithm::LeastConnections => candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, w)| w.active_connections)
                .map(|(i, _)| i),
            BalancingAlgorithm::WeightedLeastConnections => {
                min_by_score(candidates, Worker::weighted_load)
            }
            BalancingAlgorithm::IpHash => match session_key {
                Some(key) => Some(hashing::bucket(key, candidates.len())),
                None => Some(rotate(candidates.len(), cursor)),
            },
            BalancingAlgorithm::Random => Some(rand::thread_rng().gen_range(0..candidates.len())),
            BalancingAlgorithm::ResponseTime => min_by_score(candidates, Worker::response_score),
        }
    }
}

fn rotate(len: usize, cursor: &mut usize) -> usize {
    let index = *cursor % len;
    *cursor = cursor.wrapping_add(1);
    index
}

/// One draw over `[0, Σweight)`, so each worker is picked with probability
/// proportional to its weight. All-zero weights fall back to rotation.
fn weighted_draw(candidates: &[&Worker], cursor: &mut usize) -> usize {
    let total: u64 = candidates.iter().map(|w| w.weight as u64).sum();
    if total == 0 {
        return rotate(candidates.len(), cursor);
    }
    weighted_index(candidates, rand::thread_rng().gen_range(0..total))
}

/// Index of the worker whose cumulative weight range contains `point`.
fn weighted_index(candidates: &[&Worker], mut point: u64) -> usize {
    for (i, worker) in candidates.iter().enumerate() {
        let weight = worker.weight as u64;
        if point < weight {
            return i;
        }
        point -= weight;
    }
    candidates.len() - 1
}

fn min_by_score(candidates: &[&Worker], score: impl Fn(&Worker) -> f64) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| score(a).total_cmp(&score(b)))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: &str, weight: u32, connections: usize) -> Worker {
        let mut w = Worker::new(id, id, weight);
        w.active_connections = connections;
        w
    }

    #[test]
    fn round_robin_rotates() {
        let a = worker("a", 1, 0);
        let b = worker("b", 1, 0);
        let candidates = vec![&a, &b];
        let mut cursor = 0;
        let picks: Vec<usize> = (0..4)
            .map(|_| BalancingAlgorithm::RoundRobin.select(&candidates, &mut cursor, None).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
    }

    #[test]
    fn weighted_index_maps_cumulative_ranges() {
        let a = worker("a", 3, 0);
        let b = worker("b", 0, 0);
        let c = worker("c", 1, 0);
        let candidates = vec![&a, &b, &c];
        let picks: Vec<usize> = (0..4).map(|p| weighted_index(&candidates, p)).collect();
        assert_eq!(picks, vec![0, 0, 0, 2]);
    }

    #[test]
    fn weighted_draw_never_picks_zero_weight() {
        let a = worker("a", 0, 0);
        let b = worker("b", 2, 0);
        let candidates = vec![&a, &b];
        let mut cursor = 0;
        for _ in 0..100 {
            let pick = BalancingAlgorithm::WeightedRoundRobin.select(&candidates, &mut cursor, None);
            assert_eq!(pick, Some(1));
        }
    }

    #[test]
    fn weighted_draw_all_zero_rotates() {
        let a = worker("a", 0, 0);
        let b = worker("b", 0, 0);
        let candidates = vec![&a, &b];
        let mut cursor = 0;
        let picks: Vec<usize> = (0..4)
            .map(|_| {
                BalancingAlgorithm::WeightedRoundRobin
                    .select(&candidates, &mut cursor, None)
                    .unwrap()
            })
            .collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
    }

    #[test]
    fn least_connections_picks_minimum() {
        let a = worker("a", 1, 3);
        let b = worker("b", 1, 1);
        let c = worker("c", 1, 2);
        let mut cursor = 0;
        let pick = BalancingAlgorithm::LeastConnections.select(&[&a, &b, &c], &mut cursor, None);
        assert_eq!(pick, Some(1));
    }

    #[test]
    fn weighted_least_connections_divides_by_weight() {
        let a = worker("a", 4, 4); // 1.0
        let b = worker("b", 1, 2); // 2.0
        let mut cursor = 0;
        let pick =
            BalancingAlgorithm::WeightedLeastConnections.select(&[&a, &b], &mut cursor, None);
        assert_eq!(pick, Some(0));
    }

    #[test]
    fn response_time_prefers_fast_idle_worker() {
        let mut fast_busy = worker("a", 1, 20);
        fast_busy.response_time_ms = 100.0; // 300
        let mut slow_idle = worker("b", 1, 0);
        slow_idle.response_time_ms = 200.0; // 200
        let mut cursor = 0;
        let pick = BalancingAlgorithm::ResponseTime.select(&[&fast_busy, &slow_idle], &mut cursor, None);
        assert_eq!(pick, Some(1));
    }

    #[test]
    fn ip_hash_is_stable() {
        let a = worker("a", 1, 0);
        let b = worker("b", 1, 0);
        let c = worker("c", 1, 0);
        let candidates = vec![&a, &b, &c];
        let mut cursor = 0;
        let first = BalancingAlgorithm::IpHash.select(&candidates, &mut cursor, Some("10.1.2.3"));
        for _ in 0..10 {
            let again =
                BalancingAlgorithm::IpHash.select(&candidates, &mut cursor, Some("10.1.2.3"));
            assert_eq!(again, first);
        }
    }

    #[test]
    fn random_stays_in_range() {
        let a = worker("a", 1, 0);
        let b = worker("b", 1, 0);
        let mut cursor = 0;
        for _ in 0..50 {
            let pick = BalancingAlgorithm::Random.select(&[&a, &b], &mut cursor, None).unwrap();
            assert!(pick < 2);
        }
    }

    #[test]
    fn empty_candidates_select_nothing() {
        let mut cursor = 0;
        assert_eq!(BalancingAlgorithm::RoundRobin.select(&[], &mut cursor, None), None);
    }
}
