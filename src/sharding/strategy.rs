use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use serde::{Deserialize, Serialize};

use crate::hashing;
use crate::sharding::TestCase;

/// How a test list is split into shards.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum ShardStrategy {
    /// Contiguous blocks of equal test count.
    Count,
    /// Longest-processing-time-first bin packing on estimated durations.
    #[default]
    Duration,
    /// Bin packing of whole source files.
    File,
    /// Test `i` goes to shard `i mod n`.
    RoundRobin,
    /// Stable hash of test id and seed.
    Hash,
    /// Bin packing on priority weight.
    Weighted,
}

impl std::fmt::Display for ShardStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardStrategy::Count => write!(f, "count"),
            ShardStrategy::Duration => write!(f, "duration"),
            ShardStrategy::File => write!(f, "file"),
            ShardStrategy::RoundRobin => write!(f, "round-robin"),
            ShardStrategy::Hash => write!(f, "hash"),
            ShardStrategy::Weighted => write!(f, "weighted"),
        }
    }
}

/// Partition test indices into `count` groups. `durations[i]` is the
/// estimate for `tests[i]`. `count` must be non-zero.
pub(crate) fn partition(
    strategy: ShardStrategy,
    tests: &[TestCase],
    durations: &[u64],
    count: usize,
    seed: &str,
) -> Vec<Vec<usize>> {
    match strategy {
        ShardStrategy::Count => by_count(tests.len(), count),
        ShardStrategy::Duration => by_duration(durations, count),
        ShardStrategy::File => by_file(tests, durations, count),
        ShardStrategy::RoundRobin => round_robin(tests.len(), count),
        ShardStrategy::Hash => by_hash(tests, count, seed),
        ShardStrategy::Weighted => by_weight(tests, count),
    }
}

pub(crate) fn test_weight(test: &TestCase) -> u64 {
    test.priority.max(1) as u64
}

fn by_count(len: usize, count: usize) -> Vec<Vec<usize>> {
    let chunk = len.div_ceil(count);
    let mut groups = vec![Vec::new(); count];
    if chunk == 0 {
        return groups;
    }
    for i in 0..len {
        groups[i / chunk].push(i);
    }
    groups
}

fn round_robin(len: usize, count: usize) -> Vec<Vec<usize>> {
    let mut groups = vec![Vec::new(); count];
    for i in 0..len {
        groups[i % count].push(i);
    }
    groups
}

fn by_hash(tests: &[TestCase], count: usize, seed: &str) -> Vec<Vec<usize>> {
    let mut groups = vec![Vec::new(); count];
    for (i, test) in tests.iter().enumerate() {
        let key = format!("{}{}", test.id, seed);
        groups[hashing::bucket(&key, count)].push(i);
    }
    groups
}

fn by_duration(durations: &[u64], count: usize) -> Vec<Vec<usize>> {
    let items = durations
        .iter()
        .enumerate()
        .map(|(i, &d)| (d, vec![i]))
        .collect();
    pack(items, count)
}

fn by_file(tests: &[TestCase], durations: &[u64], count: usize) -> Vec<Vec<usize>> {
    // Keep first-seen file order so equal-duration groups pack deterministically.
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, (u64, Vec<usize>)> = HashMap::new();
    for (i, test) in tests.iter().enumerate() {
        let key = test.file.clone().unwrap_or_else(|| format!("\0{}", test.id));
        let group = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            (0, Vec::new())
        });
        group.0 += durations[i];
        group.1.push(i);
    }
    let items = order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .collect();
    pack(items, count)
}

fn by_weight(tests: &[TestCase], count: usize) -> Vec<Vec<usize>> {
    let mut indices: Vec<usize> = (0..tests.len()).collect();
    indices.sort_by_key(|&i| Reverse(tests[i].priority));

    let mut groups = vec![Vec::new(); count];
    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = (0..count).map(|s| Reverse((0, s))).collect();
    for i in indices {
        if let Some(Reverse((weight, shard))) = heap.pop() {
            groups[shard].push(i);
            heap.push(Reverse((weight + test_weight(&tests[i]), shard)));
        }
    }
    groups
}

/// Longest-processing-time-first: each item, heaviest first, goes to the
/// currently lightest bin (lowest index on ties). Items keep their members
/// together.
fn pack(mut items: Vec<(u64, Vec<usize>)>, count: usize) -> Vec<Vec<usize>> {
    items.sort_by_key(|(cost, _)| Reverse(*cost));

    let mut groups = vec![Vec::new(); count];
    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = (0..count).map(|s| Reverse((0, s))).collect();
    for (cost, members) in items {
        if let Some(Reverse((load, shard))) = heap.pop() {
            groups[shard].extend(members);
            heap.push(Reverse((load + cost, shard)));
        }
    }
    groups
}
