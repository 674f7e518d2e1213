use sha2::{Digest, Sha256};

/// Hash that is stable across processes, platforms and releases.
///
/// `std`'s `DefaultHasher` makes no such promise, and both hash sharding and
/// ip-hash balancing need the same key to land in the same bucket on every
/// CI run.
pub fn stable_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Bucket index in `[0, buckets)`. `buckets` must be non-zero.
pub fn bucket(key: &str, buckets: usize) -> usize {
    (stable_hash(key) % buckets as u64) as usize
}
