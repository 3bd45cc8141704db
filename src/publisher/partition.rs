use crate::config::types::PartitionKeyPolicy;
use crate::source::tweet::Tweet;

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// 64-bit FNV-1a. Stable across processes and releases, unlike `DefaultHasher`.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

pub fn partition_key(policy: PartitionKeyPolicy, tweet: &Tweet) -> String {
    match policy {
        PartitionKeyPolicy::Author => tweet.author().to_string(),
        PartitionKeyPolicy::TweetId => tweet.id().to_string(),
    }
}

/// Bucket in `0..buckets` for a key
pub fn route(key: &str, buckets: usize) -> usize {
    (fnv1a(key.as_bytes()) % buckets.max(1) as u64) as usize
}
