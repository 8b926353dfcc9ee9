//! Sharded cache for shortest-path edge unpacking
//!
//! `get` promotes the LRU position, which is a mutation, so a single
//! reader-writer lock would serialize readers anyway. The cache is split
//! into [`SHARD_COUNT`] shards instead, each behind its own exclusive lock
//! held only for that shard's operations.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use super::lru::LruCache;

/// Node identifier in the route graph
pub type NodeId = u32;

/// Duration annotation of an unpacked edge
pub type EdgeDuration = i32;

/// Sentinel for "no cached duration"
pub const INVALID_EDGE_DURATION: EdgeDuration = EdgeDuration::MAX;

/// Number of independently locked cache shards
pub const SHARD_COUNT: usize = 16;

/// Estimated per-entry footprint: key + value + map and recency-list
/// bookkeeping
const ENTRY_FOOTPRINT: usize = 64;

/// Default memory budget when none is configured (256 MiB)
const DEFAULT_MEMORY_BUDGET: usize = 256 << 20;

/// Cache key for one unpacked edge.
///
/// `generation` is the registry timestamp the consumer last observed for
/// its attached segment. Bumping it makes every older entry miss without a
/// flush; stale entries age out through normal LRU eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeKey {
    pub source: NodeId,
    pub target: NodeId,
    pub exclude_index: u8,
    pub generation: u32,
}

impl EdgeKey {
    pub fn new(source: NodeId, target: NodeId, exclude_index: u8, generation: u32) -> Self {
        Self {
            source,
            target,
            exclude_index,
            generation,
        }
    }
}

/// Bounded, sharded, concurrency-safe memoization of edge unpacking
pub struct UnpackingCache {
    shards: Vec<Mutex<LruCache<EdgeKey, EdgeDuration>>>,
}

impl UnpackingCache {
    /// Create a cache holding roughly `capacity` entries across all shards
    pub fn new(capacity: usize) -> Self {
        let per_shard = (capacity + SHARD_COUNT - 1) / SHARD_COUNT;
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect();
        Self { shards }
    }

    /// Create a cache sized to fit `bytes` of memory
    pub fn with_memory_budget(bytes: usize) -> Self {
        Self::new(bytes / ENTRY_FOOTPRINT)
    }

    /// Total entry capacity across all shards
    pub fn capacity(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap().capacity())
            .sum()
    }

    /// Current number of cached entries
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    /// True if no entries are cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if the edge is cached; does not promote
    pub fn contains(&self, key: &EdgeKey) -> bool {
        self.shard(key).lock().unwrap().contains(key)
    }

    /// Look up an edge, promoting it on a hit
    pub fn get(&self, key: &EdgeKey) -> Option<EdgeDuration> {
        self.shard(key).lock().unwrap().get(key).copied()
    }

    /// Insert or replace an edge annotation
    pub fn insert(&self, key: EdgeKey, duration: EdgeDuration) {
        self.shard(&key).lock().unwrap().insert(key, duration);
    }

    fn shard(&self, key: &EdgeKey) -> &Mutex<LruCache<EdgeKey, EdgeDuration>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }
}

impl Default for UnpackingCache {
    fn default() -> Self {
        Self::with_memory_budget(DEFAULT_MEMORY_BUDGET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_contains() {
        let cache = UnpackingCache::new(1024);
        let key = EdgeKey::new(17, 42, 0, 1);

        assert!(!cache.contains(&key));
        cache.insert(key, 350);
        assert!(cache.contains(&key));
        assert_eq!(cache.get(&key), Some(350));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_generation_mismatch_misses() {
        let cache = UnpackingCache::new(1024);
        let old = EdgeKey::new(17, 42, 0, 5);
        cache.insert(old, 350);

        // reader observed a republication: generation 6
        let new = EdgeKey::new(17, 42, 0, 6);
        assert!(!cache.contains(&new));
        assert_eq!(cache.get(&new), None);

        // the old entry is still present until evicted
        assert!(cache.contains(&old));
        assert_eq!(cache.get(&old), Some(350));
    }

    #[test]
    fn test_exclude_index_distinguishes_entries() {
        let cache = UnpackingCache::new(1024);
        cache.insert(EdgeKey::new(1, 2, 0, 1), 10);
        cache.insert(EdgeKey::new(1, 2, 1, 1), 20);

        assert_eq!(cache.get(&EdgeKey::new(1, 2, 0, 1)), Some(10));
        assert_eq!(cache.get(&EdgeKey::new(1, 2, 1, 1)), Some(20));
    }

    #[test]
    fn test_memory_budget_sizing() {
        let cache = UnpackingCache::with_memory_budget(64 << 10);
        let expected = (64 << 10) / ENTRY_FOOTPRINT;
        // per-shard rounding may add at most SHARD_COUNT - 1 entries
        assert!(cache.capacity() >= expected);
        assert!(cache.capacity() < expected + SHARD_COUNT);
    }
}
