//! Process-local caches for the query path
//!
//! The unpacking cache memoizes shortest-path edge unpacking, the dominant
//! repeated computation during queries. Each consumer process maintains its
//! own cache; nothing here touches shared memory.

pub mod lru;
pub mod unpacking;

pub use lru::LruCache;
pub use unpacking::{
    EdgeDuration, EdgeKey, NodeId, UnpackingCache, INVALID_EDGE_DURATION, SHARD_COUNT,
};
