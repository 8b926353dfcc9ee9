//! # Waystore - Shared-Memory Dataset Publication
//!
//! Waystore is the data publication core of a routing engine: a
//! single-writer, many-reader shared-memory service that atomically swaps
//! large, read-mostly datasets into the address space of consumer processes
//! without interrupting in-flight reads.
//!
//! ## Features
//!
//! - **Immutable mapped regions**: dataset slices live in shared memory
//!   segments that are write-once for the loader and read-only for readers
//! - **Atomic publication**: all regions of one run are committed in a
//!   single registry critical section; readers already attached keep their
//!   old segments until they detach
//! - **Pointer-free registry**: a fixed-capacity name table in a shared
//!   control region, usable the moment it is mapped
//! - **Self-describing segments**: a serialized layout header lets any
//!   reader locate typed blocks from the segment's first byte
//! - **Query-path caching**: a sharded, generation-keyed LRU memoizes
//!   shortest-path edge unpacking
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   Control Region                     │
//! │  robust mutex + condvar │ region registry            │
//! │                         │ name → (key, timestamp)    │
//! └──────────────────────────────────────────────────────┘
//!        │ commit (publisher)        │ resolve (readers)
//!        ▼                           ▼
//! ┌────────────────┐   ┌────────────────┐   ┌───────────┐
//! │  Segment k=1   │   │  Segment k=2   │   │    ...    │
//! │  layout header │   │  layout header │   │           │
//! │  block bodies  │   │  block bodies  │   │           │
//! └────────────────┘   └────────────────┘   └───────────┘
//! ```
//!
//! A publication run walks the dataset files to size a [`DataLayout`] per
//! region, populates fresh segments behind the publisher file lock, and
//! swaps the registry entries under the shared mutex. Replaced segments are
//! marked for destruction and reclaimed once their last reader detaches.

pub mod cache;
pub mod error;
pub mod layout;
pub mod registry;
pub mod shm;
pub mod store;

// Main API re-exports
pub use cache::{
    EdgeDuration, EdgeKey, LruCache, NodeId, UnpackingCache, INVALID_EDGE_DURATION, SHARD_COUNT,
};
pub use error::{Result, StoreError};
pub use layout::{Block, DataLayout, BLOCK_ALIGNMENT, MAX_BLOCK_NAME_LEN};
pub use registry::{
    MonitorGuard, RegionEntry, RegionRegistry, SharedMonitor, SlotId, INVALID_SLOT,
    MAX_REGION_NAME_LEN, REGION_CAPACITY,
};
pub use shm::{Segment, INVALID_SHM_KEY};
pub use store::{
    BlockFile, BlockFileWriter, DatastoreLock, RegionView, Storage, StorageConfig,
    CONTROL_REGION_NAME, LOCK_FILE_NAME, NO_MLOCK_ENV,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
