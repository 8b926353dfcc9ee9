//! The publication controller and consumer attachment
//!
//! `Storage` implements the single-writer publication protocol: prepare new
//! segments from dataset files, then atomically repoint the shared registry
//! under its mutex. `RegionView` is the consumer side: resolve a region
//! name, attach its segment read-only, and read typed blocks.

pub mod config;
pub mod dataset;
pub mod lock;
pub mod publisher;
pub mod view;

pub use config::{StorageConfig, CONTROL_REGION_NAME, LOCK_FILE_NAME, NO_MLOCK_ENV};
pub use dataset::{BlockFile, BlockFileWriter, DATASET_MAGIC, DATASET_VERSION};
pub use lock::DatastoreLock;
pub use publisher::Storage;
pub use view::RegionView;
