//! The shared region registry and its interprocess monitor
//!
//! The registry is a fixed-capacity, pointer-free table that lives entirely
//! inside a shared-memory control region; a freshly mapped copy is usable
//! without fix-up in any process. The monitor hosts it together with the
//! process-shared mutex and condition variable that coordinate publishers
//! and readers.

pub mod monitor;
pub mod register;

pub use monitor::{MonitorGuard, SharedMonitor};
pub use register::{
    RegionEntry, RegionRegistry, SlotId, INVALID_SLOT, MAX_REGION_NAME_LEN, REGION_CAPACITY,
};
