//! Fixed-capacity region registry
//!
//! All state is `#[repr(C)]` plain data and all-zero bytes are a valid
//! empty registry, so the control region needs no initialization beyond
//! `ftruncate`.

use std::mem::size_of;

use crate::error::{Result, StoreError};
use crate::shm::INVALID_SHM_KEY;

/// Maximum number of regions the registry can hold
pub const REGION_CAPACITY: usize = 256;

/// Maximum region name length in bytes (strictly less, names are NUL-padded)
pub const MAX_REGION_NAME_LEN: usize = 64;

/// Identifier of a registry slot
pub type SlotId = u32;

/// Sentinel returned when a name has no slot
pub const INVALID_SLOT: SlotId = SlotId::MAX;

const KEY_BITMAP_WORDS: usize = 4; // 256 keys

/// One registry slot: a region name bound to a segment key and generation
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RegionEntry {
    name: [u8; MAX_REGION_NAME_LEN],
    /// Generation counter, bumped on every republication of this slot
    pub timestamp: u32,
    /// Key of the segment currently backing this region
    pub shm_key: u8,
    in_use: u8,
    _pad: [u8; 2],
}

const _: () = assert!(size_of::<RegionEntry>() == MAX_REGION_NAME_LEN + 8);

impl RegionEntry {
    const EMPTY: RegionEntry = RegionEntry {
        name: [0; MAX_REGION_NAME_LEN],
        timestamp: 0,
        shm_key: INVALID_SHM_KEY,
        in_use: 0,
        _pad: [0; 2],
    };

    /// True if the slot holds a registered region
    pub fn is_in_use(&self) -> bool {
        self.in_use != 0
    }

    /// The region name stored in the slot
    pub fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_REGION_NAME_LEN);
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

/// The shared-memory region table plus the key reservation bitmap.
///
/// Callers hold the registry mutex for mutations and at least a reader's
/// view for reads; the struct itself carries no locks. Slots are never
/// deallocated while the host is running, so slot ids stay stable for
/// long-running consumers.
#[repr(C)]
pub struct RegionRegistry {
    entries: [RegionEntry; REGION_CAPACITY],
    key_bitmap: [u64; KEY_BITMAP_WORDS],
}

impl RegionRegistry {
    /// Create an empty registry (equivalent to all-zero shared memory)
    pub fn new() -> Self {
        Self {
            entries: [RegionEntry::EMPTY; REGION_CAPACITY],
            key_bitmap: [0; KEY_BITMAP_WORDS],
        }
    }

    /// Reserve the smallest unused segment key in [1, 255]
    pub fn reserve_key(&mut self) -> Result<u8> {
        for key in 1..=u8::MAX {
            if !self.key_bit(key) {
                self.set_key_bit(key, true);
                return Ok(key);
            }
        }
        Err(StoreError::KeyExhausted)
    }

    /// Return a key to the free pool.
    ///
    /// Precondition: no in-use entry references `key`.
    pub fn release_key(&mut self, key: u8) {
        debug_assert!(self
            .entries
            .iter()
            .all(|e| !e.is_in_use() || e.shm_key != key));
        self.set_key_bit(key, false);
    }

    /// True if the key is currently reserved
    pub fn is_key_reserved(&self, key: u8) -> bool {
        self.key_bit(key)
    }

    /// Find the slot holding `name`, linear scan over in-use entries
    pub fn find(&self, name: &str) -> Option<SlotId> {
        self.entries
            .iter()
            .position(|e| e.is_in_use() && e.name() == name)
            .map(|i| i as SlotId)
    }

    /// Bind `name` to `shm_key` in the first free slot, with timestamp 1.
    ///
    /// The caller must have checked that `name` is not already registered.
    pub fn register(&mut self, name: &str, shm_key: u8) -> Result<SlotId> {
        if name.is_empty() || name.len() >= MAX_REGION_NAME_LEN {
            return Err(StoreError::invalid_parameter(
                "name",
                format!("region name must be 1..{} bytes", MAX_REGION_NAME_LEN),
            ));
        }
        if shm_key == INVALID_SHM_KEY {
            return Err(StoreError::invalid_parameter("shm_key", "key 0 is reserved"));
        }
        debug_assert!(self.find(name).is_none());

        let slot = self
            .entries
            .iter()
            .position(|e| !e.is_in_use())
            .ok_or(StoreError::RegistryFull)?;

        let entry = &mut self.entries[slot];
        entry.name.fill(0);
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        entry.shm_key = shm_key;
        entry.timestamp = 1;
        entry.in_use = 1;
        Ok(slot as SlotId)
    }

    /// Direct access to a slot
    pub fn get(&self, slot: SlotId) -> &RegionEntry {
        &self.entries[slot as usize]
    }

    /// Direct mutable access to a slot; requires the registry mutex
    pub fn get_mut(&mut self, slot: SlotId) -> &mut RegionEntry {
        &mut self.entries[slot as usize]
    }

    /// Number of slots still free
    pub fn free_slots(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_in_use()).count()
    }

    /// Number of registered regions
    pub fn in_use_count(&self) -> usize {
        REGION_CAPACITY - self.free_slots()
    }

    /// Iterate in-use slots in slot order
    pub fn iter_in_use(&self) -> impl Iterator<Item = (SlotId, &RegionEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_in_use())
            .map(|(i, e)| (i as SlotId, e))
    }

    fn key_bit(&self, key: u8) -> bool {
        self.key_bitmap[key as usize / 64] & (1u64 << (key as usize % 64)) != 0
    }

    fn set_key_bit(&mut self, key: u8, value: bool) {
        let mask = 1u64 << (key as usize % 64);
        if value {
            self.key_bitmap[key as usize / 64] |= mask;
        } else {
            self.key_bitmap[key as usize / 64] &= !mask;
        }
    }
}

impl Default for RegionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_smallest_key_first() {
        let mut registry = RegionRegistry::new();
        assert_eq!(registry.reserve_key().unwrap(), 1);
        assert_eq!(registry.reserve_key().unwrap(), 2);
        registry.release_key(1);
        assert_eq!(registry.reserve_key().unwrap(), 1);
        assert_eq!(registry.reserve_key().unwrap(), 3);
    }

    #[test]
    fn test_key_exhaustion() {
        let mut registry = RegionRegistry::new();
        for expected in 1..=u8::MAX {
            assert_eq!(registry.reserve_key().unwrap(), expected);
        }
        assert!(matches!(
            registry.reserve_key(),
            Err(StoreError::KeyExhausted)
        ));
    }

    #[test]
    fn test_register_and_find() {
        let mut registry = RegionRegistry::new();
        let key = registry.reserve_key().unwrap();
        let slot = registry.register("berlin/static", key).unwrap();

        assert_eq!(registry.find("berlin/static"), Some(slot));
        assert_eq!(registry.find("berlin/updatable"), None);

        let entry = registry.get(slot);
        assert!(entry.is_in_use());
        assert_eq!(entry.name(), "berlin/static");
        assert_eq!(entry.shm_key, key);
        assert_eq!(entry.timestamp, 1);
    }

    #[test]
    fn test_in_use_entries_have_reserved_nonzero_keys() {
        let mut registry = RegionRegistry::new();
        for i in 0..4 {
            let key = registry.reserve_key().unwrap();
            registry.register(&format!("region-{}", i), key).unwrap();
        }
        for (_, entry) in registry.iter_in_use() {
            assert_ne!(entry.shm_key, INVALID_SHM_KEY);
            assert!(registry.is_key_reserved(entry.shm_key));
        }
        assert_eq!(registry.in_use_count(), 4);
    }

    #[test]
    fn test_registry_full() {
        let mut registry = RegionRegistry::new();
        for i in 0..REGION_CAPACITY {
            registry.register(&format!("region-{}", i), 1).unwrap();
        }
        assert!(matches!(
            registry.register("one-too-many", 1),
            Err(StoreError::RegistryFull)
        ));
    }

    #[test]
    fn test_register_rejects_bad_names() {
        let mut registry = RegionRegistry::new();
        assert!(registry.register("", 1).is_err());
        assert!(registry
            .register(&"x".repeat(MAX_REGION_NAME_LEN), 1)
            .is_err());
        assert!(registry.register("ok", INVALID_SHM_KEY).is_err());
    }

    #[test]
    fn test_zeroed_registry_is_empty() {
        let registry: RegionRegistry = unsafe { std::mem::zeroed() };
        assert_eq!(registry.in_use_count(), 0);
        assert!(!registry.is_key_reserved(1));
    }
}
