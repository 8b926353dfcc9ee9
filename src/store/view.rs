//! Consumer attachment to a published region

use std::mem::{align_of, size_of};

use crate::error::{Result, StoreError};
use crate::layout::{align_up, Block, DataLayout, BLOCK_ALIGNMENT};
use crate::registry::{RegionRegistry, SharedMonitor, SlotId};
use crate::shm::Segment;

/// A read-only view of one published region.
///
/// Opening a view resolves the region name under the registry mutex,
/// attaches the backing segment, and decodes the layout header. The
/// attachment keeps the segment alive across republications: a publisher
/// replacing this region blocks its reclamation until the view is dropped.
pub struct RegionView {
    name: String,
    slot: SlotId,
    timestamp: u32,
    segment: Segment,
    layout: DataLayout,
    body_offset: usize,
}

impl RegionView {
    /// Attach the region registered under `name`
    pub fn open(monitor: &SharedMonitor<RegionRegistry>, name: &str) -> Result<Self> {
        let (slot, key, timestamp) = {
            let registry = monitor.lock()?;
            let slot = registry
                .find(name)
                .ok_or_else(|| StoreError::region_not_found(name))?;
            let entry = registry.get(slot);
            (slot, entry.shm_key, entry.timestamp)
        };

        let segment = Segment::open_read_only(key)?;
        let header = unsafe { std::slice::from_raw_parts(segment.as_ptr(), segment.size()) };
        let (layout, consumed) = DataLayout::decode(header)?;
        let body_offset = align_up(consumed as u64, BLOCK_ALIGNMENT) as usize;
        if body_offset as u64 + layout.size_of_layout() > segment.size() as u64 {
            return Err(StoreError::malformed_layout(format!(
                "segment {} is smaller than its declared layout",
                key
            )));
        }

        Ok(Self {
            name: name.to_string(),
            slot,
            timestamp,
            segment,
            layout,
            body_offset,
        })
    }

    /// Region name this view resolved
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registry timestamp observed at open; feed this to the unpacking
    /// cache as the dataset generation
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Key of the attached segment
    pub fn shm_key(&self) -> u8 {
        self.segment.key()
    }

    /// The decoded layout of the attached segment
    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Typed pointer to a block in the attached body
    pub fn block_ptr<T>(&self, block_name: &str) -> Result<*const T> {
        let ptr: *mut T = self
            .layout
            .get_block_ptr(self.body_ptr(), block_name)?;
        if (ptr as usize) % align_of::<T>() != 0 {
            return Err(StoreError::invalid_parameter(
                "block",
                format!("block {} is not aligned for the requested type", block_name),
            ));
        }
        Ok(ptr as *const T)
    }

    /// Typed slice over a block, `element_count` items long
    pub fn block_slice<T>(&self, block_name: &str) -> Result<&[T]> {
        let block: Block = *self.layout.get_block(block_name)?;
        let needed = block
            .element_count
            .checked_mul(size_of::<T>() as u64)
            .filter(|needed| *needed <= block.byte_size);
        if needed.is_none() {
            return Err(StoreError::invalid_parameter(
                "block",
                format!(
                    "{} elements of {} bytes do not fit block {} ({} bytes)",
                    block.element_count,
                    size_of::<T>(),
                    block_name,
                    block.byte_size
                ),
            ));
        }
        let ptr = self.block_ptr::<T>(block_name)?;
        Ok(unsafe { std::slice::from_raw_parts(ptr, block.element_count as usize) })
    }

    /// True if the registry still maps this region to the attached segment
    pub fn is_current(&self, monitor: &SharedMonitor<RegionRegistry>) -> Result<bool> {
        let registry = monitor.lock()?;
        let entry = registry.get(self.slot);
        Ok(entry.is_in_use() && entry.name() == self.name && entry.timestamp == self.timestamp)
    }

    /// Block on the registry condition variable until this region's slot
    /// advances past the attached generation; returns the new timestamp.
    ///
    /// The view still reads the old segment afterwards; callers reopen to
    /// pick up the new one.
    pub fn wait_for_update(&self, monitor: &SharedMonitor<RegionRegistry>) -> Result<u32> {
        let mut registry = monitor.lock()?;
        loop {
            let entry = registry.get(self.slot);
            if entry.timestamp != self.timestamp {
                return Ok(entry.timestamp);
            }
            registry = monitor.wait(registry)?;
        }
    }

    fn body_ptr(&self) -> *mut u8 {
        // the mapping is read-only; every public accessor hands out *const
        (self.segment.as_ptr() as *mut u8).wrapping_add(self.body_offset)
    }
}
