//! The publication controller
//!
//! One `Storage::run` prepares a new segment per logical region from the
//! dataset files, then commits every region in a single registry critical
//! section. The file lock serializes publishers; the registry mutex
//! serializes readers against the commit step only, so it is held for
//! microseconds regardless of dataset size.

use std::{collections::BTreeMap, env, path::Path, ptr, time::Duration};

use log::{debug, error, info, warn};
use nix::sys::mman::{mlockall, MlockAllFlags};

use crate::error::{Result, StoreError};
use crate::layout::DataLayout;
use crate::registry::{RegionRegistry, SharedMonitor};
use crate::shm::Segment;

use super::config::{StorageConfig, NO_MLOCK_ENV};
use super::dataset::{copy_file_blocks, BlockFile};
use super::lock::DatastoreLock;

/// Reader callback populating a region body from one dataset file
type BlockReader = fn(&Path, &DataLayout, *mut u8) -> Result<()>;

/// One dataset file feeding a region
struct FileSpec {
    extension: &'static str,
    required: bool,
    reader: BlockReader,
}

const REQUIRED: bool = true;
const OPTIONAL: bool = false;

/// Files making up the static region: immutable across traffic updates
const STATIC_FILES: &[FileSpec] = &[
    FileSpec {
        extension: ".ws.graph",
        required: REQUIRED,
        reader: copy_file_blocks,
    },
    FileSpec {
        extension: ".ws.names",
        required: OPTIONAL,
        reader: copy_file_blocks,
    },
    FileSpec {
        extension: ".ws.partition",
        required: OPTIONAL,
        reader: copy_file_blocks,
    },
    FileSpec {
        extension: ".ws.cells",
        required: OPTIONAL,
        reader: copy_file_blocks,
    },
];

/// Files making up the updatable region: replaced by traffic customization
const UPDATABLE_FILES: &[FileSpec] = &[
    FileSpec {
        extension: ".ws.weights",
        required: REQUIRED,
        reader: copy_file_blocks,
    },
    FileSpec {
        extension: ".ws.geometry",
        required: OPTIONAL,
        reader: copy_file_blocks,
    },
    FileSpec {
        extension: ".ws.metrics",
        required: OPTIONAL,
        reader: copy_file_blocks,
    },
];

/// A prepared, populated, not yet published segment
struct RegionHandle {
    segment: Segment,
    key: u8,
}

/// The publication controller
pub struct Storage {
    config: StorageConfig,
}

impl Storage {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Publish the configured dataset.
    ///
    /// `max_wait` bounds the wait for the registry mutex during the swap,
    /// in seconds; `-1` blocks indefinitely. The wait for the publisher
    /// file lock and the waits for reader detachment are not bounded by it.
    pub fn run(&self, max_wait: i64) -> Result<()> {
        self.config.validate()?;
        info!(
            "publishing dataset {} from {}",
            self.config.dataset_name,
            self.config.base_path.display()
        );

        let _datastore_lock = DatastoreLock::acquire(&self.config.lock_path)?;

        lock_process_pages();

        let monitor = SharedMonitor::<RegionRegistry>::create_or_open(
            &self.config.control_region_name,
        )?;

        let prepared = self.prepare_regions(&monitor, max_wait)?;

        if let Err(err) = swap(&monitor, &prepared, max_wait) {
            discard_prepared(&monitor, prepared);
            return Err(err);
        }

        info!("all data loaded, all clients switched");
        Ok(())
    }

    /// Build and populate one segment per logical region.
    ///
    /// On failure every segment prepared so far is removed and its key
    /// released; the registry proper is untouched until the swap.
    fn prepare_regions(
        &self,
        monitor: &SharedMonitor<RegionRegistry>,
        max_wait: i64,
    ) -> Result<BTreeMap<String, RegionHandle>> {
        let regions: [(String, &[FileSpec]); 2] = [
            (self.config.static_region(), STATIC_FILES),
            (self.config.updatable_region(), UPDATABLE_FILES),
        ];

        let mut prepared = BTreeMap::new();
        for (region_name, files) in regions {
            let result = self
                .populate_layout(files)
                .and_then(|layout| self.setup_region(monitor, &layout, files, max_wait));
            match result {
                Ok(handle) => {
                    prepared.insert(region_name, handle);
                }
                Err(err) => {
                    discard_prepared(monitor, prepared);
                    return Err(err);
                }
            }
        }
        Ok(prepared)
    }

    /// Walk the dataset files of one region and size its layout.
    ///
    /// Missing required files fail the run; missing optional files are
    /// skipped.
    fn populate_layout(&self, files: &[FileSpec]) -> Result<DataLayout> {
        let mut layout = DataLayout::new();
        for spec in files {
            let path = self.config.path_for(spec.extension);
            if path.exists() {
                BlockFile::open(&path)?.register_blocks(&mut layout)?;
            } else if spec.required {
                return Err(StoreError::missing_required_file(path));
            } else {
                info!("optional dataset file {} not present, skipping", path.display());
            }
        }
        Ok(layout)
    }

    /// Reserve a key, allocate the segment, write the serialized layout at
    /// offset 0, and let the file readers fill the body.
    fn setup_region(
        &self,
        monitor: &SharedMonitor<RegionRegistry>,
        layout: &DataLayout,
        files: &[FileSpec],
        max_wait: i64,
    ) -> Result<RegionHandle> {
        let key = {
            let mut registry = lock_registry(monitor, max_wait)?;
            registry.reserve_key()?
        };

        match self.setup_region_inner(key, layout, files) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                if Segment::exists(key) {
                    if let Err(remove_err) = Segment::remove(key) {
                        warn!("could not remove segment {}: {}", key, remove_err);
                    }
                }
                // Bitmap writers are serialized by the file lock; see
                // discard_prepared for why the mutex is not required here.
                unsafe {
                    monitor.data_unsynchronized().release_key(key);
                }
                Err(err)
            }
        }
    }

    fn setup_region_inner(
        &self,
        key: u8,
        layout: &DataLayout,
        files: &[FileSpec],
    ) -> Result<RegionHandle> {
        // Failure recovery: a previous publisher may have died between
        // allocating this key's segment and swapping it in.
        if Segment::exists(key) {
            warn!("old shared memory region {} still exists, removing", key);
            Segment::remove(key)?;
        }

        let encoded = layout.encode();
        let body_offset = layout.segment_header_len();
        let region_size = body_offset + layout.size_of_layout() as usize;
        info!(
            "layout of {} blocks serializes to {} bytes, allocating {} bytes of shared memory",
            layout.len(),
            encoded.len(),
            region_size
        );

        let mut segment = Segment::create(key, region_size)?;
        unsafe {
            ptr::copy_nonoverlapping(encoded.as_ptr(), segment.as_mut_ptr(), encoded.len());
        }

        let body_ptr = unsafe { segment.as_mut_ptr().add(body_offset) };
        for spec in files {
            let path = self.config.path_for(spec.extension);
            if path.exists() {
                (spec.reader)(&path, layout, body_ptr)?;
            } else if spec.required {
                return Err(StoreError::missing_required_file(path));
            }
        }

        Ok(RegionHandle { segment, key })
    }
}

/// Try to keep the whole process resident. Best effort: refusal is logged,
/// never fatal.
fn lock_process_pages() {
    if env::var(NO_MLOCK_ENV).map(|v| v == "1").unwrap_or(false) {
        info!("{}=1, not locking process pages", NO_MLOCK_ENV);
        return;
    }
    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => debug!("process pages locked into memory"),
        Err(err) => warn!("could not request RAM lock: {}", err),
    }
}

/// Commit every prepared region in one registry critical section, then
/// reclaim the segments they replaced.
fn swap(
    monitor: &SharedMonitor<RegionRegistry>,
    handles: &BTreeMap<String, RegionHandle>,
    max_wait: i64,
) -> Result<()> {
    // (key, attached segment) of every region replaced by this swap; the
    // attachment pins nattch so the detach wait below observes readers only
    let mut retired: Vec<(u8, Option<Segment>)> = Vec::new();

    {
        let mut registry = lock_registry(monitor, max_wait)?;

        // all-or-nothing: make sure every new name fits before mutating
        let new_regions = handles
            .keys()
            .filter(|name| registry.find(name).is_none())
            .count();
        if registry.free_slots() < new_regions {
            return Err(StoreError::RegistryFull);
        }

        for (name, handle) in handles {
            match registry.find(name) {
                None => {
                    registry.register(name, handle.key)?;
                }
                Some(slot) => {
                    let old_key = registry.get(slot).shm_key;
                    let old_segment = match Segment::open(old_key) {
                        Ok(segment) => Some(segment),
                        Err(_) => {
                            warn!("old segment {} already gone, nothing to reclaim", old_key);
                            None
                        }
                    };
                    let entry = registry.get_mut(slot);
                    entry.shm_key = handle.key;
                    entry.timestamp += 1;
                    retired.push((old_key, old_segment));
                }
            }
        }
    }

    info!("notifying all clients about new data in:");
    for (name, handle) in handles {
        info!("  {} -> region {}", name, handle.key);
    }
    monitor.notify_all()?;

    // The swap is committed; reclamation failures must not bubble up into
    // the caller's discard path, which would tear down segments the
    // registry now references.
    for (old_key, old_segment) in retired {
        if let Some(old_segment) = old_segment {
            // SHMCTL(2): destroyed only after the last process detaches
            info!("marking old shared memory region {} for removal", old_key);
            if let Err(err) = Segment::remove(old_key) {
                warn!("could not remove old segment {}: {}", old_key, err);
                continue;
            }
            info!("waiting for clients to detach from region {}", old_key);
            old_segment.wait_for_detach();
        }
        match monitor.lock() {
            Ok(mut registry) => {
                registry.release_key(old_key);
                debug!("key {} returned to the free pool", old_key);
            }
            Err(err) => warn!("could not release key {}: {}", old_key, err),
        }
    }

    Ok(())
}

/// Acquire the registry mutex, honoring the publication deadline.
///
/// `max_wait < 0` blocks indefinitely; otherwise a timed acquisition that
/// maps a timeout to [`StoreError::SwapTimedOut`].
fn lock_registry(
    monitor: &SharedMonitor<RegionRegistry>,
    max_wait: i64,
) -> Result<crate::registry::MonitorGuard<'_, RegionRegistry>> {
    if max_wait < 0 {
        return monitor.lock();
    }
    match monitor.try_lock_for(Duration::from_secs(max_wait as u64))? {
        Some(guard) => Ok(guard),
        None => {
            error!(
                "could not acquire region lock after {} seconds, data update failed",
                max_wait
            );
            Err(StoreError::SwapTimedOut {
                waited_secs: max_wait,
            })
        }
    }
}

/// Remove every prepared segment and return its key to the pool.
///
/// Runs on any failure before or during the swap; nothing here touches
/// registry slots, so consumers never observe the discarded segments.
fn discard_prepared(
    monitor: &SharedMonitor<RegionRegistry>,
    prepared: BTreeMap<String, RegionHandle>,
) {
    for (name, handle) in prepared {
        debug!("discarding prepared region {} (segment {})", name, handle.key);
        if let Err(err) = Segment::remove(handle.key) {
            warn!("could not remove prepared segment {}: {}", handle.key, err);
        }
        drop(handle.segment);
        // The registry mutex may be exactly what the swap timed out on.
        // Only publishers touch the key bitmap and the datastore file lock
        // serializes publishers, so the unsynchronized release is safe.
        unsafe {
            monitor.data_unsynchronized().release_key(handle.key);
        }
    }
}
