//! XSI shared memory segment wrapper

use std::{mem::MaybeUninit, ptr, thread, time::Duration};

use log::debug;

use crate::error::{Result, StoreError};

/// Key value reserved as "invalid"; real segments use keys in [1, 255]
pub const INVALID_SHM_KEY: u8 = 0;

/// Project-specific base folded into the one-byte region key to form the
/// IPC key, so segments do not collide with other users of the key space.
const IPC_KEY_BASE: libc::key_t = 0x5753_0000; // "WS"

/// Interval between attach-count polls while waiting for readers to detach
const DETACH_POLL_INTERVAL: Duration = Duration::from_millis(50);

fn ipc_key(key: u8) -> libc::key_t {
    IPC_KEY_BASE | key as libc::key_t
}

/// An attached XSI shared memory segment.
///
/// Detaches on drop. Destruction is decoupled from detaching: a segment
/// removed with [`Segment::remove`] survives until its last attacher goes
/// away.
#[derive(Debug)]
pub struct Segment {
    shmid: libc::c_int,
    key: u8,
    ptr: *mut u8,
    size: usize,
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create a new zero-initialized segment of `size` bytes and attach it
    /// read-write. Fails if a segment with this key already exists.
    pub fn create(key: u8, size: usize) -> Result<Self> {
        if key == INVALID_SHM_KEY {
            return Err(StoreError::invalid_parameter("key", "key 0 is reserved"));
        }
        let shmid = unsafe {
            libc::shmget(
                ipc_key(key),
                size,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };
        if shmid == -1 {
            return Err(StoreError::last_os_error(&format!(
                "could not allocate shared memory segment {} ({} bytes)",
                key, size
            )));
        }
        Self::attach(shmid, key, false)
    }

    /// Attach an existing segment read-write
    pub fn open(key: u8) -> Result<Self> {
        Self::attach(Self::shmid_for(key)?, key, false)
    }

    /// Attach an existing segment read-only
    pub fn open_read_only(key: u8) -> Result<Self> {
        Self::attach(Self::shmid_for(key)?, key, true)
    }

    fn shmid_for(key: u8) -> Result<libc::c_int> {
        let shmid = unsafe { libc::shmget(ipc_key(key), 0, 0) };
        if shmid == -1 {
            return Err(StoreError::last_os_error(&format!(
                "no shared memory segment for key {}",
                key
            )));
        }
        Ok(shmid)
    }

    fn attach(shmid: libc::c_int, key: u8, read_only: bool) -> Result<Self> {
        let flags = if read_only { libc::SHM_RDONLY } else { 0 };
        let ptr = unsafe { libc::shmat(shmid, ptr::null(), flags) };
        if ptr as isize == -1 {
            return Err(StoreError::last_os_error(&format!(
                "could not attach shared memory segment {}",
                key
            )));
        }
        let size = stat(shmid)?.shm_segsz as usize;
        Ok(Self {
            shmid,
            key,
            ptr: ptr as *mut u8,
            size,
        })
    }

    /// True if a segment with this key exists on the system
    pub fn exists(key: u8) -> bool {
        unsafe { libc::shmget(ipc_key(key), 0, 0) != -1 }
    }

    /// Mark the segment with this key for destruction.
    ///
    /// SHMCTL(2): the segment is actually destroyed only after the last
    /// process detaches it; the key becomes available again immediately.
    pub fn remove(key: u8) -> Result<()> {
        let shmid = Self::shmid_for(key)?;
        let rc = unsafe { libc::shmctl(shmid, libc::IPC_RMID, ptr::null_mut()) };
        if rc == -1 {
            return Err(StoreError::last_os_error(&format!(
                "could not remove shared memory segment {}",
                key
            )));
        }
        Ok(())
    }

    /// The one-byte region key this segment was created under
    pub fn key(&self) -> u8 {
        self.key
    }

    /// Size of the segment in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Raw pointer to the first byte of the segment
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Mutable raw pointer to the first byte of the segment
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    /// Number of processes currently attached to the segment
    pub fn attach_count(&self) -> Result<u64> {
        Ok(stat(self.shmid)?.shm_nattch as u64)
    }

    /// Block until this handle is the segment's only attachment.
    ///
    /// A segment id that vanishes mid-wait (already destroyed) counts as
    /// detached. A signal that kills the process mid-wait leaves the
    /// segment marked-for-destroy, which is safe: the OS still reclaims it
    /// on the last detach.
    pub fn wait_for_detach(&self) {
        loop {
            match stat(self.shmid) {
                Ok(ds) if ds.shm_nattch <= 1 => return,
                Ok(ds) => {
                    debug!(
                        "segment {}: waiting for {} attached client(s)",
                        self.key,
                        ds.shm_nattch - 1
                    );
                    thread::sleep(DETACH_POLL_INTERVAL);
                }
                // EINVAL / EIDRM: the segment is gone
                Err(_) => return,
            }
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::shmdt(self.ptr as *const libc::c_void);
            }
        }
    }
}

fn stat(shmid: libc::c_int) -> Result<libc::shmid_ds> {
    let mut ds = MaybeUninit::<libc::shmid_ds>::zeroed();
    let rc = unsafe { libc::shmctl(shmid, libc::IPC_STAT, ds.as_mut_ptr()) };
    if rc == -1 {
        return Err(StoreError::last_os_error("shmctl(IPC_STAT) failed"));
    }
    Ok(unsafe { ds.assume_init() })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Key 255 is effectively never handed out by the registry in normal
    // operation (keys are allocated smallest-first), so it is safe to use
    // for an isolated unit test.
    const TEST_KEY: u8 = 255;

    #[test]
    fn test_create_write_read_remove() {
        if Segment::exists(TEST_KEY) {
            Segment::remove(TEST_KEY).unwrap();
        }

        let mut segment = Segment::create(TEST_KEY, 4096).unwrap();
        assert_eq!(segment.size(), 4096);
        assert!(Segment::exists(TEST_KEY));

        unsafe {
            // freshly created segments are zeroed
            assert_eq!(*segment.as_ptr(), 0);
            *segment.as_mut_ptr() = 0x42;
        }

        let reader = Segment::open_read_only(TEST_KEY).unwrap();
        unsafe {
            assert_eq!(*reader.as_ptr(), 0x42);
        }
        assert!(segment.attach_count().unwrap() >= 2);

        drop(reader);
        Segment::remove(TEST_KEY).unwrap();
        segment.wait_for_detach();
        drop(segment);
        assert!(!Segment::exists(TEST_KEY));
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(Segment::create(INVALID_SHM_KEY, 16).is_err());
    }
}
