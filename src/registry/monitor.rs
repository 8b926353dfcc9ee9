//! Interprocess monitor hosting shared data in a control region
//!
//! A [`SharedMonitor`] maps a POSIX shared memory object laid out as a
//! process-shared robust mutex, a process-shared condition variable, a
//! magic/version word, and the guarded data `T`. Publishers and consumers
//! in different processes open the same object by name and synchronize
//! through the embedded primitives.

use std::{
    fs::File,
    marker::PhantomData,
    mem::size_of,
    ops::{Deref, DerefMut},
    ptr,
    thread,
    time::{Duration, Instant},
};

use log::warn;
use memmap2::{MmapMut, MmapOptions};
use nix::{
    errno::Errno,
    fcntl::OFlag,
    sys::mman::{shm_open, shm_unlink},
    sys::stat::Mode,
    unistd::ftruncate,
};

use crate::error::{Result, StoreError};

const MONITOR_MAGIC: u64 = 0x5741_5953_5245_4731; // "WAYSREG1"
const MONITOR_VERSION: u32 = 1;

/// How long an opener waits for the creator to finish initialization
const INIT_WAIT_LIMIT: Duration = Duration::from_secs(5);
const INIT_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[repr(C)]
struct MonitorHeader {
    mutex: libc::pthread_mutex_t,
    cond: libc::pthread_cond_t,
    version: u32,
    _pad: u32,
    // written last during initialization; openers spin on it
    magic: u64,
}

#[repr(C)]
struct MonitorBlock<T> {
    header: MonitorHeader,
    data: T,
}

/// A named shared-memory control region guarding a value of type `T`.
///
/// `T` must be `#[repr(C)]` plain data for which all-zero bytes are a
/// valid initial state; the creator relies on `ftruncate` zero-fill
/// instead of constructing `T`.
pub struct SharedMonitor<T> {
    mmap: MmapMut,
    _file: File,
    name: String,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for SharedMonitor<T> {}
unsafe impl<T: Send> Sync for SharedMonitor<T> {}

impl<T> SharedMonitor<T> {
    /// Open the named control region, creating and initializing it if it
    /// does not exist yet.
    pub fn create_or_open(name: &str) -> Result<Self> {
        let shm_name = shm_object_name(name)?;
        let size = size_of::<MonitorBlock<T>>();

        let create_flags = OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR;
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;
        match shm_open(shm_name.as_str(), create_flags, mode) {
            Ok(fd) => {
                let file = File::from(fd);
                ftruncate(&file, size as i64)?;
                let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file) }
                    .map_err(|e| StoreError::from_io(e, "could not map control region"))?;
                let monitor = Self {
                    mmap,
                    _file: file,
                    name: name.to_string(),
                    _marker: PhantomData,
                };
                monitor.initialize()?;
                Ok(monitor)
            }
            Err(Errno::EEXIST) => {
                let fd = shm_open(shm_name.as_str(), OFlag::O_RDWR, Mode::empty())?;
                let file = File::from(fd);
                wait_for_length(&file, size)?;
                let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file) }
                    .map_err(|e| StoreError::from_io(e, "could not map control region"))?;
                let monitor = Self {
                    mmap,
                    _file: file,
                    name: name.to_string(),
                    _marker: PhantomData,
                };
                monitor.wait_for_initialization()?;
                Ok(monitor)
            }
            Err(e) => Err(StoreError::platform(format!(
                "could not open control region {}: {}",
                name, e
            ))),
        }
    }

    /// True if the named control region exists
    pub fn exists(name: &str) -> bool {
        let Ok(shm_name) = shm_object_name(name) else {
            return false;
        };
        match shm_open(shm_name.as_str(), OFlag::O_RDONLY, Mode::empty()) {
            Ok(fd) => {
                drop(File::from(fd));
                true
            }
            Err(_) => false,
        }
    }

    /// Unlink the named control region.
    ///
    /// Processes that still have it mapped keep their mapping; new opens
    /// will create a fresh region.
    pub fn remove(name: &str) -> Result<()> {
        let shm_name = shm_object_name(name)?;
        shm_unlink(shm_name.as_str())?;
        Ok(())
    }

    /// Name the monitor was opened under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the monitor mutex, blocking indefinitely
    pub fn lock(&self) -> Result<MonitorGuard<'_, T>> {
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex_ptr()) };
        self.check_lock_result(rc)?;
        Ok(MonitorGuard {
            monitor: self,
            _not_send: PhantomData,
        })
    }

    /// Acquire the monitor mutex with a deadline; `None` on timeout
    pub fn try_lock_for(&self, timeout: Duration) -> Result<Option<MonitorGuard<'_, T>>> {
        let deadline = absolute_deadline(timeout)?;
        let rc = unsafe { libc::pthread_mutex_timedlock(self.mutex_ptr(), &deadline) };
        if rc == libc::ETIMEDOUT {
            return Ok(None);
        }
        self.check_lock_result(rc)?;
        Ok(Some(MonitorGuard {
            monitor: self,
            _not_send: PhantomData,
        }))
    }

    /// Release the guard, wait on the condition variable, and re-acquire.
    ///
    /// Spurious wakeups are possible; callers loop on their predicate.
    pub fn wait<'a>(&'a self, guard: MonitorGuard<'a, T>) -> Result<MonitorGuard<'a, T>> {
        let rc = unsafe { libc::pthread_cond_wait(self.cond_ptr(), self.mutex_ptr()) };
        match rc {
            0 => Ok(guard),
            libc::EOWNERDEAD => {
                self.mark_consistent();
                Ok(guard)
            }
            // the mutex is re-acquired on error; dropping the guard unlocks
            _ => Err(StoreError::platform(format!(
                "pthread_cond_wait failed: {}",
                std::io::Error::from_raw_os_error(rc)
            ))),
        }
    }

    /// Wake every process waiting on the condition variable
    pub fn notify_all(&self) -> Result<()> {
        let rc = unsafe { libc::pthread_cond_broadcast(self.cond_ptr()) };
        if rc != 0 {
            return Err(StoreError::platform(format!(
                "pthread_cond_broadcast failed: {}",
                std::io::Error::from_raw_os_error(rc)
            )));
        }
        Ok(())
    }

    /// Access the guarded data without taking the mutex.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no other process or thread mutates
    /// the accessed state concurrently, through some external serialization
    /// (e.g. the publisher file lock for key-bitmap edits).
    pub unsafe fn data_unsynchronized(&self) -> &mut T {
        &mut (*self.block_ptr()).data
    }

    fn block_ptr(&self) -> *mut MonitorBlock<T> {
        self.mmap.as_ptr() as *mut MonitorBlock<T>
    }

    fn mutex_ptr(&self) -> *mut libc::pthread_mutex_t {
        unsafe { &mut (*self.block_ptr()).header.mutex }
    }

    fn cond_ptr(&self) -> *mut libc::pthread_cond_t {
        unsafe { &mut (*self.block_ptr()).header.cond }
    }

    fn check_lock_result(&self, rc: libc::c_int) -> Result<()> {
        match rc {
            0 => Ok(()),
            libc::EOWNERDEAD => {
                self.mark_consistent();
                Ok(())
            }
            _ => Err(StoreError::platform(format!(
                "could not lock registry mutex: {}",
                std::io::Error::from_raw_os_error(rc)
            ))),
        }
    }

    fn mark_consistent(&self) {
        warn!(
            "previous owner of the {} mutex died; recovering",
            self.name
        );
        unsafe {
            libc::pthread_mutex_consistent(self.mutex_ptr());
        }
    }

    /// Initialize the pthread primitives and publish the magic word.
    ///
    /// Runs only in the creating process; the backing pages are zeroed by
    /// `ftruncate`, which is the valid initial state of `T`.
    fn initialize(&self) -> Result<()> {
        unsafe {
            let header = &mut (*self.block_ptr()).header;

            let mut mutex_attr = std::mem::zeroed::<libc::pthread_mutexattr_t>();
            check_pthread(libc::pthread_mutexattr_init(&mut mutex_attr), "mutexattr_init")?;
            check_pthread(
                libc::pthread_mutexattr_setpshared(&mut mutex_attr, libc::PTHREAD_PROCESS_SHARED),
                "mutexattr_setpshared",
            )?;
            check_pthread(
                libc::pthread_mutexattr_setrobust(&mut mutex_attr, libc::PTHREAD_MUTEX_ROBUST),
                "mutexattr_setrobust",
            )?;
            check_pthread(
                libc::pthread_mutex_init(&mut header.mutex, &mutex_attr),
                "mutex_init",
            )?;
            libc::pthread_mutexattr_destroy(&mut mutex_attr);

            let mut cond_attr = std::mem::zeroed::<libc::pthread_condattr_t>();
            check_pthread(libc::pthread_condattr_init(&mut cond_attr), "condattr_init")?;
            check_pthread(
                libc::pthread_condattr_setpshared(&mut cond_attr, libc::PTHREAD_PROCESS_SHARED),
                "condattr_setpshared",
            )?;
            check_pthread(
                libc::pthread_cond_init(&mut header.cond, &cond_attr),
                "cond_init",
            )?;
            libc::pthread_condattr_destroy(&mut cond_attr);

            header.version = MONITOR_VERSION;
            std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
            ptr::write_volatile(&mut header.magic, MONITOR_MAGIC);
        }
        Ok(())
    }

    /// Spin until the creating process has published the magic word
    fn wait_for_initialization(&self) -> Result<()> {
        let start = Instant::now();
        loop {
            let header = unsafe { &(*self.block_ptr()).header };
            let magic = unsafe { ptr::read_volatile(&header.magic) };
            if magic == MONITOR_MAGIC {
                if header.version != MONITOR_VERSION {
                    return Err(StoreError::platform(format!(
                        "control region {} has layout version {}, expected {}",
                        self.name, header.version, MONITOR_VERSION
                    )));
                }
                return Ok(());
            }
            if start.elapsed() > INIT_WAIT_LIMIT {
                return Err(StoreError::platform(format!(
                    "control region {} was never initialized",
                    self.name
                )));
            }
            thread::sleep(INIT_POLL_INTERVAL);
        }
    }
}

/// RAII guard over the monitor mutex; dereferences to the guarded data.
///
/// The phantom pointer keeps the guard on the locking thread: a pthread
/// mutex must be unlocked by the thread that acquired it.
pub struct MonitorGuard<'a, T> {
    monitor: &'a SharedMonitor<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for MonitorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &(*self.monitor.block_ptr()).data }
    }
}

impl<T> DerefMut for MonitorGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut (*self.monitor.block_ptr()).data }
    }
}

impl<T> Drop for MonitorGuard<'_, T> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.monitor.mutex_ptr());
        }
    }
}

fn shm_object_name(name: &str) -> Result<String> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(StoreError::invalid_parameter(
            "name",
            "control region names must be non-empty and free of '/' and NUL",
        ));
    }
    Ok(format!("/{}", name))
}

/// An opener can observe the object between creation and `ftruncate`;
/// mapping past EOF would fault, so wait for the full length first.
fn wait_for_length(file: &File, size: usize) -> Result<()> {
    let start = Instant::now();
    loop {
        let len = file
            .metadata()
            .map_err(|e| StoreError::from_io(e, "could not stat control region"))?
            .len();
        if len as usize >= size {
            return Ok(());
        }
        if start.elapsed() > INIT_WAIT_LIMIT {
            return Err(StoreError::platform(
                "control region was never sized by its creator",
            ));
        }
        thread::sleep(INIT_POLL_INTERVAL);
    }
}

fn absolute_deadline(timeout: Duration) -> Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    if rc != 0 {
        return Err(StoreError::last_os_error("clock_gettime failed"));
    }
    now.tv_sec += timeout.as_secs() as libc::time_t;
    now.tv_nsec += timeout.subsec_nanos() as libc::c_long;
    if now.tv_nsec >= 1_000_000_000 {
        now.tv_sec += 1;
        now.tv_nsec -= 1_000_000_000;
    }
    Ok(now)
}

fn check_pthread(rc: libc::c_int, what: &str) -> Result<()> {
    if rc != 0 {
        return Err(StoreError::platform(format!(
            "pthread_{} failed: {}",
            what,
            std::io::Error::from_raw_os_error(rc)
        )));
    }
    Ok(())
}
