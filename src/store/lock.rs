//! Publisher serialization lock
//!
//! An advisory fcntl write lock on a well-known file. The kernel releases
//! record locks when the holding process exits, so a crashed publisher
//! never wedges the next one.

use std::{
    os::unix::prelude::RawFd,
    path::{Path, PathBuf},
};

use log::warn;
use nix::{
    errno::Errno,
    fcntl::{fcntl, open, FcntlArg, OFlag},
    sys::stat::Mode,
};

use crate::error::{Result, StoreError};

/// Held for the whole publication run; released when dropped
#[must_use]
pub struct DatastoreLock {
    fd: RawFd,
    path: PathBuf,
}

impl DatastoreLock {
    /// Acquire the exclusive publisher lock at `path`.
    ///
    /// Tries without blocking first; if another publisher holds the lock,
    /// logs a warning and waits until it finishes.
    pub fn acquire(path: &Path) -> Result<Self> {
        let fd = open(
            path,
            OFlag::O_CREAT | OFlag::O_RDWR | OFlag::O_NOCTTY,
            Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH,
        )
        .map_err(|e| {
            StoreError::platform(format!("could not open lock file {}: {}", path.display(), e))
        })?;

        let lock = libc::flock {
            l_type: libc::F_WRLCK as i16,
            l_whence: 0,
            l_start: 0,
            l_len: 0,
            l_pid: 0,
        };

        match fcntl(fd, FcntlArg::F_SETLK(&lock)) {
            Ok(_) => {}
            Err(Errno::EACCES) | Err(Errno::EAGAIN) => {
                warn!("data update in progress, waiting until it finishes");
                if let Err(e) = fcntl(fd, FcntlArg::F_SETLKW(&lock)) {
                    close_fd(fd);
                    return Err(StoreError::platform(format!(
                        "could not wait for publisher lock: {}",
                        e
                    )));
                }
            }
            Err(e) => {
                close_fd(fd);
                return Err(StoreError::platform(format!(
                    "could not acquire publisher lock: {}",
                    e
                )));
            }
        }

        Ok(Self {
            fd,
            path: path.to_path_buf(),
        })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DatastoreLock {
    fn drop(&mut self) {
        // The file itself stays in place: unlinking it would let the next
        // publisher lock a fresh inode while a waiter still blocks on the
        // old one.
        close_fd(self.fd);
    }
}

fn close_fd(fd: RawFd) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}
