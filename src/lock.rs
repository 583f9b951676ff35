//! Single-instance enforcement via an exclusive advisory file lock.
//!
//! Two daemons supervising the same fan controller would fight each other, so
//! startup takes a non-blocking exclusive lock. Contention is a normal early
//! exit, not an error. The lock is held for the process lifetime and released
//! by the kernel on exit.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;

use anyhow::{Context, Result};

/// Holds the lock file open; dropping it releases the lock.
#[derive(Debug)]
pub struct InstanceLock {
    _file: File,
}

/// Result of a lock attempt.
#[derive(Debug)]
pub enum LockOutcome {
    Acquired(InstanceLock),
    AlreadyRunning,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<LockOutcome> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(LockOutcome::Acquired(InstanceLock { _file: file }));
        }

        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EWOULDBLOCK) => Ok(LockOutcome::AlreadyRunning),
            _ => Err(err).with_context(|| format!("flock on {}", path.display())),
        }
    }
}
