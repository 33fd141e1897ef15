//! An on-disk advisory lock used to guarantee at-most-one-builder-per-key.
//! Implemented with `O_EXCL`-style exclusive file creation rather than a
//! crate dependency — `std::fs::OpenOptions::create_new` is already atomic
//! on every platform this crate targets.

use crate::error::{BuildError, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Held for the lifetime of a cache build; the lockfile is removed on drop.
pub struct CacheLock {
    path: PathBuf,
}

impl CacheLock {
    /// Blocks the current (blocking) thread until the lock for `key` is
    /// acquired or `timeout` elapses, polling every `poll_interval`
    /// (configurable via [`crate::config::CacheConfig::lock_poll_interval`]).
    pub fn acquire_with_poll(tmp_dir: &Path, key: &str, timeout: Duration, poll_interval: Duration) -> Result<Self> {
        let path = tmp_dir.join(format!("{key}.lock"));
        let deadline = Instant::now() + timeout;

        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(BuildError::CacheLockTimeout(key.to_string()));
                    }
                    std::thread::sleep(poll_interval);
                }
                Err(e) => return Err(BuildError::from(e)),
            }
        }
    }

    pub fn acquire(tmp_dir: &Path, key: &str, timeout: Duration) -> Result<Self> {
        Self::acquire_with_poll(tmp_dir, key, timeout, DEFAULT_POLL_INTERVAL)
    }

    pub fn acquire_default(tmp_dir: &Path, key: &str) -> Result<Self> {
        Self::acquire(tmp_dir, key, DEFAULT_TIMEOUT)
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
