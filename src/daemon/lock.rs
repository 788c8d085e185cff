//! Single-instance enforcement via an exclusive lock on a sentinel file.
//!
//! The lock is an OS-level exclusive `flock` (through `fs2`) on
//! `<home>/daemon.lock`. The OS drops it if the daemon dies, so a crash never
//! leaves a lock that blocks the next start. Contention is not an error:
//! `acquire` returns `None` and the caller exits cleanly.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct LockManager {
    path: PathBuf,
}

/// Proof that this process owns the daemon lock.
///
/// Consumed by `release`, so a handle can only be released once.
#[derive(Debug)]
pub struct DaemonLock {
    file: File,
    path: PathBuf,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Tries up to `max_retries` times (at least once), sleeping
    /// `retry_delay` between attempts.
    ///
    /// Returns `Ok(None)` when another instance still holds the lock.
    pub async fn acquire(
        &self,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<Option<DaemonLock>> {
        let attempts = max_retries.max(1);
        for attempt in 1..=attempts {
            if let Some(lock) = self.try_acquire()? {
                return Ok(Some(lock));
            }
            if attempt < attempts {
                tokio::time::sleep(retry_delay).await;
            }
        }
        Ok(None)
    }

    /// Single non-blocking attempt.
    pub fn try_acquire(&self) -> Result<Option<DaemonLock>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create lock directory: {}", parent.display())
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .with_context(|| format!("Failed to open lock file: {}", self.path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                // A previous holder may have unlinked the sentinel between our
                // open and our lock; a lock on an orphaned inode protects nothing.
                if !refers_to_same_file(&file, &self.path) {
                    let _ = FileExt::unlock(&file);
                    return Ok(None);
                }
                Ok(Some(DaemonLock {
                    file,
                    path: self.path.clone(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e).context("Failed to acquire daemon lock"),
        }
    }
}

impl DaemonLock {
    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the sentinel and drops the lock.
    pub fn release(self) -> Result<()> {
        if refers_to_same_file(&self.file, &self.path) {
            std::fs::remove_file(&self.path).with_context(|| {
                format!("Failed to remove lock file: {}", self.path.display())
            })?;
        }
        FileExt::unlock(&self.file).context("Failed to unlock daemon lock")?;
        Ok(())
    }
}

#[cfg(unix)]
fn refers_to_same_file(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(held), Ok(on_disk)) => held.dev() == on_disk.dev() && held.ino() == on_disk.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn refers_to_same_file(_file: &File, path: &Path) -> bool {
    path.exists()
}

#[cfg(test)]
#[path = "tests/lock_tests.rs"]
mod tests;
