//! Advisory cross-process lock guarding feed updates.
//!
//! The lock is a plain file locked with the platform's advisory file-lock
//! primitive, so it is released on every exit path — dropping the guard,
//! unwinding, or death of the holding process all close the descriptor.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs4::FileExt;

use crate::error::{Error, Result};

/// File-backed mutex with a non-blocking `try_acquire` and a retrying
/// blocking `acquire`. Nesting an acquisition inside a held guard from the
/// same process deadlocks by design; callers keep acquisitions flat.
pub struct FeedLock {
    path: PathBuf,
    retry_interval: Duration,
}

/// Holds the lock for its lifetime.
pub struct FeedLockGuard {
    file: File,
}

impl Drop for FeedLockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl FeedLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retry_interval: Duration::from_secs(10),
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Attempts the lock once. `Ok(None)` means another process holds it.
    pub fn try_acquire(&self) -> Result<Option<FeedLockGuard>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(FeedLockGuard { file })),
            Err(e) if contended(&e) => Ok(None),
            Err(e) => Err(Error::FeedUnavailable(format!(
                "cannot lock {}: {e}",
                self.path.display()
            ))),
        }
    }

    /// Waits until the lock is free, retrying on a fixed interval.
    pub async fn acquire(&self) -> Result<FeedLockGuard> {
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }
            tracing::debug!(path = %self.path.display(), "feed lock busy, waiting");
            tokio::time::sleep(self.retry_interval).await;
        }
    }
}

fn contended(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock
        || e.raw_os_error() == fs4::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FeedLock::new(dir.path().join("feed.lock"));

        let held = lock.try_acquire().unwrap();
        assert!(held.is_some());

        let contender = FeedLock::new(dir.path().join("feed.lock"));
        assert!(contender.try_acquire().unwrap().is_none());

        drop(held);
        assert!(contender.try_acquire().unwrap().is_some());
    }

    #[tokio::test]
    async fn blocking_acquire_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.lock");
        let lock = FeedLock::new(&path).with_retry_interval(Duration::from_millis(10));

        let guard = lock.try_acquire().unwrap().unwrap();
        let waiter = FeedLock::new(&path).with_retry_interval(Duration::from_millis(10));

        let handle = tokio::spawn(async move { waiter.acquire().await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("acquire should finish once the lock is free")
            .unwrap()
            .unwrap();
    }
}
