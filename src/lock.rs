use std::collections::HashMap;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::error::{Error, Result};

const FLOCK_POLL: Duration = Duration::from_millis(100);

/// Per-path exclusive locks, effective across tasks and across processes.
///
/// In-process exclusivity comes from a weakly-held map of async mutexes: an
/// entry exists only while some task holds or waits for it. Cross-process
/// exclusivity comes from an advisory `flock` on the lock file itself, which
/// also backstops the map against its own removal races.
///
/// Acquisition is not re-entrant; a task acquiring a path it already holds
/// deadlocks until its timeout.
#[derive(Clone, Debug, Default)]
pub struct PathLocks {
    inner: Arc<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive lock for `path`, creating the lock file if
    /// needed. Fails with [`Error::LockTimeout`] once `timeout` has elapsed.
    ///
    /// Dropping the future while waiting abandons the wait and leaves the
    /// lock untouched.
    pub async fn acquire(&self, path: &Path, timeout: Duration) -> Result<PathLockGuard> {
        let deadline = Instant::now() + timeout;

        let entry = {
            let mut map = self.inner.lock().expect("lock map poisoned");
            map.entry(path.to_owned()).or_default().clone()
        };

        let task = match tokio::time::timeout_at(deadline, entry.clone().lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                drop(entry);
                self.reap(path);
                return Err(Error::LockTimeout(path.to_owned()));
            }
        };
        drop(entry);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory for lock file {path:?}"))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .await
            .with_context(|| format!("failed to open lock file {path:?}"))?
            .into_std()
            .await;

        let mut flock = fd_lock::RwLock::new(file);
        loop {
            match flock.try_write() {
                Ok(guard) => {
                    // Keep the OS lock past this scope: it is released when
                    // the file handle drops with the returned guard.
                    mem::forget(guard);
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        drop(task);
                        self.reap(path);
                        return Err(Error::LockTimeout(path.to_owned()));
                    }
                    tokio::time::sleep(FLOCK_POLL).await;
                }
                Err(err) => {
                    drop(task);
                    self.reap(path);
                    return Err(Error::Other(
                        anyhow::Error::new(err).context(format!("flock on {path:?} failed")),
                    ));
                }
            }
        }

        Ok(PathLockGuard {
            locks: self.clone(),
            path: path.to_owned(),
            file: Some(flock),
            task: Some(task),
        })
    }

    /// Drop the map entry for `path` when nobody holds or awaits it.
    fn reap(&self, path: &Path) {
        let mut map = self.inner.lock().expect("lock map poisoned");
        if let Some(entry) = map.get(path) {
            // one reference in the map, at most one in the calling guard
            if Arc::strong_count(entry) <= 2 {
                map.remove(path);
            }
        }
    }

    #[cfg(test)]
    fn entries(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// An acquired path lock. Dropping it releases the OS lock (by closing the
/// lock file), wakes the next in-process waiter, and reaps the map entry if
/// it is no longer needed.
#[derive(Debug)]
pub struct PathLockGuard {
    locks: PathLocks,
    path: PathBuf,
    file: Option<fd_lock::RwLock<std::fs::File>>,
    task: Option<OwnedMutexGuard<()>>,
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        self.file.take();
        self.task.take();
        self.locks.reap(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn mutual_exclusion_within_process() {
        let dir = tempdir().unwrap();
        let locks = PathLocks::new();
        let path = dir.path().join("entry.lock");

        let guard = locks.acquire(&path, Duration::from_secs(1)).await.unwrap();

        let contender = {
            let locks = locks.clone();
            let path = path.clone();
            tokio::spawn(async move { locks.acquire(&path, Duration::from_secs(5)).await.map(drop) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn contention_across_registries_hits_the_file_lock() {
        // Separate registries model separate processes sharing a cache
        // directory: only the flock can arbitrate between them.
        let dir = tempdir().unwrap();
        let path = dir.path().join("entry.lock");

        let holder = PathLocks::new();
        let _guard = holder.acquire(&path, Duration::from_secs(1)).await.unwrap();

        let err = PathLocks::new()
            .acquire(&path, Duration::from_millis(250))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
    }

    #[tokio::test]
    async fn acquire_times_out() {
        let dir = tempdir().unwrap();
        let locks = PathLocks::new();
        let path = dir.path().join("entry.lock");

        let _guard = locks.acquire(&path, Duration::from_secs(1)).await.unwrap();

        let err = locks
            .acquire(&path, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
    }

    #[tokio::test]
    async fn map_entry_reaped_on_release() {
        let dir = tempdir().unwrap();
        let locks = PathLocks::new();
        let path = dir.path().join("entry.lock");

        let guard = locks.acquire(&path, Duration::from_secs(1)).await.unwrap();
        assert_eq!(locks.entries(), 1);

        drop(guard);
        assert_eq!(locks.entries(), 0);

        // and the lock can be taken again afterwards
        locks.acquire(&path, Duration::from_secs(1)).await.unwrap();
    }
}
