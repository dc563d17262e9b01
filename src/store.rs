use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use axum::body::Body;
use bytes::Bytes;
use futures_util::stream;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

use crate::error::{Error, Result};
use crate::lock::PathLocks;

const FOLLOW_POLL: Duration = Duration::from_millis(25);
const CONSUMER_POLL: Duration = Duration::from_millis(250);
const CHUNK: usize = 64 * 1024;
/// Tempfiles untouched for this long are presumed leftovers of a dead
/// worker and swept.
const TMP_GRACE: Duration = Duration::from_secs(60 * 60);

/// A content-addressed, single-flight store of byte streams, shared between
/// worker processes through the filesystem.
///
/// Keys are hex digests; an entry lives at `<dir>/<key[0:2]>/<key>` with a
/// sibling `<key>.lock` file and, while being produced, a `<key>.tmp` file.
/// At most one producer runs per key at a time; every other caller either
/// streams the finished file or follows the growing tempfile from offset 0.
/// An entry becomes ready only through an atomic rename of a fully-written
/// tempfile, so readers of the final path never observe partial content.
///
/// No entry state is held in memory between requests; every decision starts
/// from the filesystem, which is what lets several workers (or machines)
/// share one cache directory.
pub struct ObjectStore {
    dir: PathBuf,
    locks: PathLocks,
    /// In-process consumer registries of in-flight productions, so late
    /// joiners keep the producer alive and abandonment can be detected.
    live: Arc<Mutex<HashMap<String, Weak<()>>>>,
    lock_timeout: Duration,
    produce_timeout: Duration,
}

/// Handle a producer can use to notice that every in-process reader of its
/// stream has detached.
#[derive(Clone)]
pub struct Consumers(Weak<()>);

impl Consumers {
    pub fn gone(&self) -> bool {
        self.0.strong_count() == 0
    }

    /// Resolves once the last reader detaches; pends forever while any
    /// remains.
    pub async fn wait_gone(&self) {
        while !self.gone() {
            tokio::time::sleep(CONSUMER_POLL).await;
        }
    }
}

impl ObjectStore {
    pub fn new(
        dir: PathBuf,
        locks: PathLocks,
        lock_timeout: Duration,
        produce_timeout: Duration,
    ) -> Self {
        Self {
            dir,
            locks,
            live: Arc::new(Mutex::new(HashMap::new())),
            lock_timeout,
            produce_timeout,
        }
    }

    pub fn entry_path(&self, key: &str) -> PathBuf {
        debug_assert!(key.len() >= 2 && key.is_ascii());
        self.dir.join(&key[..2]).join(key)
    }

    /// Serve the bytes for `key`, producing them at most once across all
    /// concurrent callers (and cooperating processes).
    ///
    /// Returns the response body and, when served from a finished entry,
    /// its length. `produce` receives the writable tempfile and a
    /// [`Consumers`] handle; returning an error (including
    /// [`Error::Canceled`] once all consumers are gone) discards the
    /// tempfile and leaves no entry behind.
    pub async fn serve<F, Fut>(&self, key: &str, produce: F) -> Result<(Body, Option<u64>)>
    where
        F: FnOnce(fs::File, Consumers) -> Fut,
        Fut: Future<Output = Result<u64>> + Send + 'static,
    {
        let path = self.entry_path(key);
        let tmp = tmp_path(&path);

        // ready entry: stream it and refresh its LRU position
        if let Some(ready) = self.open_ready(&path).await? {
            return Ok(ready);
        }

        // a producer is already running, possibly in another process:
        // follow its tempfile
        match fs::File::open(&tmp).await {
            Ok(file) => {
                let consumer = self
                    .live
                    .lock()
                    .expect("live map poisoned")
                    .get(key)
                    .and_then(Weak::upgrade);
                tracing::debug!(%key, "joining in-flight production");
                return Ok((self.follow(file, tmp, path, consumer), None));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        // become the producer
        fs::create_dir_all(path.parent().expect("entries are sharded")).await?;
        let lock = self
            .locks
            .acquire(&lock_path(&path), self.lock_timeout)
            .await?;

        // somebody else may have finished while we waited for the lock
        if let Some(ready) = self.open_ready(&path).await? {
            return Ok(ready);
        }

        // under the lock, a remaining tempfile is a dead worker's leftover
        match fs::remove_file(&tmp).await {
            Ok(()) => tracing::warn!(?tmp, "removed stale tempfile"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let out = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .await?;
        let reader = fs::File::open(&tmp).await?;

        let consumers = Arc::new(());
        self.live
            .lock()
            .expect("live map poisoned")
            .insert(key.to_owned(), Arc::downgrade(&consumers));

        let fut = produce(out, Consumers(Arc::downgrade(&consumers)));
        let produce_timeout = self.produce_timeout;
        let live = self.live.clone();
        let key = key.to_owned();
        let (task_tmp, task_path) = (tmp.clone(), path.clone());
        tokio::spawn(async move {
            let _lock = lock;
            let result = match tokio::time::timeout(produce_timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(Error::Subprocess(format!("production of {key} timed out"))),
            };
            match result {
                Ok(written) => match fs::rename(&task_tmp, &task_path).await {
                    Ok(()) => tracing::info!(%key, written, "cache entry ready"),
                    Err(err) => {
                        tracing::error!(%key, %err, "failed to finalize cache entry");
                        let _ = fs::remove_file(&task_tmp).await;
                    }
                },
                Err(Error::Canceled) => {
                    tracing::debug!(%key, "production abandoned, no consumers left");
                    let _ = fs::remove_file(&task_tmp).await;
                }
                Err(err) => {
                    tracing::warn!(%key, %err, "production failed");
                    let _ = fs::remove_file(&task_tmp).await;
                }
            }
            live.lock().expect("live map poisoned").remove(&key);
        });

        Ok((self.follow(reader, tmp, path, Some(consumers)), None))
    }

    async fn open_ready(&self, path: &Path) -> Result<Option<(Body, Option<u64>)>> {
        match fs::File::open(path).await {
            Ok(file) => {
                let len = file.metadata().await?.len();
                touch(path).await;
                Ok(Some((
                    Body::from_stream(ReaderStream::new(file)),
                    Some(len),
                )))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Stream a file that may still be growing: read to EOF, then wait for
    /// the producer to either rename the tempfile into place (drain and
    /// finish) or remove it (error termination).
    ///
    /// The rename keeps the inode, so the open descriptor stays valid
    /// through the transition; the same holds for followers in other worker
    /// processes, which is what makes cross-process fanout work.
    fn follow(
        &self,
        mut file: fs::File,
        tmp: PathBuf,
        path: PathBuf,
        consumer: Option<Arc<()>>,
    ) -> Body {
        let stall_budget = self.produce_timeout;
        let (tx, mut rx) = mpsc::channel::<io::Result<Bytes>>(8);
        tokio::spawn(async move {
            let _consumer = consumer;
            let mut buf = vec![0u8; CHUNK];
            let mut draining = false;
            let mut stalled = Duration::ZERO;
            loop {
                match file.read(&mut buf).await {
                    Ok(0) => {
                        if draining {
                            break;
                        }
                        if fs::try_exists(&tmp).await.unwrap_or(false) {
                            if stalled >= stall_budget {
                                let _ = tx
                                    .send(Err(io::Error::new(
                                        io::ErrorKind::TimedOut,
                                        "producer stalled",
                                    )))
                                    .await;
                                break;
                            }
                            tokio::time::sleep(FOLLOW_POLL).await;
                            stalled += FOLLOW_POLL;
                        } else if fs::try_exists(&path).await.unwrap_or(false) {
                            // renamed under us: the inode is complete, read
                            // out whatever is left
                            draining = true;
                        } else {
                            let _ = tx
                                .send(Err(io::Error::other("cache entry production failed")))
                                .await;
                            break;
                        }
                    }
                    Ok(n) => {
                        stalled = Duration::ZERO;
                        if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                            // reader hung up; detach
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        break;
                    }
                }
            }
        });
        Body::from_stream(stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }

    /// One eviction pass: drop entries older than `max_age`, then the
    /// oldest entries (by mtime, which tracks last access) until the total
    /// size fits `max_bytes`. Entries whose lock is held are skipped and
    /// picked up by a later pass; fresh tempfiles are left alone.
    pub async fn sweep(&self, max_bytes: u64, max_age: Option<Duration>) -> Result<()> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || sweep_blocking(&dir, max_bytes, max_age))
            .await
            .expect("sweep task panicked")?;
        Ok(())
    }
}

fn sweep_blocking(dir: &Path, max_bytes: u64, max_age: Option<Duration>) -> io::Result<()> {
    let now = SystemTime::now();
    let mut entries = Vec::new();

    let shards = match std::fs::read_dir(dir) {
        Ok(shards) => shards,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    for shard in shards {
        let shard = shard?;
        if !shard.file_type()?.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(shard.path())? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // entries can vanish mid-walk; that's not our problem
            let Ok(meta) = entry.metadata() else { continue };
            let mtime = meta.modified().unwrap_or(now);
            if name.ends_with(".lock") {
                continue;
            }
            if name.ends_with(".tmp") {
                if now.duration_since(mtime).is_ok_and(|age| age > TMP_GRACE) {
                    tracing::warn!(?path, "removing stale tempfile");
                    let _ = std::fs::remove_file(&path);
                }
                continue;
            }
            entries.push((path, meta.len(), mtime));
        }
    }

    if let Some(max_age) = max_age {
        entries.retain(|(path, _, mtime)| {
            if now.duration_since(*mtime).is_ok_and(|age| age > max_age) {
                !unlink_unless_locked(path)
            } else {
                true
            }
        });
    }

    entries.sort_by_key(|&(_, _, mtime)| mtime);
    let mut total: u64 = entries.iter().map(|&(_, len, _)| len).sum();
    for (path, len, _) in &entries {
        if total <= max_bytes {
            break;
        }
        if unlink_unless_locked(path) {
            tracing::info!(?path, len, "evicted cache entry");
            total -= len;
        }
    }
    Ok(())
}

/// Unlink a cache entry unless its producer (or a peer's sweep) holds the
/// entry lock. Readers with the file already open are unaffected; they keep
/// the unlinked inode.
fn unlink_unless_locked(path: &Path) -> bool {
    let Ok(file) = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(lock_path(path))
    else {
        return false;
    };
    let mut lock = fd_lock::RwLock::new(file);
    let result = match lock.try_write() {
        Ok(_guard) => std::fs::remove_file(path).is_ok(),
        Err(_) => false,
    };
    result
}

fn lock_path(path: &Path) -> PathBuf {
    sibling(path, ".lock")
}

fn tmp_path(path: &Path) -> PathBuf {
    sibling(path, ".tmp")
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

/// Bump mtime so LRU eviction tracks access, not creation.
async fn touch(path: &Path) {
    let path = path.to_owned();
    let _ = tokio::task::spawn_blocking(move || {
        if let Ok(file) = std::fs::OpenOptions::new().append(true).open(&path) {
            let _ = file.set_modified(SystemTime::now());
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    use super::*;

    fn store(root: &Path) -> ObjectStore {
        ObjectStore::new(
            root.join("cache"),
            PathLocks::new(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }

    fn key() -> String {
        "ab".repeat(32)
    }

    async fn collect(body: Body) -> Vec<u8> {
        body.collect().await.unwrap().to_bytes().to_vec()
    }

    #[tokio::test]
    async fn produces_once_then_serves_from_disk() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let (body, len) = store
            .serve(&key(), move |mut out, _| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                out.write_all(b"pack bytes").await?;
                out.flush().await?;
                Ok(10)
            })
            .await
            .unwrap();
        assert_eq!(len, None);
        assert_eq!(collect(body).await, b"pack bytes");

        // the follower only finishes after the rename, so the entry is
        // already in place
        let entry = store.entry_path(&key());
        assert!(entry.exists());
        assert!(!tmp_path(&entry).exists());

        let (body, len) = store
            .serve(&key(), |_, _| async move {
                Err(Error::Subprocess("second production".into()))
            })
            .await
            .unwrap();
        assert_eq!(len, Some(10));
        assert_eq!(collect(body).await, b"pack bytes");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_production() {
        let dir = tempdir().unwrap();
        let store = Arc::new(store(dir.path()));
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let (first, _) = store
            .serve(&key(), move |mut out, _| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                out.write_all(b"hello ").await?;
                out.flush().await?;
                tokio::time::sleep(Duration::from_millis(100)).await;
                out.write_all(b"world").await?;
                out.flush().await?;
                Ok(11)
            })
            .await
            .unwrap();

        // join while the producer is mid-write
        tokio::time::sleep(Duration::from_millis(20)).await;
        let joined = {
            let store = store.clone();
            tokio::spawn(async move {
                let (second, _) = store
                    .serve(&key(), |_, _| async move {
                        Err(Error::Subprocess("duplicate production".into()))
                    })
                    .await
                    .unwrap();
                collect(second).await
            })
        };

        assert_eq!(collect(first).await, b"hello world");
        assert_eq!(joined.await.unwrap(), b"hello world");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_production_terminates_readers_and_leaves_nothing() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let (body, _) = store
            .serve(&key(), |mut out, _| async move {
                out.write_all(b"partial").await?;
                out.flush().await?;
                Err(Error::Subprocess("upload-pack died".into()))
            })
            .await
            .unwrap();

        // the reader sees the partial bytes followed by an error
        body.collect().await.unwrap_err();

        let entry = store.entry_path(&key());
        assert!(!entry.exists());
        assert!(!tmp_path(&entry).exists());

        // and the key is usable again afterwards
        let (body, _) = store
            .serve(&key(), |mut out, _| async move {
                out.write_all(b"ok").await?;
                out.flush().await?;
                Ok(2)
            })
            .await
            .unwrap();
        assert_eq!(collect(body).await, b"ok");
    }

    #[tokio::test]
    async fn abandoned_production_is_canceled() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let (body, _) = store
            .serve(&key(), |mut out, consumers| async move {
                loop {
                    if consumers.gone() {
                        return Err(Error::Canceled);
                    }
                    out.write_all(b"chunk").await?;
                    out.flush().await?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap();

        // sole consumer walks away
        drop(body);

        let entry = store.entry_path(&key());
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            if !tmp_path(&entry).exists() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "abandoned production was not cleaned up"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(!entry.exists());
    }

    #[tokio::test]
    async fn sweep_evicts_oldest_until_under_budget() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let keys = ["aa".repeat(32), "bb".repeat(32), "cc".repeat(32)];
        for (i, key) in keys.iter().enumerate() {
            let path = store.entry_path(key);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, vec![0u8; 100]).unwrap();
            let age = Duration::from_secs(60 * (keys.len() - i) as u64);
            std::fs::File::options()
                .append(true)
                .open(&path)
                .unwrap()
                .set_modified(SystemTime::now() - age)
                .unwrap();
        }

        store.sweep(150, None).await.unwrap();

        assert!(!store.entry_path(&keys[0]).exists());
        assert!(!store.entry_path(&keys[1]).exists());
        assert!(store.entry_path(&keys[2]).exists());
    }

    #[tokio::test]
    async fn sweep_honors_max_age_but_skips_locked_entries() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let locks = PathLocks::new();

        let path = store.entry_path(&key());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();
        std::fs::File::options()
            .append(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(7200))
            .unwrap();

        let guard = locks
            .acquire(&lock_path(&path), Duration::from_secs(1))
            .await
            .unwrap();
        store
            .sweep(u64::MAX, Some(Duration::from_secs(3600)))
            .await
            .unwrap();
        assert!(path.exists(), "locked entry must survive the sweep");

        drop(guard);
        store
            .sweep(u64::MAX, Some(Duration::from_secs(3600)))
            .await
            .unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_tempfiles() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let entry = store.entry_path(&key());
        std::fs::create_dir_all(entry.parent().unwrap()).unwrap();

        let stale = tmp_path(&entry);
        std::fs::write(&stale, b"orphaned").unwrap();
        std::fs::File::options()
            .append(true)
            .open(&stale)
            .unwrap()
            .set_modified(SystemTime::now() - 2 * TMP_GRACE)
            .unwrap();

        let fresh = tmp_path(&store.entry_path(&"dd".repeat(32)));
        std::fs::create_dir_all(fresh.parent().unwrap()).unwrap();
        std::fs::write(&fresh, b"in progress").unwrap();

        store.sweep(u64::MAX, None).await.unwrap();

        assert!(!stale.exists());
        assert!(fresh.exists());
    }
}
