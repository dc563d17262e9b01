use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use axum::http::HeaderValue;
use tokio::fs;

use crate::error::{Error, Result};
use crate::lock::PathLocks;

#[cfg(not(test))]
use crate::git::Git;
#[cfg(test)]
use crate::git::MockGit as Git;

/// How long to wait for another worker's clone or fetch of the same mirror.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const FETCH_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Local bare mirrors of upstream repositories, one directory per repo path
/// under `<cacheRoot>/git`, with mutation serialized per repo across tasks
/// and processes.
#[derive(Clone)]
pub struct Mirrors {
    inner: Arc<MirrorsInner>,
}

struct MirrorsInner {
    root: PathBuf,
    upstream: String,
    ttl: Duration,
    git: Arc<Git>,
    locks: PathLocks,
    refreshed: Mutex<HashMap<PathBuf, SystemTime>>,
}

impl Mirrors {
    pub fn new(
        root: PathBuf,
        upstream: String,
        ttl: Duration,
        git: Arc<Git>,
        locks: PathLocks,
    ) -> Self {
        Self {
            inner: Arc::new(MirrorsInner {
                root,
                upstream,
                ttl,
                git,
                locks,
                refreshed: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Absolute mirror directory for a repo path like `/group/project.git`.
    ///
    /// Guard against path traversal attacks, as well as any other "strange"
    /// path components that may cause issues.
    pub fn dir(&self, repo_path: &str) -> Result<PathBuf> {
        let mut local = self.inner.root.clone();
        for comp in Path::new(repo_path.trim_start_matches('/')).components() {
            match comp {
                Component::Normal(c) => local.push(c),
                comp => {
                    tracing::warn!(?repo_path, "disallowed component present: {comp:?}");
                    return Err(Error::NotFound);
                }
            }
        }
        if local == self.inner.root {
            return Err(Error::NotFound);
        }
        Ok(local)
    }

    /// Clone the mirror if absent, fetch it otherwise, and return its
    /// directory ready for a local `git-upload-pack` run.
    ///
    /// Concurrent callers for the same repo are serialized. A caller that
    /// waited while another caller finished a refresh skips its own, and a
    /// non-zero TTL widens that window.
    pub async fn ensure_fresh(
        &self,
        repo_path: &str,
        auth: Option<HeaderValue>,
    ) -> Result<PathBuf> {
        let local = self.dir(repo_path)?;
        let arrived = SystemTime::now();

        let _lock = self
            .inner
            .locks
            .acquire(&lock_path(&local), LOCK_TIMEOUT)
            .await?;

        if !fs::try_exists(local.join("HEAD")).await? {
            fs::create_dir_all(local.parent().expect("mirror dirs live under the root")).await?;
            let upstream = format!("{}{}", self.inner.upstream, repo_path);
            tracing::info!(?local, %upstream, "cloning mirror");
            if let Err(err) = self
                .inner
                .git
                .clone_mirror(upstream, local.clone(), auth)
                .await
            {
                // don't leave a partial clone behind
                let _ = fs::remove_dir_all(&local).await;
                return Err(err);
            }
        } else if !self.fresh_since(&local, arrived) {
            tracing::debug!(?local, "refreshing mirror");
            if let Err(first) = self.inner.git.fetch_mirror(local.clone(), auth.clone()).await {
                tracing::warn!(?local, %first, "mirror fetch failed, retrying once");
                tokio::time::sleep(FETCH_RETRY_BACKOFF).await;
                self.inner.git.fetch_mirror(local.clone(), auth).await?;
            }
        }

        self.inner
            .refreshed
            .lock()
            .expect("refresh map poisoned")
            .insert(local.clone(), SystemTime::now());
        Ok(local)
    }

    /// A refresh that completed after this caller arrived, or within the
    /// TTL, is fresh enough. Failed refreshes leave the prior state intact,
    /// so the map only ever records successes.
    fn fresh_since(&self, local: &Path, arrived: SystemTime) -> bool {
        let refreshed = self.inner.refreshed.lock().expect("refresh map poisoned");
        match refreshed.get(local) {
            Some(&at) => {
                at >= arrived
                    || arrived
                        .duration_since(at)
                        .is_ok_and(|age| age <= self.inner.ttl)
            }
            None => false,
        }
    }
}

/// `<mirrorDir>.lock`, next to (not inside) the mirror directory.
fn lock_path(dir: &Path) -> PathBuf {
    let mut name = dir.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    dir.with_file_name(name)
}
