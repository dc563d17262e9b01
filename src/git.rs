use std::path::PathBuf;
use std::process::Stdio;

use axum::http::HeaderValue;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};

#[cfg(test)]
use mockall::automock;

/// Thin wrapper around the `git` binaries. Mocked in tests.
#[derive(Debug, Default)]
pub struct Git {}

#[cfg_attr(test, automock)]
impl Git {
    /// `git clone --mirror <upstream> <local>`.
    ///
    /// Does not clean up after a failed clone; the caller owns the
    /// directory's lifecycle.
    pub async fn clone_mirror(
        &self,
        upstream: String,
        local: PathBuf,
        auth: Option<HeaderValue>,
    ) -> Result<()> {
        let mut cmd = Command::new("git");
        scrub_env(&mut cmd);
        if let Some(config) = auth_config(&auth)? {
            cmd.arg("-c").arg(config);
        }
        cmd.arg("clone")
            .arg("--mirror")
            .arg(&upstream)
            .arg(&local)
            .stdin(Stdio::null());
        run_to_completion(cmd, "git clone").await
    }

    /// `git fetch --prune` inside an existing mirror.
    pub async fn fetch_mirror(&self, local: PathBuf, auth: Option<HeaderValue>) -> Result<()> {
        let mut cmd = Command::new("git");
        scrub_env(&mut cmd);
        cmd.arg("-C").arg(&local);
        if let Some(config) = auth_config(&auth)? {
            cmd.arg("-c").arg(config);
        }
        cmd.arg("fetch").arg("--prune").stdin(Stdio::null());
        run_to_completion(cmd, "git fetch").await
    }

    /// Run `git-upload-pack --stateless-rpc` against a local mirror, feeding
    /// it `input` on stdin and copying its stdout into `out`. Returns the
    /// number of bytes written.
    ///
    /// Dropping the returned future kills the subprocess.
    pub async fn upload_pack(
        &self,
        local: PathBuf,
        input: Bytes,
        out: tokio::fs::File,
    ) -> Result<u64> {
        let mut cmd = Command::new("git-upload-pack");
        scrub_env(&mut cmd);
        let mut child = cmd
            .env("GIT_PROTOCOL", "version=2")
            .arg("--stateless-rpc")
            .arg(&local)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| Error::Subprocess(format!("failed to spawn git-upload-pack: {err}")))?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        let feed = tokio::spawn(async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        });

        let mut stdout = child.stdout.take().expect("stdout was piped");
        let mut out = out;
        let written = tokio::io::copy(&mut stdout, &mut out).await?;
        out.flush().await?;

        if let Err(err) = feed.await.expect("stdin writer panicked") {
            // EPIPE here usually means upload-pack bailed early; the exit
            // status below is the authoritative signal.
            tracing::debug!(%err, "writing to git-upload-pack stdin failed");
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(Error::Subprocess(format!(
                "git-upload-pack exited with {status}"
            )));
        }
        Ok(written)
    }
}

/// Every git subprocess runs with a scrubbed environment so the server's
/// own credentials and helpers never leak into upstream access or into the
/// process that parses client-supplied bodies.
fn scrub_env(cmd: &mut Command) {
    cmd.env_clear()
        .envs(std::env::vars().filter(|(key, _)| {
            key == "PATH" || key == "HOME" || key.starts_with("GIT_TRACE")
        }))
        .env("GIT_TERMINAL_PROMPT", "0");
}

/// Forward the client's `Authorization` header to upstream git transport.
fn auth_config(auth: &Option<HeaderValue>) -> Result<Option<String>> {
    match auth {
        None => Ok(None),
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| Error::Protocol("non-ASCII Authorization header".into()))?;
            Ok(Some(format!("http.extraHeader=Authorization: {value}")))
        }
    }
}

async fn run_to_completion(mut cmd: Command, what: &str) -> Result<()> {
    let output = cmd
        .output()
        .await
        .map_err(|err| Error::Subprocess(format!("failed to spawn {what}: {err}")))?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::Upstream {
            status: None,
            message: format!("{what} failed ({}): {}", output.status, stderr.trim()),
        })
    }
}
