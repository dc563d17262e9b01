use std::sync::Arc;

use anyhow::Context;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;

use crate::error::{Error, Result};
use crate::protocol::{self, Command};
use crate::proxy;
use crate::server::{App, MAX_BODY};
use crate::store::Consumers;

/// `POST /<repo>/git-upload-pack`.
///
/// `fetch` commands are served from the pack cache. Everything else in the
/// body (ls-refs, unknown commands, pre-v2 requests) is proxied upstream
/// untouched, as is `git-receive-pack` one router branch over: only fetches
/// are ever cached.
pub async fn handle(app: &Arc<App>, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let repo = parts
        .uri
        .path()
        .strip_suffix("/git-upload-pack")
        .ok_or(Error::NotFound)?
        .to_owned();

    let body = axum::body::to_bytes(body, MAX_BODY)
        .await
        .map_err(|_| Error::Protocol("oversized upload-pack request".into()))?;

    let fetch = match protocol::classify(&body)? {
        Command::Fetch(fetch) => fetch,
        _ => return proxy::forward_parts(app, parts, Body::from(body)).await,
    };

    let fingerprint = fetch.fingerprint();
    tracing::debug!(
        %repo,
        %fingerprint,
        wants = fetch.wants.len(),
        haves = fetch.haves.len(),
        "fetch goes through the pack cache"
    );

    let auth = parts.headers.get(header::AUTHORIZATION).cloned();
    let produce_app = app.clone();
    let produce_repo = repo.clone();
    let (body, _len) = app
        .pack_cache
        .serve(&fingerprint, move |out, consumers| async move {
            produce_pack(produce_app, produce_repo, body, auth, out, consumers).await
        })
        .await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-git-upload-pack-result")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .context("assembling upload-pack response")
        .map_err(Error::from)
}

/// Build one pack: refresh the mirror, then run `git-upload-pack` into the
/// cache tempfile.
///
/// The mirror refresh runs to completion even if every client goes away
/// (the next fetch of the repo gets it for free); the pack build itself is
/// abandoned once nobody is reading.
async fn produce_pack(
    app: Arc<App>,
    repo: String,
    body: Bytes,
    auth: Option<HeaderValue>,
    out: tokio::fs::File,
    consumers: Consumers,
) -> Result<u64> {
    let mirror = app.mirrors.ensure_fresh(&repo, auth).await?;
    if consumers.gone() {
        return Err(Error::Canceled);
    }
    tokio::select! {
        written = app.git.upload_pack(mirror, body, out) => written,
        () = consumers.wait_gone() => Err(Error::Canceled),
    }
}
