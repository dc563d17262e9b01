use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::proxy;
use crate::server::{App, MAX_BODY};
use crate::store::Consumers;

pub const LFS_CONTENT_TYPE: &str = "application/vnd.git-lfs+json";

/// Subset of the LFS batch response the rewriter touches. Everything else,
/// object fields and action fields alike, rides along in the flattened maps
/// so the rewrite never drops what upstream sent.
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchResponse {
    pub objects: Vec<BatchObject>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchObject {
    pub oid: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<Actions>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Actions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload: Option<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify: Option<Action>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Action {
    pub href: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub header: HashMap<String, String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    operation: &'a str,
    transfers: &'a [&'a str],
    objects: &'a [BatchRequestObject<'a>],
}

#[derive(Debug, Serialize)]
struct BatchRequestObject<'a> {
    oid: &'a str,
    size: u64,
}

/// `POST /<repo>/info/lfs/objects/batch`: proxy to upstream, then point
/// every download href back at this server so the blobs flow through the
/// cache.
pub async fn batch(app: &Arc<App>, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let repo = parts
        .uri
        .path()
        .strip_suffix("/info/lfs/objects/batch")
        .ok_or(Error::NotFound)?
        .to_owned();

    let body = axum::body::to_bytes(body, MAX_BODY)
        .await
        .map_err(|_| Error::Protocol("oversized LFS batch request".into()))?;

    let url = format!("{}{}", app.config.upstream, parts.uri.path());
    let upstream = app
        .client
        .post(&url)
        .headers(proxy::request_headers(&parts.headers))
        .body(body)
        .send()
        .await?;

    let status = upstream.status();
    if !status.is_success() {
        // pass upstream rejections (auth, missing repo, ...) through verbatim
        let mut response = Response::builder().status(status);
        for (name, value) in upstream.headers() {
            if !proxy::drop_header(name) {
                response = response.header(name, value);
            }
        }
        return response
            .body(Body::from_stream(upstream.bytes_stream()))
            .context("assembling batch error response")
            .map_err(Error::from);
    }

    let mut payload: BatchResponse = upstream.json().await?;
    rewrite_batch(&mut payload, &external_base(&parts.headers), &repo);

    let body = serde_json::to_vec(&payload).context("serializing batch response")?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, LFS_CONTENT_TYPE)
        .body(Body::from(body))
        .context("assembling batch response")
        .map_err(Error::from)
}

/// Point each object's download action at this server. Only the href
/// changes; oid, size, headers and expiry ride through untouched.
fn rewrite_batch(payload: &mut BatchResponse, base: &str, repo: &str) {
    for object in &mut payload.objects {
        if let Some(download) = object.actions.as_mut().and_then(|a| a.download.as_mut()) {
            download.href = format!("{base}{repo}/gitlab-lfs/objects/{}", object.oid);
        }
    }
}

/// External base URL as seen by the client, from the front proxy's headers.
fn external_base(headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{scheme}://{host}")
}

/// `GET /<repo>/gitlab-lfs/objects/<oid>`: serve from the blob cache,
/// downloading and verifying on first use.
pub async fn object(app: &Arc<App>, request: Request) -> Result<Response> {
    let path = request.uri().path();
    let (repo, oid) = path
        .split_once("/gitlab-lfs/objects/")
        .ok_or(Error::NotFound)?;
    let (repo, oid) = (repo.to_owned(), oid.to_owned());
    if !valid_oid(&oid) {
        return Err(Error::NotFound);
    }

    let auth = request.headers().get(header::AUTHORIZATION).cloned();

    let produce_app = app.clone();
    let produce_oid = oid.clone();
    let (body, len) = app
        .lfs_cache
        .serve(&oid, move |out, consumers| async move {
            download(produce_app, repo, produce_oid, auth, out, consumers).await
        })
        .await?;

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream");
    if let Some(len) = len {
        response = response.header(header::CONTENT_LENGTH, len);
    }
    response
        .body(body)
        .context("assembling object response")
        .map_err(Error::from)
}

fn valid_oid(oid: &str) -> bool {
    oid.len() == 64 && oid.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Fetch one object from upstream into the cache tempfile, verifying hash
/// and size before the entry is committed. Entries already on disk are
/// trusted; verification happens at install time only.
async fn download(
    app: Arc<App>,
    repo: String,
    oid: String,
    auth: Option<HeaderValue>,
    mut out: tokio::fs::File,
    consumers: Consumers,
) -> Result<u64> {
    let (action, size) = locate(&app, &repo, &oid, auth).await?;

    let mut request = app.client.get(&action.href);
    for (name, value) in &action.header {
        request = request.header(name, value);
    }
    let mut upstream = request.send().await?;
    if !upstream.status().is_success() {
        return Err(Error::Upstream {
            status: Some(upstream.status()),
            message: format!("download of {oid} failed"),
        });
    }

    let mut hasher = Sha256::new();
    let mut written: u64 = 0;
    while let Some(chunk) = upstream.chunk().await? {
        if consumers.gone() {
            return Err(Error::Canceled);
        }
        hasher.update(&chunk);
        out.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    out.flush().await?;

    let digest = hex::encode(hasher.finalize());
    if digest != oid || written != size {
        tracing::error!(%oid, %digest, written, size, "rejecting corrupt download");
        return Err(Error::Checksum { oid });
    }
    Ok(written)
}

/// Re-derive the upstream download action for one oid with a single-object
/// batch request. No href state survives between requests, so any worker
/// can serve any blob GET.
async fn locate(
    app: &App,
    repo: &str,
    oid: &str,
    auth: Option<HeaderValue>,
) -> Result<(Action, u64)> {
    let url = format!("{}{}/info/lfs/objects/batch", app.config.upstream, repo);
    let request = BatchRequest {
        operation: "download",
        transfers: &["basic"],
        // the true size is unknown at GET time; upstream answers with it
        objects: &[BatchRequestObject { oid, size: 0 }],
    };

    let mut post = app
        .client
        .post(&url)
        .header(header::CONTENT_TYPE, LFS_CONTENT_TYPE)
        .header(header::ACCEPT, LFS_CONTENT_TYPE)
        .json(&request);
    if let Some(auth) = auth {
        post = post.header(header::AUTHORIZATION, auth);
    }

    let response = post.send().await?;
    if !response.status().is_success() {
        return Err(Error::Upstream {
            status: Some(response.status()),
            message: format!("batch lookup for {oid} failed"),
        });
    }
    let payload: BatchResponse = response.json().await?;

    let object = payload
        .objects
        .into_iter()
        .find(|object| object.oid == oid)
        .ok_or_else(|| Error::upstream(format!("upstream batch response missing {oid}")))?;
    let size = object.size;
    let action = object
        .actions
        .and_then(|actions| actions.download)
        .ok_or_else(|| Error::upstream(format!("no download action offered for {oid}")))?;
    Ok((action, size))
}
