use anyhow::Context;
use axum::body::Body;
use axum::extract::Request;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderName};
use axum::response::Response;

use crate::error::{Error, Result};
use crate::server::App;

/// Hop-by-hop headers (RFC 9110 §7.6.1), never forwarded in either
/// direction.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Stream a request upstream verbatim and the upstream response back.
///
/// `X-Forwarded-For` and friends are the front proxy's business and pass
/// through like any end-to-end header; `Host` becomes the upstream
/// authority.
pub async fn forward(app: &App, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();
    forward_parts(app, parts, body).await
}

pub async fn forward_parts(app: &App, parts: Parts, body: Body) -> Result<Response> {
    let mut url = format!("{}{}", app.config.upstream, parts.uri.path());
    if let Some(query) = parts.uri.query() {
        url.push('?');
        url.push_str(query);
    }
    tracing::debug!(method = %parts.method, %url, "proxying to upstream");

    let upstream = app
        .client
        .request(parts.method, &url)
        .headers(request_headers(&parts.headers))
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await?;

    let mut response = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if !drop_header(name) {
            response = response.header(name, value);
        }
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .context("assembling proxied response")
        .map_err(Error::from)
}

/// Request headers to forward upstream. `Host` is replaced by the upstream
/// authority and `Content-Length` by the streamed body's framing.
pub fn request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if drop_header(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        forwarded.append(name, value.clone());
    }
    forwarded
}

pub fn drop_header(name: &HeaderName) -> bool {
    HOP_BY_HOP.iter().any(|hop| hop == name)
}
