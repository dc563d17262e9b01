use std::iter::once;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use clap::Parser;
use tokio::fs;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::request_id::{MakeRequestUuid, RequestId};
use tower_http::sensitive_headers::SetSensitiveRequestHeadersLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tower_http::ServiceBuilderExt;
use tracing::Span;

use crate::error::{Error, Result};
use crate::lfs;
use crate::lock::PathLocks;
use crate::mirror::Mirrors;
use crate::proxy;
use crate::store::ObjectStore;
use crate::upload_pack;

#[cfg(not(test))]
use crate::git::Git;
#[cfg(test)]
use crate::git::MockGit as Git;
use crate::APP_NAME;

/// Upload-pack and LFS-batch request bodies are spooled in memory up to this
/// many bytes; protocol-v2 fetch bodies are tiny, so the bound only guards
/// against abuse.
pub(crate) const MAX_BODY: usize = 64 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const PACK_PRODUCE_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const LFS_PRODUCE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const ENTRY_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A caching, coalescing Git HTTP reverse proxy.
///
/// Sits between many Git clients and one upstream Git server; identical
/// fetches are answered by a single locally-computed pack, LFS blobs are
/// downloaded once and verified, everything else passes through.
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Options {
    /// Base URL of the upstream Git server.
    #[arg(long, env = "GITSERVER_UPSTREAM")]
    upstream: String,

    /// Location of the cache (mirrors, packs, LFS blobs).
    #[arg(short = 'd', long, env = "WORKING_DIRECTORY", default_value = "/var/cache/git-cdn", name = "PATH")]
    cache_dir: PathBuf,

    /// Bind to port.
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Upstream connection pool size.
    #[arg(long, env = "MAX_CONNECTIONS", default_value = "32")]
    max_connections: usize,

    /// Pack cache size bound, in GiB.
    #[arg(long, env = "PACK_CACHE_SIZE_GB", default_value = "20")]
    pack_cache_size_gb: u64,

    /// Drop pack cache entries unused for this many days.
    #[arg(long, env = "PACK_CACHE_MAX_AGE_DAYS", default_value = "30")]
    pack_cache_max_age_days: u64,

    /// LFS cache size bound, in GiB.
    #[arg(long, env = "LFS_CACHE_SIZE_GB", default_value = "50")]
    lfs_cache_size_gb: u64,

    /// Mirror freshness window, in seconds. With 0, every pack build
    /// refreshes the mirror first; concurrent arrivals still share one
    /// refresh.
    #[arg(long, default_value = "0")]
    mirror_ttl_secs: u64,
}

pub(crate) struct Config {
    pub upstream: String,
    pub pack_cache_max_bytes: u64,
    pub pack_cache_max_age: Duration,
    pub lfs_cache_max_bytes: u64,
}

/// Everything the handlers share; hangs off the router as state.
pub(crate) struct App {
    pub config: Config,
    pub client: reqwest::Client,
    pub git: Arc<Git>,
    pub mirrors: Mirrors,
    pub pack_cache: ObjectStore,
    pub lfs_cache: ObjectStore,
}

pub async fn start(options: &Options) -> anyhow::Result<()> {
    let app = app(options, Git::default()).await?;

    let listener = TcpListener::bind(("0.0.0.0", options.port)).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn app(options: &Options, git: Git) -> anyhow::Result<Router> {
    let cache_dir = options.cache_dir.clone();
    for sub in ["git", "pack_cache", "lfs"] {
        fs::create_dir_all(cache_dir.join(sub))
            .await
            .with_context(|| format!("failed to create cache directory {:?}", cache_dir.join(sub)))?;
    }
    tracing::info!("Cache directory is {:?}", cache_dir);

    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(options.max_connections)
        .build()
        .context("failed to build upstream client")?;

    let upstream = options.upstream.trim_end_matches('/').to_owned();
    let locks = PathLocks::new();
    let git = Arc::new(git);

    let app = Arc::new(App {
        config: Config {
            upstream: upstream.clone(),
            pack_cache_max_bytes: options.pack_cache_size_gb << 30,
            pack_cache_max_age: Duration::from_secs(options.pack_cache_max_age_days * 24 * 60 * 60),
            lfs_cache_max_bytes: options.lfs_cache_size_gb << 30,
        },
        client,
        mirrors: Mirrors::new(
            cache_dir.join("git"),
            upstream,
            Duration::from_secs(options.mirror_ttl_secs),
            git.clone(),
            locks.clone(),
        ),
        pack_cache: ObjectStore::new(
            cache_dir.join("pack_cache"),
            locks.clone(),
            ENTRY_LOCK_TIMEOUT,
            PACK_PRODUCE_TIMEOUT,
        ),
        lfs_cache: ObjectStore::new(
            cache_dir.join("lfs"),
            locks,
            ENTRY_LOCK_TIMEOUT,
            LFS_PRODUCE_TIMEOUT,
        ),
        git,
    });

    tokio::spawn(sweeper(app.clone()));

    Ok(Router::new()
        .route("/*req", any(route))
        .with_state(app)
        .layer(
            ServiceBuilder::new()
                // WARN: Will *not* overwrite `x-request-id` if already present.
                .set_x_request_id(MakeRequestUuid)
                .layer(SetSensitiveRequestHeadersLayer::new(once(
                    header::AUTHORIZATION,
                )))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(|request: &Request<_>| {
                            let request_id = request
                                .extensions()
                                .get::<RequestId>()
                                .unwrap()
                                .header_value();
                            tracing::info_span!("request", ?request_id)
                        })
                        .on_request(|request: &Request<_>, _: &Span| {
                            tracing::info!(
                                headers = ?request.headers(),
                                "received {} {} {:?}",
                                request.method(),
                                request.uri(),
                                request.version(),
                            )
                        })
                        .on_response(|response: &Response<_>, latency: Duration, _: &Span| {
                            tracing::info!(
                                ?latency,
                                headers = ?response.headers(),
                                "done with status {}",
                                response.status(),
                            )
                        }),
                )
                .layer(RequestDecompressionLayer::new())
                .propagate_x_request_id()
                .layer(SetResponseHeaderLayer::overriding(
                    header::SERVER,
                    HeaderValue::from_static(APP_NAME),
                )),
        ))
}

/// Keep both caches within their bounds, forever. The first pass doubles as
/// the startup sweep of stale tempfiles.
async fn sweeper(app: Arc<App>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(err) = app
            .pack_cache
            .sweep(
                app.config.pack_cache_max_bytes,
                Some(app.config.pack_cache_max_age),
            )
            .await
        {
            tracing::warn!(%err, "pack cache sweep failed");
        }
        if let Err(err) = app.lfs_cache.sweep(app.config.lfs_cache_max_bytes, None).await {
            tracing::warn!(%err, "lfs cache sweep failed");
        }
    }
}

async fn route(State(app): State<Arc<App>>, request: Request) -> Result<Response> {
    let path = request.uri().path();

    if request.method() == Method::GET && path.ends_with("/info/refs") {
        // First contact of a fetch client: prompt for credentials up front,
        // everything after that forwards as-is.
        if request.uri().query() == Some("service=git-upload-pack")
            && !request.headers().contains_key(header::AUTHORIZATION)
        {
            return Err(Error::MissingAuth(HeaderValue::from_static(
                "Basic realm=\"GitCDN\"",
            )));
        }
        proxy::forward(&app, request).await
    } else if request.method() == Method::POST && path.ends_with("/git-upload-pack") {
        upload_pack::handle(&app, request).await
    } else if request.method() == Method::POST && path.ends_with("/info/lfs/objects/batch") {
        lfs::batch(&app, request).await
    } else if request.method() == Method::GET && path.contains("/gitlab-lfs/objects/") {
        lfs::object(&app, request).await
    } else {
        // receive-pack and anything else we don't understand: pass through
        // verbatim, never cache
        proxy::forward(&app, request).await
    }
}
