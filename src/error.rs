use std::path::PathBuf;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::IntoResponse;

pub type Result<T> = std::result::Result<T, Error>;

/// Server errors.
///
/// These errors are for our benefit only, the client just gets a status code
/// (plus a `WWW-Authenticate` header for the auth challenge and `Retry-After`
/// for lock contention).
///
/// Anything that doesn't fit one of the specific conditions below is type
/// erased into `Other` and reported as an internal server error. Server-wide
/// non-recoverable errors are modelled with panics, and we build with
/// `panic = "abort"`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not found")]
    NotFound,
    #[error("not authenticated/authorized")]
    MissingAuth(HeaderValue),
    #[error("malformed git request: {0}")]
    Protocol(String),
    #[error("upstream failure: {message}")]
    Upstream {
        status: Option<StatusCode>,
        message: String,
    },
    #[error("git subprocess failed: {0}")]
    Subprocess(String),
    #[error("content of {oid} does not match its advertised hash or size")]
    Checksum { oid: String },
    #[error("timed out waiting for lock on {0:?}")]
    LockTimeout(PathBuf),
    #[error("client went away")]
    Canceled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn upstream(message: impl Into<String>) -> Self {
        Error::Upstream {
            status: None,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Other(err.into())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Upstream {
            status: err.status(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        match self {
            Error::NotFound => StatusCode::NOT_FOUND.into_response(),
            Error::MissingAuth(authenticate) => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, authenticate)],
            )
                .into_response(),
            Error::Protocol(reason) => {
                tracing::debug!(%reason, "rejecting malformed request");
                (StatusCode::BAD_REQUEST, "malformed git request").into_response()
            }
            Error::Upstream { status, message } => {
                tracing::warn!(?status, %message, "upstream failure");
                status.unwrap_or(StatusCode::BAD_GATEWAY).into_response()
            }
            Error::Subprocess(reason) => {
                tracing::error!(%reason, "git subprocess failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
            Error::Checksum { oid } => {
                tracing::error!(%oid, "checksum mismatch");
                StatusCode::BAD_GATEWAY.into_response()
            }
            Error::LockTimeout(path) => {
                tracing::warn!(?path, "lock acquisition timed out");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    [(header::RETRY_AFTER, HeaderValue::from_static("5"))],
                )
                    .into_response()
            }
            Error::Canceled => {
                // Not an error: the response stream is already gone, nobody
                // will see this status.
                tracing::debug!("client went away");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
            Error::Other(err) => {
                tracing::error!(error = format_args!("{:#?}", err), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "sorry, something went terribly wrong here",
                )
                    .into_response()
            }
        }
    }
}
