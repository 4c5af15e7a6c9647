//! Service-specific error types

use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Startup errors: configuration and transport setup.
///
/// Every variant is fatal. `main` wraps them with context and exits non-zero;
/// none of them can occur once the server is accepting requests.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("client certificate verifier: {0}")]
    ClientVerifier(String),

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;

/// Request-time failures that are real server errors.
///
/// Simulated failures (`/retry` 502s, `/timeout` 503s) are regular responses
/// and never pass through this type.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("header echo serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        match self {
            HandlerError::Serialization(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "header echo serialization failed\n",
            )
                .into_response(),
        }
    }
}
