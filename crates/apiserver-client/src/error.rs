//! API server client errors

use thiserror::Error;

/// Errors that can occur when talking to the Kubernetes API server
#[derive(Debug, Error)]
pub enum ApiServerError {
    /// HTTP request/response error (connection refused, TLS, reset, ...)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API server answered with a non-success status
    #[error("API server returned {status}: {body}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body, truncated
        body: String,
    },

    /// The object being created already exists (HTTP 409)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// IO error while reading a response body
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Client could not be configured (bad URL, bad CA bundle, ...)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ApiServerError {
    /// Whether the error means the object is already present on the server.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}
