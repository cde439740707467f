//! Controller-specific error types.
//!
//! Transport failures come from the API server client; everything else here
//! describes what the controller found in (or failed to do with) the data.

use crate::state::ResourceVersion;
use apiserver_client::ApiServerError;
use thiserror::Error;

/// Errors that can occur in the Function Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// API server transport error (connect, TLS, non-success status, IO)
    #[error("API server error: {0}")]
    ApiServer(#[from] ApiServerError),

    /// A list body or watch frame could not be decoded
    #[error("Decode error: {message} (payload: {payload})")]
    Decode {
        /// What failed to decode
        message: String,
        /// The offending raw payload, truncated
        payload: String,
    },

    /// The API server reported a condition other than an expired cursor
    #[error("Unexpected status from API server ({code}): {message}")]
    Protocol {
        /// Status code from the status object
        code: u16,
        /// Status message
        message: String,
    },

    /// The watch cursor is too old; a full resync is required
    #[error("Resource version {cursor} is outdated in the API server: {message}")]
    CursorExpired {
        /// Cursor the session was at when the server rejected it
        cursor: ResourceVersion,
        /// Status message
        message: String,
    },

    /// Starting or stopping the worker for one function failed
    #[error("Worker operation failed for function {name}: {message}")]
    WorkerOp {
        /// Function name
        name: String,
        /// Failure description
        message: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Local IO error (config files, probe listener)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Longest payload kept in a decode error.
const PAYLOAD_LIMIT: usize = 500;

impl ControllerError {
    /// Builds a [`ControllerError::Decode`], truncating the payload.
    pub fn decode(message: impl Into<String>, payload: &str) -> Self {
        Self::Decode {
            message: message.into(),
            payload: payload.chars().take(PAYLOAD_LIMIT).collect(),
        }
    }

    /// Whether a full list-and-resync recovers from this error.
    #[must_use]
    pub fn is_cursor_expired(&self) -> bool {
        matches!(self, Self::CursorExpired { .. })
    }
}
