//! Watch stream decoding.
//!
//! The API server sends one JSON envelope per line:
//! `{"type": "ADDED" | "MODIFIED" | "DELETED" | "ERROR", "object": {...}}`.
//! `ERROR` envelopes carry a status object; everything else carries a
//! `Function`.

use crate::error::ControllerError;
use crate::state::ResourceVersion;
use apiserver_client::ApiServerError;
use crds::Function;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Status code the API server uses when a watch cursor is too old (HTTP Gone).
pub const CURSOR_EXPIRED_CODE: u16 = 410;

/// Raw envelope before the object is interpreted.
#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    object: serde_json::Value,
}

/// Status object carried by `ERROR` envelopes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Status {
    /// HTTP-like status code
    #[serde(default)]
    pub code: u16,
    /// Human readable message
    #[serde(default)]
    pub message: String,
    /// Machine readable reason (`Expired`, `Gone`, ...)
    #[serde(default)]
    pub reason: Option<String>,
}

/// A change to one function, in server order.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// Function created (or first seen)
    Added(Function),
    /// Function spec or metadata changed
    Modified(Function),
    /// Function removed
    Deleted(Function),
}

impl WatchEvent {
    /// The function carried by the event.
    #[must_use]
    pub fn function(&self) -> &Function {
        match self {
            Self::Added(function) | Self::Modified(function) | Self::Deleted(function) => function,
        }
    }

    /// Function name. Always present: the decoder rejects objects without one.
    #[must_use]
    pub fn name(&self) -> &str {
        self.function().metadata.name.as_deref().unwrap_or_default()
    }

    /// Resource version assigned to this change.
    #[must_use]
    pub fn resource_version(&self) -> ResourceVersion {
        ResourceVersion::new(
            self.function()
                .metadata
                .resource_version
                .clone()
                .unwrap_or_default(),
        )
    }

    /// Wire name of the event type.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "ADDED",
            Self::Modified(_) => "MODIFIED",
            Self::Deleted(_) => "DELETED",
        }
    }
}

/// Result of decoding one frame.
#[derive(Debug)]
pub enum Decoded {
    /// A function event
    Event(WatchEvent),
    /// The server closed the stream at a frame boundary; reconnect
    StreamEnded,
    /// The server says the cursor is too old; resync
    CursorExpired(Status),
}

/// Reads frames one at a time from a watch body.
#[derive(Debug)]
pub struct EventDecoder<R> {
    reader: R,
    line: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> EventDecoder<R> {
    /// Decoder over a buffered watch body.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::new(),
        }
    }

    /// Decode the next frame, skipping blank keep-alive lines.
    ///
    /// IO failures while reading surface as transport errors, except invalid
    /// UTF-8 which is a decode error.
    pub async fn decode_next(&mut self) -> Result<Decoded, ControllerError> {
        loop {
            self.line.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.line)
                .await
                .map_err(|e| ControllerError::ApiServer(ApiServerError::Io(e)))?;
            if read == 0 {
                return Ok(Decoded::StreamEnded);
            }

            let frame = match std::str::from_utf8(&self.line) {
                Ok(frame) => frame.trim(),
                Err(e) => {
                    return Err(ControllerError::decode(
                        format!("watch frame is not UTF-8: {e}"),
                        String::from_utf8_lossy(&self.line).trim(),
                    ));
                }
            };
            if frame.is_empty() {
                continue;
            }
            return decode_frame(frame);
        }
    }
}

/// Decode a single envelope.
pub fn decode_frame(frame: &str) -> Result<Decoded, ControllerError> {
    let raw: RawEvent = serde_json::from_str(frame).map_err(|e| {
        ControllerError::decode(format!("failed to decode raw event from API server: {e}"), frame)
    })?;

    if raw.event_type == "ERROR" {
        let status: Status = serde_json::from_value(raw.object).map_err(|e| {
            ControllerError::decode(format!("failed to decode status object: {e}"), frame)
        })?;
        if status.code == CURSOR_EXPIRED_CODE {
            return Ok(Decoded::CursorExpired(status));
        }
        return Err(ControllerError::Protocol {
            code: status.code,
            message: status.message,
        });
    }

    let wrap: fn(Function) -> WatchEvent = match raw.event_type.as_str() {
        "ADDED" => WatchEvent::Added,
        "MODIFIED" => WatchEvent::Modified,
        "DELETED" => WatchEvent::Deleted,
        other => {
            return Err(ControllerError::decode(
                format!("unknown watch event type {other:?}"),
                frame,
            ));
        }
    };

    let function: Function = serde_json::from_value(raw.object).map_err(|e| {
        ControllerError::decode(format!("failed to decode Function object: {e}"), frame)
    })?;
    if function.metadata.name.as_deref().is_none_or(str::is_empty) {
        return Err(ControllerError::decode("Function object has no metadata.name", frame));
    }
    if function.metadata.resource_version.as_deref().is_none_or(str::is_empty) {
        return Err(ControllerError::decode(
            "Function object has no metadata.resourceVersion",
            frame,
        ));
    }

    Ok(Decoded::Event(wrap(function)))
}
