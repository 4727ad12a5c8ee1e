//! JSON wire protocol for chunk stream connections.
//!
//! Every frame is a JSON object tagged by a `type` field. Unknown extra fields
//! are ignored on read. Parsing fails closed: anything that is not a
//! well-formed client message becomes a [`Rejection`] carrying the best
//! request ID that could be recovered from the frame, so the session can
//! answer with a `CHUNK_ERROR` instead of dropping the connection.

use super::{
    error::Error,
    types::{
        ChunkCoordinates, ChunkData, GenerationConfig, GenerationTimings, PoolStats, RequestId,
        UNKNOWN_REQUEST_ID,
    },
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const CHUNK_REQUEST: &str = "CHUNK_REQUEST";
const CHUNK_CANCEL: &str = "CHUNK_CANCEL";

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Ask the server to generate one chunk.
    ChunkRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        coords: ChunkCoordinates,
        config: GenerationConfig,
    },
    /// Withdraw a pending request.
    ChunkCancel { request_id: RequestId },
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Sent once, immediately after the connection is established.
    ChunkStreamReady { stats: PoolStats },
    /// The request passed admission and was handed to the pool.
    ChunkAccepted {
        request_id: RequestId,
        queue_size: usize,
    },
    /// The request completed successfully.
    ChunkResult {
        request_id: RequestId,
        coords: ChunkCoordinates,
        chunk: ChunkData,
        timings: GenerationTimings,
    },
    /// The message or request failed.
    ChunkError { request_id: RequestId, error: String },
    /// The request was cancelled and will produce nothing else.
    ChunkCancelled { request_id: RequestId },
}

/// A client frame that could not be turned into a [`ClientMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// The `requestId` found in the frame, if any.
    pub request_id: Option<RequestId>,
    pub error: Error,
}

impl Rejection {
    pub const fn new(request_id: Option<RequestId>, error: Error) -> Self {
        Self { request_id, error }
    }

    /// Converts the rejection into the `CHUNK_ERROR` sent back to the client.
    pub fn into_message(self) -> ServerMessage {
        let request_id = self
            .request_id
            .unwrap_or_else(|| UNKNOWN_REQUEST_ID.to_string());
        ServerMessage::error(request_id, &self.error)
    }
}

impl ClientMessage {
    /// Parses and validates a text frame.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] when the frame is not JSON, has no `type`, has
    /// an unsupported `type`, does not match the shape of that type, or is a
    /// `CHUNK_REQUEST` with a `null` config.
    pub fn parse(text: &str) -> Result<Self, Rejection> {
        Self::from_value(serde_json::from_str(text).map_err(|e| {
            Rejection::new(
                None,
                Error::InvalidMessage {
                    reason: e.to_string(),
                },
            )
        })?)
    }

    /// Same as [`ClientMessage::parse`] for raw bytes (binary frames).
    ///
    /// # Errors
    ///
    /// See [`ClientMessage::parse`].
    pub fn parse_slice(bytes: &[u8]) -> Result<Self, Rejection> {
        Self::from_value(serde_json::from_slice(bytes).map_err(|e| {
            Rejection::new(
                None,
                Error::InvalidMessage {
                    reason: e.to_string(),
                },
            )
        })?)
    }

    fn from_value(value: Value) -> Result<Self, Rejection> {
        let request_id = value
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_owned);

        match value.get("type").and_then(Value::as_str) {
            Some(CHUNK_REQUEST | CHUNK_CANCEL) => {}
            Some(other) => {
                return Err(Rejection::new(
                    request_id,
                    Error::UnknownMessageType {
                        kind: other.to_string(),
                    },
                ));
            }
            None => {
                return Err(Rejection::new(
                    request_id,
                    Error::InvalidMessage {
                        reason: "missing string field `type`".to_string(),
                    },
                ));
            }
        }

        let message: Self = serde_json::from_value(value).map_err(|e| {
            Rejection::new(
                request_id.clone(),
                Error::InvalidMessage {
                    reason: e.to_string(),
                },
            )
        })?;

        if let Self::ChunkRequest { config, .. } = &message {
            if config.is_null() {
                return Err(Rejection::new(
                    request_id,
                    Error::InvalidMessage {
                        reason: "`config` must not be null".to_string(),
                    },
                ));
            }
        }

        Ok(message)
    }
}

impl ServerMessage {
    pub fn error(request_id: impl Into<RequestId>, error: &Error) -> Self {
        Self::ChunkError {
            request_id: request_id.into(),
            error: error.to_string(),
        }
    }

    /// The request this message refers to, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::ChunkStreamReady { .. } => None,
            Self::ChunkAccepted { request_id, .. }
            | Self::ChunkResult { request_id, .. }
            | Self::ChunkError { request_id, .. }
            | Self::ChunkCancelled { request_id } => Some(request_id),
        }
    }
}
