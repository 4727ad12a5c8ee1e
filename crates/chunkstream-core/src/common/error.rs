//! Error types for the chunk generation stream.
//!
//! This module defines the central `Error` enum, which captures every
//! recoverable and reportable failure of a chunk request. None of these are
//! fatal: each one is turned into a `CHUNK_ERROR` message for the request it
//! belongs to, and the connection (and the shared worker pool) keeps running.
//!
//! ## Error Cases
//! - `InvalidMessage`: The inbound frame was not valid JSON or had the wrong
//!   shape.
//! - `UnknownMessageType`: The frame carried a `type` the server does not
//!   handle.
//! - `TooManyInflight`: The connection is at its in-flight admission limit.
//! - `DuplicateRequest`: A client-supplied ID is already pending.
//! - `RequestNotFound`: A cancel referenced an ID that is not pending.
//! - `PoolSaturated`: The shared queue is at its ceiling.
//! - `Generation`: The generation function failed.
//! - `GenerationTimeout`: The generation function exceeded the configured
//!   timeout.
//! - `ServiceShutdown`: A request arrived while the pool was shutting down.

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the chunk generation stream.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The client message could not be parsed or failed validation.
    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    /// The client message carried an unsupported `type`.
    #[error("Unknown message type: {kind}")]
    UnknownMessageType { kind: String },

    /// The connection already has `limit` requests in flight.
    #[error("Too many in-flight requests (limit {limit})")]
    TooManyInflight { limit: usize },

    /// A request with the same ID is still pending on this connection.
    #[error("Request {request_id} is already in flight")]
    DuplicateRequest { request_id: String },

    /// Cancel for a request that already settled or never existed.
    #[error("Request {request_id} not found")]
    RequestNotFound { request_id: String },

    /// The pool-wide queue is full.
    #[error("Pool saturated ({capacity} requests queued)")]
    PoolSaturated { capacity: usize },

    /// The generation function returned an error or panicked.
    #[error("Generation failed: {0}")]
    Generation(String),

    /// The generation function did not return within the configured timeout.
    #[error("Generation timed out after {timeout_ms}ms")]
    GenerationTimeout { timeout_ms: u64 },

    /// The pool is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    /// Builds a generation failure from any displayable error, keeping the
    /// full `anyhow`-style context chain when the alternate flag renders it.
    pub fn generation(err: impl core::fmt::Display) -> Self {
        Self::Generation(format!("{err:#}"))
    }

    /// Returns `true` for outcomes that are expected under load and should not
    /// be logged above `debug`.
    pub const fn is_admission(&self) -> bool {
        matches!(
            self,
            Self::TooManyInflight { .. } | Self::PoolSaturated { .. } | Self::DuplicateRequest { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_the_wire_text() {
        assert_eq!(
            Error::TooManyInflight { limit: 64 }.to_string(),
            "Too many in-flight requests (limit 64)"
        );
        assert_eq!(
            Error::RequestNotFound {
                request_id: "abc".to_string()
            }
            .to_string(),
            "Request abc not found"
        );
        assert_eq!(
            Error::PoolSaturated { capacity: 8 }.to_string(),
            "Pool saturated (8 requests queued)"
        );
    }

    #[test]
    fn generation_keeps_message() {
        let err = Error::generation("invalid config: seed missing");
        assert_eq!(
            err.to_string(),
            "Generation failed: invalid config: seed missing"
        );
    }

    #[test]
    fn admission_errors_are_classified() {
        assert!(Error::TooManyInflight { limit: 1 }.is_admission());
        assert!(Error::PoolSaturated { capacity: 1 }.is_admission());
        assert!(!Error::ServiceShutdown.is_admission());
        assert!(!Error::Generation("boom".to_string()).is_admission());
    }
}
