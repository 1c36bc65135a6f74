//! Error types for luci-client.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum LuciError {
    /// I/O error on the socket or on a disk-backed attachment.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Header text is not valid JSON or does not fit the expected shape.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame corruption (negative lengths, oversized header, bad position, ...).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The stream ended in the middle of a frame field.
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: u64, actual: u64 },

    /// An attachment's bytes do not hash to the checksum claimed in the header.
    #[error("Checksum mismatch: header claims {claimed}, data hashes to {actual}")]
    ChecksumMismatch { claimed: String, actual: String },

    /// The peer closed the connection at a frame boundary.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A request did not reach a terminal state in time.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The spawned receive task failed to complete.
    #[error("Receive task failed: {0}")]
    TaskFailed(String),

    /// The server answered with an `error` state.
    #[error("Server error: {0}")]
    Server(String),

    /// A message carried none of the recognized state keys.
    #[error("Invalid message state")]
    InvalidState,
}

impl LuciError {
    /// True for failures of the connection itself; the connection must not be reused.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            LuciError::Io(_)
                | LuciError::ConnectionClosed
                | LuciError::Truncated { .. }
                | LuciError::Timeout(_)
                | LuciError::TaskFailed(_)
        )
    }

    /// True when attachment data failed checksum verification.
    pub fn is_integrity(&self) -> bool {
        matches!(self, LuciError::ChecksumMismatch { .. })
    }
}

/// Result type alias using LuciError.
pub type Result<T> = std::result::Result<T, LuciError>;
