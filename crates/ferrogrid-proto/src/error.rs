//! Error types for protocol operations

use thiserror::Error;
use crate::message::{ErrorCode, ErrorDetails};

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid frame format
    #[error("Invalid frame format")]
    InvalidFrame,

    /// Frame too large
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// I/O failure on the underlying connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection is closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// No response arrived in time
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    Timeout {
        /// Request that timed out
        request_id: uuid::Uuid,
        /// Timeout that was exceeded
        timeout_ms: u64,
    },

    /// The remote peer answered with an error response
    #[error("Remote error ({:?}): {}", .0.code, .0.message)]
    Remote(ErrorDetails),

    /// The remote peer answered with a response of the wrong kind
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Invalid selection pattern
    #[error("Invalid selection pattern: {0}")]
    InvalidPattern(String),
}

impl From<ProtocolError> for ErrorDetails {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::Serialization(msg) => ErrorDetails::new(ErrorCode::InvalidRequest, msg),
            ProtocolError::InvalidFrame => ErrorDetails::new(ErrorCode::InvalidRequest, "Invalid frame format"),
            ProtocolError::FrameTooLarge { size, max } => ErrorDetails::new(
                ErrorCode::ResourceExhausted,
                format!("Frame too large: {} bytes (max: {})", size, max),
            ),
            ProtocolError::Timeout { timeout_ms, .. } => ErrorDetails::new(
                ErrorCode::Timeout,
                format!("Timed out after {}ms", timeout_ms),
            ),
            ProtocolError::Remote(details) => details,
            ProtocolError::InvalidPattern(pattern) => ErrorDetails::new(
                ErrorCode::InvalidRequest,
                format!("Invalid selection pattern: {}", pattern),
            ),
            other => ErrorDetails::new(ErrorCode::InternalError, other.to_string()),
        }
    }
}
