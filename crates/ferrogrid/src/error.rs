//! Error types for the grid controller

use ferrogrid_proto::{FileVersionId, ProtocolError};
use std::time::Duration;
use thiserror::Error;

/// Token selection failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    /// No registered token satisfies the requester's interests
    #[error("No agent token matches the selection criteria")]
    NoMatchingToken,

    /// Matching tokens exist but all of them are reserved
    #[error("All agent tokens matching the selection criteria are reserved")]
    AllMatchingReserved,

    /// The token is not registered
    #[error("Unknown agent token '{0}'")]
    UnknownToken(String),
}

/// Main error type for grid operations
#[derive(Debug, Error)]
pub enum GridError {
    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Token selection failed
    #[error(transparent)]
    Selection(#[from] SelectionError),

    /// A file was requested that is not registered under that version
    #[error("File {0} is not registered")]
    FileNotFound(FileVersionId),

    /// The agent hosting a token is not connected
    #[error("Agent '{0}' is not connected")]
    AgentUnavailable(String),

    /// Reserving or releasing a token on its agent timed out
    #[error("Timeout after {}ms while {action} the agent token. You can increase the timeout by setting token_reservation_timeout_ms in the grid configuration", .timeout.as_millis())]
    Timeout {
        /// What was being done, e.g. `reserving`
        action: &'static str,
        /// Timeout that was exceeded
        timeout: Duration,
    },

    /// Reserving or releasing a token on its agent failed
    #[error("Communication error between the controller and the agent while {action} the agent token")]
    Communication {
        /// What was being done, e.g. `releasing`
        action: &'static str,
        /// Cause
        #[source]
        source: ProtocolError,
    },

    /// The in-process agent running local tokens could not be started
    #[error("Local agent error: {0}")]
    LocalAgent(String),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GridError {
    /// Classify the failure of a reserve or release request
    pub(crate) fn token_request(action: &'static str, error: ProtocolError) -> Self {
        match error {
            ProtocolError::Timeout { timeout_ms, .. } => Self::Timeout {
                action,
                timeout: Duration::from_millis(timeout_ms),
            },
            source => Self::Communication { action, source },
        }
    }
}
