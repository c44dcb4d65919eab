//! Error types for the agent

use ferrogrid_proto::{AgentError, AgentErrorCode, Attachment, FileVersionId, OutputMessage};
use ferrogrid_wasm::WasmError;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration is not valid YAML for [`crate::AgentConf`]
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Token pool errors.
///
/// `AlreadyReserved` and `NotReserved` indicate a broken caller invariant
/// rather than a race: reservation is adjudicated by the grid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenPoolError {
    /// Unknown token id
    #[error("No token found with id '{0}'")]
    NotFound(String),

    /// `get` on a token that is already reserved
    #[error("Token '{0}' is already reserved")]
    AlreadyReserved(String),

    /// `return` on a token that is not reserved
    #[error("Token '{0}' is not reserved")]
    NotReserved(String),
}

impl TokenPoolError {
    /// Wire classification of this error
    pub fn agent_error(&self) -> AgentError {
        match self {
            Self::NotFound(_) => AgentError::new(AgentErrorCode::TokenNotFound),
            _ => AgentError::new(AgentErrorCode::Unexpected),
        }
    }
}

/// File cache errors
#[derive(Debug, Error)]
pub enum FileCacheError {
    /// The download did not complete in time
    #[error("Timeout after {timeout_ms}ms while downloading file {file}")]
    Timeout {
        /// Requested file
        file: FileVersionId,
        /// Timeout that was exceeded
        timeout_ms: u64,
    },

    /// The download failed
    #[error("Error while downloading file {file}: {message}")]
    Download {
        /// Requested file
        file: FileVersionId,
        /// Cause
        message: String,
    },

    /// An id or version cannot be used as a path segment
    #[error("Invalid file id or version: {0}")]
    InvalidId(String),

    /// The on-disk layout of a file id is inconsistent
    #[error("Inconsistent cache entry for file '{file_id}': {message}")]
    Inconsistent {
        /// Affected file id
        file_id: String,
        /// What is wrong
        message: String,
    },

    /// Local I/O failure
    #[error("File cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FileCacheError {
    /// Wire classification of this error
    pub fn agent_error(&self) -> AgentError {
        match self {
            Self::Timeout { file, timeout_ms } => {
                AgentError::new(AgentErrorCode::ContextBuilderFileDownloadTimeout)
                    .with_detail(AgentError::DETAIL_TIMEOUT, timeout_ms.to_string())
                    .with_detail(AgentError::DETAIL_FILE_ID, file.file_id.clone())
                    .with_detail(AgentError::DETAIL_FILE_VERSION, file.version.clone())
            }
            Self::Download { file, .. } => {
                AgentError::new(AgentErrorCode::ContextBuilderFileDownloadError)
                    .with_detail(AgentError::DETAIL_FILE_ID, file.file_id.clone())
                    .with_detail(AgentError::DETAIL_FILE_VERSION, file.version.clone())
            }
            _ => AgentError::new(AgentErrorCode::ContextBuilder),
        }
    }
}

/// Errors building a context scope
#[derive(Debug, Error)]
pub enum ContextError {
    /// The bundle could not be obtained
    #[error(transparent)]
    FileCache(#[from] FileCacheError),

    /// A module of the bundle could not be loaded
    #[error("Failed to load '{path}': {source}")]
    Module {
        /// Offending file
        path: String,
        /// Cause
        #[source]
        source: WasmError,
    },

    /// The bundle content is not usable
    #[error("Invalid bundle '{key}': {message}")]
    InvalidBundle {
        /// Scope key
        key: String,
        /// What is wrong
        message: String,
    },

    /// Local I/O failure while scanning a bundle
    #[error("I/O error while building context: {0}")]
    Io(#[from] std::io::Error),
}

impl ContextError {
    /// Wire classification of this error
    pub fn agent_error(&self) -> AgentError {
        match self {
            Self::FileCache(e) => e.agent_error(),
            _ => AgentError::new(AgentErrorCode::ContextBuilder),
        }
    }
}

/// Failures of a dispatch that are reported with a structured [`AgentError`]
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The token could not be reserved
    #[error(transparent)]
    Token(#[from] TokenPoolError),

    /// The handler's scopes could not be built
    #[error("Error while building the execution context: {0}")]
    Context(#[from] ContextError),

    /// The call timed out and the handler stopped when asked to
    #[error("Timeout while processing request. Request execution interrupted successfully.")]
    TimeoutInterrupted {
        /// Call timeout
        timeout_ms: u64,
        /// Description of the execution when it was interrupted
        state: String,
    },

    /// The call timed out and the handler kept running
    #[error("Timeout while processing request. WARNING: Request execution couldn't be interrupted. Subsequent calls to that token may fail!")]
    TimeoutNotInterrupted {
        /// Call timeout
        timeout_ms: u64,
        /// Description of the execution when it was interrupted
        state: String,
    },

    /// The dispatch itself failed
    #[error("{message}")]
    Unexpected {
        /// Message including the agent and function
        message: String,
        /// Detailed description attached as `exception.log`
        details: String,
    },
}

impl DispatchError {
    /// Name of the attachment describing a timed-out execution
    pub const INTERRUPTION_ATTACHMENT: &'static str = "stacktrace_before_interruption.log";

    /// Wire classification of this error
    pub fn agent_error(&self) -> AgentError {
        match self {
            Self::Token(e) => e.agent_error(),
            Self::Context(e) => e.agent_error(),
            Self::TimeoutInterrupted { timeout_ms, .. } => AgentError::new(AgentErrorCode::TimeoutRequestInterrupted)
                .with_detail(AgentError::DETAIL_TIMEOUT, timeout_ms.to_string()),
            Self::TimeoutNotInterrupted { timeout_ms, .. } => {
                AgentError::new(AgentErrorCode::TimeoutRequestNotInterrupted)
                    .with_detail(AgentError::DETAIL_TIMEOUT, timeout_ms.to_string())
            }
            Self::Unexpected { .. } => AgentError::new(AgentErrorCode::Unexpected),
        }
    }

    /// Error output carrying this failure
    pub fn into_output(self) -> OutputMessage {
        let mut output = OutputMessage::agent_error(self.to_string(), self.agent_error());
        match self {
            Self::Token(_) => {}
            Self::Context(e) => output.add_attachment(Attachment::text(Attachment::EXCEPTION_LOG, &format!("{:?}", e))),
            Self::TimeoutInterrupted { state, .. } | Self::TimeoutNotInterrupted { state, .. } => {
                output.add_attachment(Attachment::text(Self::INTERRUPTION_ATTACHMENT, &state))
            }
            Self::Unexpected { details, .. } => {
                output.add_attachment(Attachment::text(Attachment::EXCEPTION_LOG, &details))
            }
        }
        output
    }
}

/// Handler resolution errors. All of them are configuration errors that a
/// retry cannot fix.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No scope of the active context defines the handler
    #[error("Handler '{0}' not found")]
    NotFound(String),

    /// The handler constructor or its initialisation failed
    #[error("Failed to instantiate handler '{name}': {message}")]
    Instantiation {
        /// Handler name
        name: String,
        /// Cause
        message: String,
    },

    /// The definition does not implement the handler interface
    #[error("'{name}' is not a message handler: {message}")]
    NotAHandler {
        /// Handler name
        name: String,
        /// What is missing
        message: String,
    },

    /// A handler placed before another one in a chain cannot delegate
    #[error("The handler '{0}' cannot forward to the next handler of a chain")]
    NotADelegate(String),
}
