//! Message types and enums

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;
use crate::io::{FilePayload, FileVersionId, InputMessage, OutputMessage};
use crate::token::{AgentRegistration, TokenStatus};

/// Top-level message wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Request message
    Request(Request),
    /// Response message
    Response(Response),
}

impl Message {
    /// Create a request message
    pub fn request(req: Request) -> Self {
        Self::Request(req)
    }

    /// Create a response message
    pub fn response(resp: Response) -> Self {
        Self::Response(resp)
    }

    /// Id of the request, or of the request a response answers
    pub fn request_id(&self) -> Uuid {
        match self {
            Self::Request(req) => req.id(),
            Self::Response(resp) => resp.request_id(),
        }
    }
}

/// Request message types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Agent announces (or refreshes) its tokens; doubles as keepalive
    RegisterTokens {
        /// Request ID for correlation
        id: Uuid,
        /// Agent and token descriptors
        registration: AgentRegistration,
    },

    /// Agent withdraws all its tokens before shutting down
    UnregisterAgent {
        /// Request ID for correlation
        id: Uuid,
        /// Agent identity
        agent_id: String,
    },

    /// Agent downloads a file version from the grid
    FetchFile {
        /// Request ID for correlation
        id: Uuid,
        /// File to download
        file: FileVersionId,
    },

    /// Grid dispatches an input message to a token
    Process {
        /// Request ID for correlation
        id: Uuid,
        /// Target token
        token_id: String,
        /// Handler input
        input: InputMessage,
    },

    /// Grid opens a reservation session on a token
    ReserveToken {
        /// Request ID for correlation
        id: Uuid,
        /// Target token
        token_id: String,
    },

    /// Grid closes a reservation session on a token
    ReleaseToken {
        /// Request ID for correlation
        id: Uuid,
        /// Target token
        token_id: String,
    },

    /// Grid asks an agent for the state of its tokens
    ListTokens {
        /// Request ID for correlation
        id: Uuid,
    },

    /// Ping request for health checking
    Ping {
        /// Request ID for correlation
        id: Uuid,
        /// Timestamp
        timestamp: u64,
    },
}

impl Request {
    /// Get the request ID
    pub fn id(&self) -> Uuid {
        match self {
            Self::RegisterTokens { id, .. } => *id,
            Self::UnregisterAgent { id, .. } => *id,
            Self::FetchFile { id, .. } => *id,
            Self::Process { id, .. } => *id,
            Self::ReserveToken { id, .. } => *id,
            Self::ReleaseToken { id, .. } => *id,
            Self::ListTokens { id } => *id,
            Self::Ping { id, .. } => *id,
        }
    }

    /// Short name of the request kind, for logging and handler lookup
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RegisterTokens { .. } => "register_tokens",
            Self::UnregisterAgent { .. } => "unregister_agent",
            Self::FetchFile { .. } => "fetch_file",
            Self::Process { .. } => "process",
            Self::ReserveToken { .. } => "reserve_token",
            Self::ReleaseToken { .. } => "release_token",
            Self::ListTokens { .. } => "list_tokens",
            Self::Ping { .. } => "ping",
        }
    }

    /// Create a registration request
    pub fn register_tokens(registration: AgentRegistration) -> Self {
        Self::RegisterTokens {
            id: Uuid::new_v4(),
            registration,
        }
    }

    /// Create an unregistration request
    pub fn unregister_agent(agent_id: impl Into<String>) -> Self {
        Self::UnregisterAgent {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
        }
    }

    /// Create a file download request
    pub fn fetch_file(file: FileVersionId) -> Self {
        Self::FetchFile {
            id: Uuid::new_v4(),
            file,
        }
    }

    /// Create a process request
    pub fn process(token_id: impl Into<String>, input: InputMessage) -> Self {
        Self::Process {
            id: Uuid::new_v4(),
            token_id: token_id.into(),
            input,
        }
    }

    /// Create a token reservation request
    pub fn reserve_token(token_id: impl Into<String>) -> Self {
        Self::ReserveToken {
            id: Uuid::new_v4(),
            token_id: token_id.into(),
        }
    }

    /// Create a token release request
    pub fn release_token(token_id: impl Into<String>) -> Self {
        Self::ReleaseToken {
            id: Uuid::new_v4(),
            token_id: token_id.into(),
        }
    }

    /// Create a token listing request
    pub fn list_tokens() -> Self {
        Self::ListTokens { id: Uuid::new_v4() }
    }

    /// Create a ping request
    pub fn ping() -> Self {
        Self::Ping {
            id: Uuid::new_v4(),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

/// Response message types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Request accepted, no data returned
    Ack {
        /// Request ID this responds to
        request_id: Uuid,
    },

    /// Downloaded file content
    FileContent {
        /// Request ID this responds to
        request_id: Uuid,
        /// File or directory content
        payload: FilePayload,
    },

    /// Handler result
    Output {
        /// Request ID this responds to
        request_id: Uuid,
        /// Output message
        output: OutputMessage,
    },

    /// Tokens hosted by an agent, sorted by uid
    Tokens {
        /// Request ID this responds to
        request_id: Uuid,
        /// Token states
        tokens: Vec<TokenStatus>,
    },

    /// Pong response
    Pong {
        /// Request ID this responds to
        request_id: Uuid,
        /// Original timestamp
        timestamp: u64,
        /// Response timestamp
        response_timestamp: u64,
    },

    /// Error response
    Error {
        /// Request ID this responds to
        request_id: Uuid,
        /// Error details
        error: ErrorDetails,
    },
}

impl Response {
    /// Get the request ID this response corresponds to
    pub fn request_id(&self) -> Uuid {
        match self {
            Self::Ack { request_id } => *request_id,
            Self::FileContent { request_id, .. } => *request_id,
            Self::Output { request_id, .. } => *request_id,
            Self::Tokens { request_id, .. } => *request_id,
            Self::Pong { request_id, .. } => *request_id,
            Self::Error { request_id, .. } => *request_id,
        }
    }

    /// Create an acknowledgement
    pub fn ack(request_id: Uuid) -> Self {
        Self::Ack { request_id }
    }

    /// Create an error response
    pub fn error(request_id: Uuid, error: ErrorDetails) -> Self {
        Self::Error { request_id, error }
    }

    /// Create a pong response
    pub fn pong(request_id: Uuid, timestamp: u64) -> Self {
        Self::Pong {
            request_id,
            timestamp,
            response_timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

/// Error details for protocol level error responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Additional context data
    pub context: HashMap<String, String>,
}

/// Error codes for protocol level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Invalid request format
    InvalidRequest,
    /// Requested file, token or agent not found
    NotFound,
    /// Timeout occurred
    Timeout,
    /// Internal error
    InternalError,
    /// Unsupported operation
    Unsupported,
    /// Resource exhausted
    ResourceExhausted,
}

impl ErrorDetails {
    /// Create a new error details
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: HashMap::new(),
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}
