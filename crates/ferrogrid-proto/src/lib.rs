//! # Ferrogrid Protocol
//!
//! Wire types shared by the grid controller and its agents: dispatch
//! payloads, token descriptors, the length-prefixed MessagePack frame codec
//! and the bidirectional [`Peer`] used on every grid/agent connection.

#![warn(missing_docs)]

/// Frame structure and serialization
pub mod frame;

/// Message types and enums
pub mod message;

/// Dispatch payloads
pub mod io;

/// Token descriptors and selection interests
pub mod token;

/// Frame codec for async streams
pub mod codec;

/// Bidirectional request/response connection
pub mod peer;

/// Error types for protocol operations
pub mod error;

pub use frame::{Frame, FrameFlags};
pub use message::{ErrorCode, ErrorDetails, Message, Request, Response};
pub use io::{
    AgentError, AgentErrorCode, Attachment, FileEntry, FilePayload, FileVersionId, InputMessage,
    Measure, OutputMessage, OutputMessageBuilder,
};
pub use token::{AgentRegistration, Interest, TokenDescriptor, TokenStatus, AGENT_TYPE_KEY, DEFAULT_AGENT_TYPE};
pub use codec::FrameCodec;
pub use peer::{Peer, RequestHandler};
pub use error::ProtocolError;
