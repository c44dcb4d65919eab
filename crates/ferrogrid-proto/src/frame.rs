//! Frame structure and serialization

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use crate::{Message, ProtocolError};

/// Frame flags for protocol control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    /// Plain message frame
    pub const NONE: Self = Self(0);
    /// The peer could not decode a frame it received; payload is UTF-8 text
    pub const ERROR: Self = Self(1);
    /// The sender is closing the connection
    pub const GOODBYE: Self = Self(2);
    /// The frame travels back to the side that opened the channel
    pub const RESPONSE: Self = Self(4);

    fn with(self, flag: FrameFlags) -> Self {
        Self(self.0 | flag.0)
    }

    /// Check if a flag is set
    pub fn has_flag(self, flag: FrameFlags) -> bool {
        (self.0 & flag.0) != 0
    }
}

/// Unit of transmission between a grid and its agents.
///
/// `channel` is allocated by the side that sends a request and reused for the
/// matching response. Both sides allocate channels independently, so a channel
/// number alone is ambiguous: frames flowing back to the side that opened the
/// channel carry [`FrameFlags::RESPONSE`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Logical channel identifier
    pub channel: u32,
    /// Frame flags
    pub flags: FrameFlags,
    /// MessagePack encoded [`Message`], or error text for error frames
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(channel: u32, flags: FrameFlags, payload: Bytes) -> Self {
        Self { channel, flags, payload }
    }

    /// Encode a message; responses are flagged [`FrameFlags::RESPONSE`]
    pub fn message(channel: u32, message: &Message) -> Result<Self, ProtocolError> {
        let payload = rmp_serde::to_vec(message)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        let flags = match message {
            Message::Request(_) => FrameFlags::NONE,
            Message::Response(_) => FrameFlags::RESPONSE,
        };
        Ok(Self::new(channel, flags, Bytes::from(payload)))
    }

    /// Reject a request the remote side sent on `channel`
    pub fn error(channel: u32, reason: impl Into<String>) -> Self {
        Self::new(
            channel,
            FrameFlags::ERROR.with(FrameFlags::RESPONSE),
            Bytes::from(reason.into().into_bytes()),
        )
    }

    /// Reject a response the remote side sent on a channel this side opened
    pub fn response_error(channel: u32, reason: impl Into<String>) -> Self {
        Self::new(channel, FrameFlags::ERROR, Bytes::from(reason.into().into_bytes()))
    }

    /// Create a goodbye frame
    pub fn goodbye() -> Self {
        Self::new(0, FrameFlags::GOODBYE, Bytes::new())
    }

    /// Decode the message carried by this frame
    pub fn decode_message(&self) -> Result<Message, ProtocolError> {
        rmp_serde::from_slice(&self.payload)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Serialize frame to MessagePack bytes
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize frame from MessagePack bytes
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Check if this is an error frame
    pub fn is_error(&self) -> bool {
        self.flags.has_flag(FrameFlags::ERROR)
    }

    /// Whether the frame answers a request sent by the receiving side
    pub fn is_response(&self) -> bool {
        self.flags.has_flag(FrameFlags::RESPONSE)
    }

    /// Check if this is a goodbye frame
    pub fn is_goodbye(&self) -> bool {
        self.flags.has_flag(FrameFlags::GOODBYE)
    }
}
