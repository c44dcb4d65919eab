//! Length-prefixed frame codec for async streams

use crate::{Frame, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest encoded frame accepted in either direction
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Reads and writes [`Frame`]s as a big-endian `u32` length followed by the
/// MessagePack encoded frame. Partial reads are buffered between calls.
pub struct FrameCodec {
    read_buf: BytesMut,
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec accepting frames up to [`MAX_FRAME_SIZE`]
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Codec with a custom frame size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_frame_size,
        }
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    /// Length-prefixed bytes for `frame`
    pub fn encode_frame(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        let body = frame.to_msgpack()?;
        self.check_size(body.len())?;

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + body.len());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Encode `frame` and flush it to `writer`
    pub async fn write_frame<W>(&self, writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode_frame(frame)?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Next frame from `reader`, or `None` on a clean end of stream
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<Frame>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(frame) = self.try_decode_frame()? {
                return Ok(Some(frame));
            }
            if reader.read_buf(&mut self.read_buf).await? == 0 {
                return if self.read_buf.is_empty() {
                    Ok(None)
                } else {
                    Err(ProtocolError::InvalidFrame)
                };
            }
        }
    }

    /// Decode one frame if the buffer holds a complete one
    pub fn try_decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.read_buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let len = (&self.read_buf[..LENGTH_PREFIX]).get_u32() as usize;
        self.check_size(len)?;
        if self.read_buf.len() < LENGTH_PREFIX + len {
            self.read_buf.reserve(LENGTH_PREFIX + len - self.read_buf.len());
            return Ok(None);
        }

        self.read_buf.advance(LENGTH_PREFIX);
        let body = self.read_buf.split_to(len);
        Frame::from_msgpack(&body).map(Some)
    }

    /// Buffered bytes not yet decoded
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }
}
