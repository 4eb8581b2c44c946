//! Framing layer for the edge tunnel protocol
//!
//! Every message on the wire is a discrete frame: a fixed header followed by
//! the payload.
//!
//! ```text
//! +-----------+------+-------+-------------+---------+
//! | stream_id | kind | flags | payload_len | payload |
//! |    u32    |  u8  |  u8   |     u32     |   ...   |
//! +-----------+------+-------+-------------+---------+
//! ```
//!
//! All integers are big-endian. Stream id 0 is the control channel
//! (authentication messages and Ping/Pong); nonzero stream ids each carry
//! one relayed connection as Open/Data/Close.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{CONTROL_STREAM_ID, MAX_FRAME_SIZE};

/// Stream identifier
pub type StreamId = u32;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid frame kind: {0}")]
    InvalidKind(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// A new logical stream (nonzero stream id, relay-assigned).
    Open = 0,
    /// Payload bytes for a stream; on stream 0, a control message.
    Data = 1,
    /// Full close of a stream, optionally with a UTF-8 reason payload.
    Close = 2,
    /// Liveness probe on stream 0; payload is a u64 millisecond timestamp.
    Ping = 3,
    /// Answer to a Ping, echoing its payload.
    Pong = 4,
    /// Session-level error on stream 0, UTF-8 reason payload.
    Error = 5,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(FrameKind::Open),
            1 => Ok(FrameKind::Data),
            2 => Ok(FrameKind::Close),
            3 => Ok(FrameKind::Ping),
            4 => Ok(FrameKind::Pong),
            5 => Ok(FrameKind::Error),
            _ => Err(FrameError::InvalidKind(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Sender has finished writing on this stream (half-close).
    pub const FIN: u8 = 0b0000_0001;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_fin(mut self) -> Self {
        self.0 |= Self::FIN;
        self
    }

    pub fn has_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

impl Default for FrameFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// A single wire frame. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub kind: FrameKind,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: stream_id (4) + kind (1) + flags (1) + length (4)
    pub const HEADER_SIZE: usize = 10;

    pub fn new(stream_id: StreamId, kind: FrameKind, payload: Bytes) -> Self {
        Self {
            stream_id,
            kind,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn open(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameKind::Open, Bytes::new())
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameKind::Data, payload)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameKind::Close, Bytes::new())
    }

    pub fn close_with_reason(stream_id: StreamId, reason: &str) -> Self {
        Self::new(
            stream_id,
            FrameKind::Close,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    pub fn ping(timestamp_ms: u64) -> Self {
        Self::new(
            CONTROL_STREAM_ID,
            FrameKind::Ping,
            Bytes::copy_from_slice(&timestamp_ms.to_be_bytes()),
        )
    }

    pub fn pong(timestamp_ms: u64) -> Self {
        Self::new(
            CONTROL_STREAM_ID,
            FrameKind::Pong,
            Bytes::copy_from_slice(&timestamp_ms.to_be_bytes()),
        )
    }

    pub fn error(reason: &str) -> Self {
        Self::new(
            CONTROL_STREAM_ID,
            FrameKind::Error,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// UTF-8 reason carried by Close/Error frames, if any.
    pub fn reason(&self) -> Option<String> {
        if self.payload.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.payload).into_owned())
        }
    }

    /// Timestamp carried by Ping/Pong frames.
    pub fn timestamp(&self) -> Option<u64> {
        self.payload
            .as_ref()
            .try_into()
            .ok()
            .map(u64::from_be_bytes)
    }

    /// Encode the frame to wire bytes.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_FRAME_SIZE as usize {
            return Err(FrameError::FrameTooLarge(payload_len));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload_len);

        buf.put_u32(self.stream_id);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_u32(payload_len as u32);
        buf.put(self.payload.clone());

        Ok(buf.freeze())
    }
}

/// Incremental frame decoder.
///
/// Feed raw bytes with [`extend`](Self::extend) as they arrive off the
/// socket and pull complete frames with [`decode`](Self::decode). Partial
/// frames stay buffered until the rest of the bytes show up, so arbitrary
/// TCP segmentation is fine.
pub struct FrameDecoder {
    buf: BytesMut,
    max_payload: u32,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_FRAME_SIZE)
    }

    /// Cap on the declared payload length; anything larger is rejected
    /// instead of buffered.
    pub fn with_max_payload(max_payload: u32) -> Self {
        Self {
            buf: BytesMut::new(),
            max_payload,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Decode the next complete frame, or `Ok(None)` if more bytes are
    /// needed. Never yields a frame from a truncated input.
    pub fn decode(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < Frame::HEADER_SIZE {
            return Ok(None);
        }

        // Validate kind and length from the header before waiting for the
        // payload, so hostile input is rejected early.
        let kind = FrameKind::try_from(self.buf[4])?;
        let length = u32::from_be_bytes([self.buf[6], self.buf[7], self.buf[8], self.buf[9]]);
        if length > self.max_payload {
            return Err(FrameError::FrameTooLarge(length as usize));
        }

        if self.buf.len() < Frame::HEADER_SIZE + length as usize {
            return Ok(None);
        }

        let mut header = self.buf.split_to(Frame::HEADER_SIZE);
        let stream_id = header.get_u32();
        header.advance(1); // kind, parsed above
        let flags = FrameFlags::from_u8(header.get_u8());
        let payload = self.buf.split_to(length as usize).freeze();

        Ok(Some(Frame {
            stream_id,
            kind,
            flags,
            payload,
        }))
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
