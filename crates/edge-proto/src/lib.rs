//! Edge Tunnel Wire Protocol
//!
//! This crate defines the framing layer and control messages spoken between
//! an edge client and its relay server.

pub mod control;
pub mod frame;

pub use control::{ClientInfo, ControlError, ControlMessage};
pub use frame::{Frame, FrameDecoder, FrameError, FrameFlags, FrameKind, StreamId};

/// Protocol version advertised during authentication
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame payload size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Reserved stream ID for the control channel
pub const CONTROL_STREAM_ID: u32 = 0;
