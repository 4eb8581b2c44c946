//! Control-channel messages
//!
//! Control messages travel as bincode payloads inside `Data` frames on
//! stream 0. Authentication is the first exchange on a fresh connection;
//! no data stream is accepted until the relay has answered it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Control codec errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Messages exchanged on the control stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    /// First message from the edge: prove knowledge of the shared token.
    AuthRequest {
        token: String,
        protocol_version: u32,
        client: ClientInfo,
    },
    /// Relay accepted the token; the session is live.
    AuthAccept { session_id: String },
    /// Relay refused the token.
    AuthReject { reason: String },
}

impl ControlMessage {
    /// Encode to a frame payload.
    pub fn encode(&self) -> Result<Bytes, ControlError> {
        let payload = bincode::serialize(self)?;
        if payload.len() > crate::MAX_FRAME_SIZE as usize {
            return Err(ControlError::MessageTooLarge(payload.len()));
        }
        Ok(Bytes::from(payload))
    }

    /// Decode from a frame payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, ControlError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Edge host metadata sent along with the auth request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientInfo {
    pub hostname: String,
    pub platform: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
