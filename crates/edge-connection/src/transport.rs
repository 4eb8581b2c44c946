//! Transport trait for relay connections

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timeout")]
    Timeout,
}

/// Byte-stream transport to the relay server.
///
/// The engine speaks frames over any connection-oriented transport; a TLS
/// or QUIC variant plugs in here without touching the multiplexer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send bytes through the transport
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Receive the next chunk of bytes; `None` means the peer closed cleanly
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if transport is connected
    fn is_connected(&self) -> bool;
}
