//! Local relay bridge
//!
//! Each relay-opened stream gets one bridge: it dials the configured local
//! service and pumps bytes both ways until either side finishes. A failure
//! to reach the local service closes only that stream; the session is not
//! affected.

use crate::events::SessionEvent;
use bytes::Bytes;
use edge_connection::{MuxError, RemoteStream, StreamEvent};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

/// Read chunk size for the local socket
const READ_BUF_SIZE: usize = 16 * 1024;

/// Errors that can occur while bridging a stream
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Failed to connect to local service {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Connection to local service {0} timed out")]
    ConnectTimeout(String),

    #[error("IO error during relay: {0}")]
    Io(#[from] std::io::Error),

    #[error("Multiplexer error: {0}")]
    Mux(#[from] MuxError),
}

/// Bridges one logical stream to the local service address.
pub(crate) struct LocalBridge {
    local_addr: String,
    connect_timeout: Duration,
}

impl LocalBridge {
    pub(crate) fn new(local_addr: String, connect_timeout: Duration) -> Self {
        Self {
            local_addr,
            connect_timeout,
        }
    }

    /// Run the bridge to completion and report the close through `events`.
    pub(crate) async fn run(self, stream: RemoteStream, events: broadcast::Sender<SessionEvent>) {
        let stream_id = stream.stream_id();

        let reason = match self.relay(stream).await {
            Ok((to_local, to_relay)) => {
                info!(
                    stream_id,
                    bytes_to_local = to_local,
                    bytes_to_relay = to_relay,
                    "Relay stream finished"
                );
                None
            }
            Err(e) => {
                warn!(stream_id, error = %e, "Relay stream failed");
                Some(e.to_string())
            }
        };

        let _ = events.send(SessionEvent::StreamClosed { stream_id, reason });
    }

    /// Pump bytes between the stream and the local service.
    ///
    /// Returns (bytes written to the local service, bytes sent to the relay).
    async fn relay(&self, stream: RemoteStream) -> Result<(u64, u64), BridgeError> {
        let (stream_id, mut rx, handle) = stream.into_parts();

        let local = match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(&self.local_addr),
        )
        .await
        {
            Ok(Ok(local)) => local,
            Ok(Err(e)) => {
                let _ = handle
                    .close_stream(stream_id, Some(format!("local service unavailable: {}", e)))
                    .await;
                return Err(BridgeError::ConnectionFailed {
                    address: self.local_addr.clone(),
                    source: e,
                });
            }
            Err(_) => {
                let _ = handle
                    .close_stream(stream_id, Some("local service connect timed out".to_string()))
                    .await;
                return Err(BridgeError::ConnectTimeout(self.local_addr.clone()));
            }
        };

        debug!(stream_id, local_addr = %self.local_addr, "Connected to local service");

        let (mut local_read, mut local_write) = local.into_split();

        // Raised when the stream is fully closed (remote Close or session
        // teardown) so the outbound pump stops too; a plain remote FIN must
        // leave it running.
        let abort = Arc::new(Notify::new());
        let abort_inbound = abort.clone();

        // Relay -> local service
        let relay_to_local = async move {
            let mut total = 0u64;
            loop {
                match rx.recv().await {
                    Some(StreamEvent::Data(data)) => {
                        if let Err(e) = local_write.write_all(&data).await {
                            abort_inbound.notify_one();
                            let _ = local_write.shutdown().await;
                            return Err(BridgeError::Io(e));
                        }
                        total += data.len() as u64;
                    }
                    Some(StreamEvent::Fin) => break,
                    Some(StreamEvent::Closed { .. }) | None => {
                        abort_inbound.notify_one();
                        break;
                    }
                }
            }
            let _ = local_write.shutdown().await;
            Ok::<u64, BridgeError>(total)
        };

        // Local service -> relay
        let handle_out = handle.clone();
        let local_to_relay = async move {
            let mut total = 0u64;
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                tokio::select! {
                    _ = abort.notified() => break,
                    read = local_read.read(&mut buf) => match read {
                        Ok(0) => {
                            handle_out.send_fin(stream_id).await?;
                            break;
                        }
                        Ok(n) => {
                            handle_out
                                .send_data(stream_id, Bytes::copy_from_slice(&buf[..n]))
                                .await?;
                            total += n as u64;
                        }
                        Err(e) => {
                            let _ = handle_out
                                .close_stream(stream_id, Some(format!("local read error: {}", e)))
                                .await;
                            return Err(BridgeError::Io(e));
                        }
                    },
                }
            }
            Ok::<u64, BridgeError>(total)
        };

        let (inbound, outbound) = tokio::join!(relay_to_local, local_to_relay);

        let to_local = inbound?;
        let to_relay = outbound?;

        Ok((to_local, to_relay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_error_display() {
        let err = BridgeError::ConnectTimeout("127.0.0.1:8080".to_string());
        assert!(err.to_string().contains("timed out"));

        let err = BridgeError::ConnectionFailed {
            address: "127.0.0.1:8080".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(err.to_string().contains("127.0.0.1:8080"));
    }
}
