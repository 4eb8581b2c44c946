//! TCP transport implementation

use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Socket read chunk size
const READ_BUF_SIZE: usize = 16 * 1024;

/// Plain TCP transport
pub struct TcpTransport {
    stream: TcpStream,
    connected: bool,
}

impl TcpTransport {
    /// Connect to `addr` ("host:port"), failing after `timeout`.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, TransportError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        let _ = stream.set_nodelay(true);

        debug!(addr = %addr, "TCP transport connected");

        Ok(Self {
            stream,
            connected: true,
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.stream.write_all(&data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            self.connected = false;
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Bytes::from(buf)))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        self.stream.shutdown().await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_send_recv() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            socket.write_all(b"world").await.unwrap();
        });

        let mut transport = TcpTransport::connect(&addr, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(transport.is_connected());

        transport.send(Bytes::from_static(b"hello")).await.unwrap();
        let reply = transport.recv().await.unwrap().unwrap();
        assert_eq!(reply, Bytes::from_static(b"world"));

        server.await.unwrap();

        // The server is done with the socket; the next read reports EOF.
        assert_eq!(transport.recv().await.unwrap(), None);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        // Non-routable address; the connect attempt should hit the timeout.
        let result = TcpTransport::connect("10.255.255.1:4433", Duration::from_millis(100)).await;
        assert!(matches!(
            result,
            Err(TransportError::Timeout) | Err(TransportError::ConnectionFailed(_))
        ));
    }
}
