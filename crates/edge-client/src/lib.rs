//! Edge Tunnel Client
//!
//! Connects outward from a private network to a public relay server,
//! authenticates with a shared token, and relays every logical stream the
//! relay opens to a configured local service address. Sessions heal
//! themselves: a lost connection tears down all streams and re-enters a
//! jittered exponential backoff loop until the relay is reachable again.
//!
//! ```no_run
//! use edge_client::connect_to_server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client =
//!         connect_to_server("relay.example.com:4433", "secret-token", "127.0.0.1:8080").await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod client;
pub mod config;
pub mod events;
pub mod session;

pub use bridge::BridgeError;
pub use client::{EdgeClient, EdgeError};
pub use config::{EdgeConfig, EdgeConfigBuilder};
pub use events::{SessionEvent, SessionState};
pub use session::SessionError;

/// Connect to a relay server and start relaying to `local_addr`.
///
/// Convenience wrapper over [`EdgeClient`] with default timeouts and
/// reconnect policy. The returned client is already running; keep it alive
/// for as long as the tunnel should exist, and call
/// [`disconnect`](EdgeClient::disconnect) to stop it.
pub async fn connect_to_server(
    server_addr: impl Into<String>,
    token: impl Into<String>,
    local_addr: impl Into<String>,
) -> Result<EdgeClient, EdgeError> {
    let config = EdgeConfig::builder()
        .server_addr(server_addr.into())
        .auth_token(token.into())
        .local_addr(local_addr.into())
        .build()
        .map_err(EdgeError::Config)?;

    let client = EdgeClient::new(config);
    client.connect().await;
    Ok(client)
}
