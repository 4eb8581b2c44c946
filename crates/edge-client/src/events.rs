//! Session state and events observable by the host

use edge_proto::StreamId;
use std::fmt;

/// Session connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session. Terminal once an explicit stop has completed.
    Disconnected,
    /// Opening the physical connection to the relay.
    Connecting,
    /// Connection is up, waiting for the relay to accept the token.
    Authenticating,
    /// Authenticated; streams are being relayed.
    Active,
    /// Waiting out a backoff interval before the next attempt.
    Reconnecting,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Active => "active",
            SessionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the session manager
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session moved to a new state.
    StateChanged(SessionState),
    /// The relay opened a logical stream.
    StreamOpened(StreamId),
    /// A logical stream ended; `reason` is set for failures.
    StreamClosed {
        stream_id: StreamId,
        reason: Option<String>,
    },
    /// The relay refused the auth token.
    AuthRejected { reason: String },
    /// No Pong arrived within the configured deadline.
    HeartbeatTimeout,
}
