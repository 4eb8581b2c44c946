//! Session lifecycle: connect, authenticate, heartbeat, reconnect
//!
//! The session manager owns the relay connection. One run loop per client:
//! `Connecting -> Authenticating -> Active -> Reconnecting -> Connecting`,
//! repeating until the client asks for a stop. Losing a session force-closes
//! every relayed stream; a new session starts from a clean slate.

use crate::bridge::LocalBridge;
use crate::config::EdgeConfig;
use crate::events::{SessionEvent, SessionState};
use edge_connection::{
    MuxConfig, MuxError, MuxEvent, MuxHandle, MuxedConnection, ReconnectError, ReconnectManager,
    TcpTransport, Transport, TransportError,
};
use edge_proto::{
    ClientInfo, ControlError, ControlMessage, Frame, FrameDecoder, FrameError, FrameKind,
    CONTROL_STREAM_ID, PROTOCOL_VERSION,
};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Session-level errors; any of these tears the whole session down
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Heartbeat timed out")]
    HeartbeatTimeout,

    #[error("Connection closed by relay")]
    ConnectionClosed,
}

impl From<MuxError> for SessionError {
    fn from(err: MuxError) -> Self {
        match err {
            MuxError::Transport(e) => SessionError::Transport(e),
            MuxError::Closed => SessionError::ConnectionClosed,
            other => SessionError::Protocol(other.to_string()),
        }
    }
}

impl From<FrameError> for SessionError {
    fn from(err: FrameError) -> Self {
        SessionError::Protocol(err.to_string())
    }
}

impl From<ControlError> for SessionError {
    fn from(err: ControlError) -> Self {
        SessionError::Protocol(err.to_string())
    }
}

/// Owns the relay session for one client.
pub(crate) struct SessionManager {
    config: EdgeConfig,
    state_tx: watch::Sender<SessionState>,
    event_tx: broadcast::Sender<SessionEvent>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SessionManager {
    pub(crate) fn new(
        config: EdgeConfig,
        state_tx: watch::Sender<SessionState>,
        event_tx: broadcast::Sender<SessionEvent>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            state_tx,
            event_tx,
            shutdown_rx,
        }
    }

    /// Run until an explicit stop (or a fatal auth rejection, if configured).
    pub(crate) async fn run(mut self) {
        let mut reconnect = ReconnectManager::new(self.config.reconnect.clone());

        loop {
            if self.stop_requested() {
                break;
            }

            match self.run_session(&mut reconnect).await {
                Ok(()) => break,
                Err(err) => {
                    match &err {
                        SessionError::AuthRejected(_) if self.config.auth_failure_fatal => {
                            warn!("Authentication failures are configured as fatal; stopping");
                            break;
                        }
                        SessionError::AuthRejected(_) => {}
                        _ => warn!(error = %err, "Session lost"),
                    }

                    if self.stop_requested() {
                        break;
                    }

                    self.set_state(SessionState::Reconnecting);

                    let mut shutdown = self.shutdown_rx.clone();
                    tokio::select! {
                        result = reconnect.wait() => {
                            if let Err(ReconnectError::MaxAttemptsReached) = result {
                                warn!("Maximum reconnection attempts reached; stopping");
                                break;
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        self.set_state(SessionState::Disconnected);
        info!("Session manager stopped");
    }

    /// One connect -> authenticate -> active cycle. `Ok(())` means an
    /// explicit stop ended the session.
    async fn run_session(
        &mut self,
        reconnect: &mut ReconnectManager,
    ) -> Result<(), SessionError> {
        let conn_id = Uuid::new_v4();

        self.set_state(SessionState::Connecting);
        info!(
            conn = %conn_id,
            server = %self.config.server_addr,
            attempt = reconnect.attempt(),
            "Connecting to relay"
        );

        let mut shutdown = self.shutdown_rx.clone();
        let mut transport = tokio::select! {
            result = TcpTransport::connect(&self.config.server_addr, self.config.connect_timeout) => result?,
            _ = shutdown.changed() => return Ok(()),
        };

        self.set_state(SessionState::Authenticating);
        let mut decoder = FrameDecoder::new();
        let auth = tokio::select! {
            result = self.authenticate(&mut transport, &mut decoder) => result,
            _ = shutdown.changed() => return Ok(()),
        };

        let session_id = match auth {
            Ok(session_id) => session_id,
            Err(SessionError::AuthRejected(reason)) => {
                warn!(conn = %conn_id, reason = %reason, "Relay rejected authentication token");
                self.emit(SessionEvent::AuthRejected {
                    reason: reason.clone(),
                });
                return Err(SessionError::AuthRejected(reason));
            }
            Err(err) => return Err(err),
        };

        info!(conn = %conn_id, session = %session_id, "Authenticated with relay");

        // The multiplexer only sees frames once authentication succeeded;
        // bytes buffered past the handshake travel with the decoder.
        let (mux, events) = MuxedConnection::start(
            Box::new(transport),
            decoder,
            MuxConfig {
                send_queue_capacity: self.config.send_queue_capacity,
            },
        );

        self.set_state(SessionState::Active);
        let activated = Instant::now();

        let result = self.run_active(&mux, events).await;

        mux.shutdown().await;

        if activated.elapsed() >= self.config.stability_threshold {
            reconnect.reset();
        }

        result
    }

    /// Serve an authenticated session until it ends.
    async fn run_active(
        &mut self,
        mux: &MuxHandle,
        mut events: mpsc::UnboundedReceiver<MuxEvent>,
    ) -> Result<(), SessionError> {
        if self.stop_requested() {
            return Ok(());
        }

        let mut bridges: JoinSet<()> = JoinSet::new();
        let mut shutdown = self.shutdown_rx.clone();

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // the first tick completes immediately

        let result = loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if mux.last_pong().elapsed() > self.config.heartbeat_timeout {
                        self.emit(SessionEvent::HeartbeatTimeout);
                        break Err(SessionError::HeartbeatTimeout);
                    }
                    if mux.send_ping(unix_millis()).await.is_err() {
                        break Err(SessionError::ConnectionClosed);
                    }
                }
                event = events.recv() => match event {
                    Some(MuxEvent::IncomingStream(stream)) => {
                        let stream_id = stream.stream_id();
                        debug!(stream_id, "Accepting relayed stream");
                        self.emit(SessionEvent::StreamOpened(stream_id));

                        let bridge = LocalBridge::new(
                            self.config.local_addr.clone(),
                            self.config.connect_timeout,
                        );
                        bridges.spawn(bridge.run(stream, self.event_tx.clone()));
                    }
                    Some(MuxEvent::Control(msg)) => {
                        warn!(message = ?msg, "Unexpected control message while active");
                    }
                    Some(MuxEvent::RemoteError(reason)) => {
                        break Err(SessionError::Protocol(format!("relay error: {}", reason)));
                    }
                    Some(MuxEvent::Closed(err)) => {
                        break Err(err.map(SessionError::from).unwrap_or(SessionError::ConnectionClosed));
                    }
                    None => break Err(SessionError::ConnectionClosed),
                },
                Some(_) = bridges.join_next(), if !bridges.is_empty() => {}
                _ = shutdown.changed() => break Ok(()),
            }
        };

        self.drain_bridges(&mut bridges).await;
        result
    }

    /// Wait for bridges to wind down, aborting stragglers after the grace
    /// period. No local socket survives the session.
    async fn drain_bridges(&mut self, bridges: &mut JoinSet<()>) {
        if bridges.is_empty() {
            return;
        }

        debug!(count = bridges.len(), "Waiting for relay bridges to finish");

        let drain = async {
            while bridges.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.shutdown_grace, drain)
            .await
            .is_err()
        {
            warn!("Aborting bridges that did not stop in time");
            bridges.abort_all();
            while bridges.join_next().await.is_some() {}
        }
    }

    /// Token exchange on the raw transport, before the multiplexer exists.
    /// No data frame is processed until the relay has accepted the token.
    async fn authenticate(
        &self,
        transport: &mut TcpTransport,
        decoder: &mut FrameDecoder,
    ) -> Result<String, SessionError> {
        let request = ControlMessage::AuthRequest {
            token: self.config.auth_token.clone(),
            protocol_version: PROTOCOL_VERSION,
            client: ClientInfo::default(),
        };
        let frame = Frame::data(CONTROL_STREAM_ID, request.encode()?);
        transport.send(frame.encode()?).await?;

        let handshake = async {
            loop {
                while let Some(frame) = decoder.decode()? {
                    match (frame.stream_id, frame.kind) {
                        (CONTROL_STREAM_ID, FrameKind::Data) => {
                            match ControlMessage::decode(&frame.payload)? {
                                ControlMessage::AuthAccept { session_id } => {
                                    return Ok(session_id);
                                }
                                ControlMessage::AuthReject { reason } => {
                                    return Err(SessionError::AuthRejected(reason));
                                }
                                ControlMessage::AuthRequest { .. } => {
                                    return Err(SessionError::Protocol(
                                        "relay sent an auth request".to_string(),
                                    ));
                                }
                            }
                        }
                        (CONTROL_STREAM_ID, FrameKind::Ping) => {
                            let pong = Frame::pong(frame.timestamp().unwrap_or(0));
                            transport.send(pong.encode()?).await?;
                        }
                        (stream_id, kind) => {
                            return Err(SessionError::Protocol(format!(
                                "unexpected {:?} frame on stream {} before authentication",
                                kind, stream_id
                            )));
                        }
                    }
                }

                match transport.recv().await? {
                    Some(chunk) => decoder.extend(&chunk),
                    None => return Err(SessionError::ConnectionClosed),
                }
            }
        };

        match tokio::time::timeout(self.config.handshake_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::HandshakeTimeout),
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(state = %state, "Session state changed");
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    fn stop_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
