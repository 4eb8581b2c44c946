//! Edge client facade

use crate::config::EdgeConfig;
use crate::events::{SessionEvent, SessionState};
use crate::session::{SessionError, SessionManager};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Edge client errors
#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

impl EdgeError {
    /// Returns true if this error is non-recoverable and retrying won't help
    pub fn is_non_recoverable(&self) -> bool {
        matches!(
            self,
            EdgeError::Config(_) | EdgeError::Session(SessionError::AuthRejected(_))
        )
    }

    /// Returns true if this error is recoverable and retrying might succeed
    pub fn is_recoverable(&self) -> bool {
        !self.is_non_recoverable()
    }
}

struct Inner {
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

/// The edge tunnel client.
///
/// Construction performs no I/O; [`connect`](Self::connect) starts the
/// session manager in the background and returns immediately. Progress is
/// observable through [`state`](Self::state)/[`watch_state`](Self::watch_state)
/// and [`events`](Self::events). Every client instance is fully independent
/// state, so several can coexist in one process.
pub struct EdgeClient {
    config: EdgeConfig,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    event_tx: broadcast::Sender<SessionEvent>,
    inner: Mutex<Inner>,
}

impl EdgeClient {
    pub fn new(config: EdgeConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            config,
            state_tx,
            state_rx,
            event_tx,
            inner: Mutex::new(Inner {
                task: None,
                shutdown_tx: None,
            }),
        }
    }

    /// Start the session manager in the background.
    ///
    /// Returns without waiting for the connection to come up. Calling this
    /// while a session run loop is already alive is a no-op.
    pub async fn connect(&self) {
        let mut inner = self.inner.lock().await;

        if let Some(task) = &inner.task {
            if !task.is_finished() {
                debug!("connect() called while already running; ignoring");
                return;
            }
        }

        info!(
            server = %self.config.server_addr,
            local = %self.config.local_addr,
            "Starting edge client"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = SessionManager::new(
            self.config.clone(),
            self.state_tx.clone(),
            self.event_tx.clone(),
            shutdown_rx,
        );

        inner.shutdown_tx = Some(shutdown_tx);
        inner.task = Some(tokio::spawn(manager.run()));
    }

    /// Stop the client: cancel any in-flight backoff wait, tear down the
    /// session and all relayed streams, and wait (bounded) for the run loop
    /// to finish. This is the only path to the terminal state.
    pub async fn disconnect(&self) {
        let (task, shutdown_tx) = {
            let mut inner = self.inner.lock().await;
            (inner.task.take(), inner.shutdown_tx.take())
        };

        let Some(mut task) = task else {
            debug!("disconnect() called while not running");
            return;
        };

        if let Some(tx) = shutdown_tx {
            let _ = tx.send(true);
        }

        let grace = self.config.shutdown_grace + Duration::from_secs(1);
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!("Session did not stop within the grace period; aborting");
            task.abort();
        }

        info!("Edge client stopped");
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Watch session state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Subscribe to session events (state changes, per-stream open/close,
    /// auth rejections, heartbeat timeouts).
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Whether a session run loop is currently alive.
    pub async fn is_running(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn config(&self) -> &EdgeConfig {
        &self.config
    }
}
