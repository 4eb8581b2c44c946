//! Stream multiplexer for the relay connection
//!
//! One task owns the physical connection: a cooperative loop that drains a
//! bounded outbound queue and fans inbound frames out to per-stream queues.
//! All writes are serialized through the queue, so `send_data` callers wait
//! once the queue reaches capacity and resume as the writer drains it. A
//! single decode loop routes inbound frames, keeping per-stream ordering
//! identical to wire order.

use crate::transport::{Transport, TransportError};
use bytes::Bytes;
use edge_proto::{
    ControlError, ControlMessage, Frame, FrameDecoder, FrameError, FrameFlags, FrameKind,
    StreamId, CONTROL_STREAM_ID,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Control codec error: {0}")]
    Control(#[from] ControlError),

    #[error("Stream id {0} reused or out of order")]
    StreamReused(StreamId),

    #[error("Frame for stream {0} that was never opened")]
    UnknownStream(StreamId),

    #[error("Unexpected {kind:?} frame on stream {stream_id}")]
    UnexpectedFrame { stream_id: StreamId, kind: FrameKind },

    #[error("Connection closed")]
    Closed,
}

impl MuxError {
    /// Malformed or out-of-contract input from the peer, as opposed to a
    /// socket-level failure.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            MuxError::Frame(_)
                | MuxError::Control(_)
                | MuxError::StreamReused(_)
                | MuxError::UnknownStream(_)
                | MuxError::UnexpectedFrame { .. }
        )
    }
}

/// Events surfaced to the session
#[derive(Debug)]
pub enum MuxEvent {
    /// The relay opened a new logical stream.
    IncomingStream(RemoteStream),
    /// A control message arrived on stream 0.
    Control(ControlMessage),
    /// The relay reported a session-level error.
    RemoteError(String),
    /// The I/O loop ended; `None` means a locally requested shutdown.
    Closed(Option<MuxError>),
}

/// Per-stream events delivered to the bridge, in wire order
#[derive(Debug)]
pub enum StreamEvent {
    /// Payload bytes.
    Data(Bytes),
    /// The remote side finished writing (half-close); outbound may continue.
    Fin,
    /// The stream is fully closed.
    Closed { reason: Option<String> },
}

/// Multiplexer configuration
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Outbound frame queue capacity (the write-path high-water mark)
    pub send_queue_capacity: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 128,
        }
    }
}

enum Outbound {
    Data {
        stream_id: StreamId,
        payload: Bytes,
        fin: bool,
    },
    Close {
        stream_id: StreamId,
        reason: Option<String>,
    },
    Control(ControlMessage),
    Ping {
        timestamp_ms: u64,
    },
    Shutdown,
}

/// Handle for enqueueing outbound traffic. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MuxHandle {
    tx: mpsc::Sender<Outbound>,
    last_pong: Arc<Mutex<Instant>>,
}

impl MuxHandle {
    /// Queue payload bytes for `stream_id`. Waits while the outbound queue
    /// is at capacity.
    pub async fn send_data(&self, stream_id: StreamId, payload: Bytes) -> Result<(), MuxError> {
        self.tx
            .send(Outbound::Data {
                stream_id,
                payload,
                fin: false,
            })
            .await
            .map_err(|_| MuxError::Closed)
    }

    /// Signal that the local side will write no more data on `stream_id`.
    pub async fn send_fin(&self, stream_id: StreamId) -> Result<(), MuxError> {
        self.tx
            .send(Outbound::Data {
                stream_id,
                payload: Bytes::new(),
                fin: true,
            })
            .await
            .map_err(|_| MuxError::Closed)
    }

    /// Close `stream_id`, optionally with a reason the relay can log.
    pub async fn close_stream(
        &self,
        stream_id: StreamId,
        reason: Option<String>,
    ) -> Result<(), MuxError> {
        self.tx
            .send(Outbound::Close { stream_id, reason })
            .await
            .map_err(|_| MuxError::Closed)
    }

    /// Send a liveness probe on the control stream.
    pub async fn send_ping(&self, timestamp_ms: u64) -> Result<(), MuxError> {
        self.tx
            .send(Outbound::Ping { timestamp_ms })
            .await
            .map_err(|_| MuxError::Closed)
    }

    /// Send a control message on stream 0.
    pub async fn send_control(&self, msg: ControlMessage) -> Result<(), MuxError> {
        self.tx
            .send(Outbound::Control(msg))
            .await
            .map_err(|_| MuxError::Closed)
    }

    /// Ask the I/O loop to stop. Frames queued ahead of the request are
    /// still written out.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Outbound::Shutdown).await;
    }

    /// Instant of the most recent Pong from the relay.
    pub fn last_pong(&self) -> Instant {
        *self.last_pong.lock().unwrap()
    }
}

/// A relay-initiated logical stream, handed to the bridge.
///
/// The bridge owns the inbound receiver; sends go back through the shared
/// [`MuxHandle`], so this handle never owns the underlying stream state.
#[derive(Debug)]
pub struct RemoteStream {
    stream_id: StreamId,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    handle: MuxHandle,
}

impl RemoteStream {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Next inbound event; `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Split into the inbound receiver and an outbound handle.
    pub fn into_parts(self) -> (StreamId, mpsc::UnboundedReceiver<StreamEvent>, MuxHandle) {
        (self.stream_id, self.rx, self.handle)
    }
}

struct StreamEntry {
    tx: mpsc::UnboundedSender<StreamEvent>,
    local_fin: bool,
    remote_fin: bool,
}

/// The multiplexed relay connection: one I/O task per session.
///
/// Holds only a weak reference to its own outbound queue, so the loop winds
/// down on its own once every session-side handle is gone.
pub struct MuxedConnection {
    transport: Box<dyn Transport>,
    decoder: FrameDecoder,
    outbound_rx: mpsc::Receiver<Outbound>,
    outbound_weak: mpsc::WeakSender<Outbound>,
    event_tx: mpsc::UnboundedSender<MuxEvent>,
    streams: HashMap<StreamId, StreamEntry>,
    highest_stream_id: StreamId,
    last_pong: Arc<Mutex<Instant>>,
}

impl MuxedConnection {
    /// Spawn the I/O loop over an authenticated transport. `decoder` carries
    /// any bytes already buffered during the handshake.
    pub fn start(
        transport: Box<dyn Transport>,
        decoder: FrameDecoder,
        config: MuxConfig,
    ) -> (MuxHandle, mpsc::UnboundedReceiver<MuxEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.send_queue_capacity);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let last_pong = Arc::new(Mutex::new(Instant::now()));

        let outbound_weak = outbound_tx.downgrade();
        let handle = MuxHandle {
            tx: outbound_tx,
            last_pong: last_pong.clone(),
        };

        let mut connection = Self {
            transport,
            decoder,
            outbound_rx,
            outbound_weak,
            event_tx: event_tx.clone(),
            streams: HashMap::new(),
            highest_stream_id: 0,
            last_pong,
        };

        tokio::spawn(async move {
            let result = connection.run().await;

            // Dropping the entries ends every per-stream queue, so bridges
            // observe the teardown.
            connection.streams.clear();

            let event = match result {
                Ok(()) => MuxEvent::Closed(None),
                Err(e) => {
                    warn!(error = %e, "Relay connection ended");
                    MuxEvent::Closed(Some(e))
                }
            };
            let _ = event_tx.send(event);
        });

        (handle, event_rx)
    }

    async fn run(&mut self) -> Result<(), MuxError> {
        debug!("Multiplexer I/O loop started");

        loop {
            tokio::select! {
                item = self.outbound_rx.recv() => {
                    match item {
                        Some(Outbound::Shutdown) | None => {
                            let _ = self.transport.close().await;
                            debug!("Multiplexer I/O loop shut down");
                            return Ok(());
                        }
                        Some(item) => self.write_outbound(item).await?,
                    }
                }
                chunk = self.transport.recv() => {
                    match chunk? {
                        Some(data) => {
                            self.decoder.extend(&data);
                            while let Some(frame) = self.decoder.decode()? {
                                self.dispatch(frame).await?;
                            }
                        }
                        None => {
                            return Err(MuxError::Transport(TransportError::ConnectionClosed));
                        }
                    }
                }
            }
        }
    }

    async fn write_outbound(&mut self, item: Outbound) -> Result<(), MuxError> {
        let frame = match item {
            Outbound::Data {
                stream_id,
                payload,
                fin,
            } => {
                let Some(entry) = self.streams.get_mut(&stream_id) else {
                    trace!(stream_id, "Dropping write for closed stream");
                    return Ok(());
                };

                let mut flags = FrameFlags::new();
                if fin {
                    entry.local_fin = true;
                    flags = flags.with_fin();
                    let finished = entry.remote_fin;
                    if finished {
                        self.streams.remove(&stream_id);
                        debug!(stream_id, "Stream finished in both directions");
                    }
                }

                Frame::data(stream_id, payload).with_flags(flags)
            }
            Outbound::Close { stream_id, reason } => {
                if self.streams.remove(&stream_id).is_none() {
                    // Remote closed first; nothing left to tell the relay.
                    return Ok(());
                }
                debug!(stream_id, reason = ?reason, "Closing stream");
                match reason {
                    Some(reason) => Frame::close_with_reason(stream_id, &reason),
                    None => Frame::close(stream_id),
                }
            }
            Outbound::Control(msg) => Frame::data(CONTROL_STREAM_ID, msg.encode()?),
            Outbound::Ping { timestamp_ms } => Frame::ping(timestamp_ms),
            Outbound::Shutdown => return Ok(()),
        };

        let encoded = frame.encode()?;
        self.transport.send(encoded).await?;
        Ok(())
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<(), MuxError> {
        trace!(
            stream_id = frame.stream_id,
            kind = ?frame.kind,
            len = frame.payload.len(),
            "Inbound frame"
        );

        if frame.stream_id == CONTROL_STREAM_ID {
            return self.dispatch_control(frame).await;
        }

        match frame.kind {
            FrameKind::Open => self.open_stream(frame),
            FrameKind::Data => self.stream_data(frame),
            FrameKind::Close => self.close_remote(frame),
            kind => Err(MuxError::UnexpectedFrame {
                stream_id: frame.stream_id,
                kind,
            }),
        }
    }

    async fn dispatch_control(&mut self, frame: Frame) -> Result<(), MuxError> {
        match frame.kind {
            FrameKind::Data => {
                let msg = ControlMessage::decode(&frame.payload)?;
                let _ = self.event_tx.send(MuxEvent::Control(msg));
                Ok(())
            }
            FrameKind::Ping => {
                let pong = Frame::pong(frame.timestamp().unwrap_or(0));
                self.transport.send(pong.encode()?).await?;
                Ok(())
            }
            FrameKind::Pong => {
                *self.last_pong.lock().unwrap() = Instant::now();
                trace!(timestamp = ?frame.timestamp(), "Pong received");
                Ok(())
            }
            FrameKind::Error => {
                let reason = frame.reason().unwrap_or_else(|| "unspecified".to_string());
                warn!(reason = %reason, "Relay reported a session error");
                let _ = self.event_tx.send(MuxEvent::RemoteError(reason));
                Ok(())
            }
            kind => Err(MuxError::UnexpectedFrame {
                stream_id: CONTROL_STREAM_ID,
                kind,
            }),
        }
    }

    fn open_stream(&mut self, frame: Frame) -> Result<(), MuxError> {
        let stream_id = frame.stream_id;

        // Stream ids are relay-assigned and monotonic; anything at or below
        // the high-water mark is a reuse.
        if stream_id <= self.highest_stream_id {
            return Err(MuxError::StreamReused(stream_id));
        }
        self.highest_stream_id = stream_id;

        let Some(outbound_tx) = self.outbound_weak.upgrade() else {
            trace!(stream_id, "Session handle is gone; ignoring open");
            return Ok(());
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.insert(
            stream_id,
            StreamEntry {
                tx,
                local_fin: false,
                remote_fin: false,
            },
        );

        debug!(stream_id, "Relay opened stream");

        let stream = RemoteStream {
            stream_id,
            rx,
            handle: MuxHandle {
                tx: outbound_tx,
                last_pong: self.last_pong.clone(),
            },
        };
        if self
            .event_tx
            .send(MuxEvent::IncomingStream(stream))
            .is_err()
        {
            // Session receiver is gone; drop the stream again.
            self.streams.remove(&stream_id);
        }
        Ok(())
    }

    fn stream_data(&mut self, frame: Frame) -> Result<(), MuxError> {
        let stream_id = frame.stream_id;
        let fin = frame.flags.has_fin();

        let Some(entry) = self.streams.get_mut(&stream_id) else {
            if stream_id <= self.highest_stream_id {
                // Frames racing a local close; drop them.
                trace!(stream_id, "Data for closed stream dropped");
                return Ok(());
            }
            return Err(MuxError::UnknownStream(stream_id));
        };

        if !frame.payload.is_empty() {
            let _ = entry.tx.send(StreamEvent::Data(frame.payload));
        }

        if fin {
            entry.remote_fin = true;
            let _ = entry.tx.send(StreamEvent::Fin);
            if entry.local_fin {
                self.streams.remove(&stream_id);
                debug!(stream_id, "Stream finished in both directions");
            }
        }

        Ok(())
    }

    fn close_remote(&mut self, frame: Frame) -> Result<(), MuxError> {
        let stream_id = frame.stream_id;
        match self.streams.remove(&stream_id) {
            Some(entry) => {
                let reason = frame.reason();
                debug!(stream_id, reason = ?reason, "Relay closed stream");
                let _ = entry.tx.send(StreamEvent::Closed { reason });
                Ok(())
            }
            None if stream_id <= self.highest_stream_id => Ok(()),
            None => Err(MuxError::UnknownStream(stream_id)),
        }
    }
}
