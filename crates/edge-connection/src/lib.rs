//! Relay Connection Layer
//!
//! Everything between the wire protocol and the session state machine: the
//! transport seam, the stream multiplexer that shares one physical
//! connection among many logical streams, and the reconnect backoff policy.

pub mod multiplexer;
pub mod reconnect;
pub mod tcp;
pub mod transport;

pub use multiplexer::{
    MuxConfig, MuxError, MuxEvent, MuxHandle, MuxedConnection, RemoteStream, StreamEvent,
};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use tcp::TcpTransport;
pub use transport::{Transport, TransportError};
