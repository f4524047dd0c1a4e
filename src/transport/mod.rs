//! Client transport layer.
//!
//! A single persistent TCP connection with split read and write loops, an
//! exponential-backoff reconnector and a keepalive watchdog. Lifecycle and
//! traffic are published to exactly one subscriber as [`TransportEvent`]s.

mod heartbeat;
mod reconnect;
mod tcp;

pub use heartbeat::{Heartbeat, HeartbeatConfig};
pub use reconnect::{ReconnectConfig, Reconnector};
pub use tcp::{TcpClient, SEND_QUEUE_CAPACITY};

use std::fmt;
use std::net::SocketAddr;

use crate::frame::Packet;

/// Connection state of a [`TcpClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Disconnected => "disconnected",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Events published by the transport to its subscriber.
#[derive(Debug)]
pub enum TransportEvent {
    /// A connection was established.
    Connected { peer: SocketAddr },
    /// The connection was lost (I/O error, peer close or watchdog timeout).
    Disconnected { error: String },
    /// A frame was decoded from the wire. Delivered in wire order.
    Frame(Packet),
    /// The reconnector exhausted its retry budget.
    ReconnectGaveUp { retries: u32 },
}
