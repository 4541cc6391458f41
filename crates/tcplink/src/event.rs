//! Notification payloads and the signal bundle both roles publish through.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use tcplink_core::Signal;

use crate::connection::ConnectionId;
use crate::fault::FaultKind;

/// A connection came up.
#[derive(Clone, Debug)]
pub struct ConnectionEvent {
    /// The connection's identifier. Servers accept unicast sends to it.
    pub connection: ConnectionId,
    /// The remote endpoint.
    pub endpoint: SocketAddr,
    /// When the connection was established.
    pub timestamp: DateTime<Utc>,
}

/// Why a connection went away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `close` or `disconnect` was called.
    Requested,
    /// The peer closed its side.
    PeerClosed,
    /// No data arrived within the idle threshold.
    IdleTimeout,
    /// A transport fault terminated the connection.
    Fault(FaultKind),
    /// The owning server stopped.
    Shutdown,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::PeerClosed => write!(f, "peer closed"),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::Fault(kind) => write!(f, "fault ({kind})"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// A connection went away.
#[derive(Clone, Debug)]
pub struct DisconnectEvent {
    /// The connection's identifier, now retired.
    pub connection: ConnectionId,
    /// The remote endpoint.
    pub endpoint: SocketAddr,
    /// When the disconnect was observed.
    pub timestamp: DateTime<Utc>,
    /// Why it happened.
    pub reason: DisconnectReason,
}

/// Bytes arrived on a connection.
///
/// `text` is exactly one read's worth of bytes, decoded. No reassembly on
/// delimiters is done.
#[derive(Clone, Debug)]
pub struct DataReceived {
    /// The connection the data arrived on.
    pub connection: ConnectionId,
    /// The decoded text.
    pub text: String,
    /// The remote endpoint that sent it.
    pub source: SocketAddr,
}

/// Fan-out of lifecycle and data notifications.
///
/// Slots run on the completion task that produced the event, so they should
/// return quickly. A panicking slot is treated as a completion-layer fault.
#[derive(Debug, Default)]
pub(crate) struct Notifications {
    pub(crate) connected: Signal<ConnectionEvent>,
    pub(crate) disconnected: Signal<DisconnectEvent>,
    pub(crate) data_received: Signal<DataReceived>,
}

impl Notifications {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}
