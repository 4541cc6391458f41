//! State enums for client sessions and servers.

/// Current state of a client session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientState {
    /// Not connected to any server.
    #[default]
    Disconnected,
    /// The connect loop is running.
    Connecting,
    /// Connected and ready to send/receive data.
    Connected,
    /// `close` has been called; queued sends are being discarded.
    ShuttingDown,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// Current state of a server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServerState {
    /// Server is not running.
    #[default]
    Stopped,
    /// Server is binding its listener.
    Starting,
    /// Server is accepting connections.
    Running,
    /// Server is shutting down.
    Stopping,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}
