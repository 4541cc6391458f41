//! Configuration types for the client and server.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::fault::{ExitSupervisor, Supervisor};

/// Default delimiter appended after typed payloads.
pub const DEFAULT_DELIMITER: &str = "\r\n";

/// Text encoding used to turn received bytes into text and text into bytes.
///
/// Characters (or bytes) the encoding cannot represent are replaced with
/// `?` on encode and with `?` or U+FFFD on decode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TextEncoding {
    /// UTF-8. Invalid sequences decode to U+FFFD.
    #[default]
    Utf8,
    /// 7-bit US-ASCII.
    Ascii,
    /// ISO-8859-1, one byte per code point up to U+00FF.
    Latin1,
}

impl TextEncoding {
    /// Encode text into bytes.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            Self::Utf8 => text.as_bytes().to_vec(),
            Self::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
            Self::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }

    /// Decode bytes into text.
    ///
    /// Decoding happens per read, so a multi-byte UTF-8 sequence split across
    /// two reads decodes as replacement characters on both sides.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Ascii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { '?' })
                .collect(),
            Self::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Utf8 => write!(f, "utf-8"),
            Self::Ascii => write!(f, "us-ascii"),
            Self::Latin1 => write!(f, "iso-8859-1"),
        }
    }
}

/// Socket-level options shared by client and accepted connections.
#[derive(Clone, Debug)]
pub struct TcpSocketConfig {
    /// Enable TCP_NODELAY (disable Nagle's algorithm).
    pub no_delay: bool,
    /// Enable SO_KEEPALIVE.
    pub keep_alive: bool,
    /// Receive buffer size in bytes. Each read delivers at most this much.
    pub read_buffer_size: usize,
    /// How long a single connect attempt may take before the next one starts.
    pub connect_timeout: Duration,
    /// Write timeout. `None` means a write may wait forever for the peer.
    pub write_timeout: Option<Duration>,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self {
            no_delay: false,
            keep_alive: false,
            read_buffer_size: 8192,
            connect_timeout: Duration::from_secs(1),
            write_timeout: None,
        }
    }
}

impl TcpSocketConfig {
    /// Create a new socket configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable TCP_NODELAY.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = enabled;
        self
    }

    /// Enable or disable SO_KEEPALIVE.
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }

    /// Set the receive buffer size.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Set the per-attempt connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the write timeout.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }
}

/// Configuration for a [`TcpClient`](crate::TcpClient).
#[derive(Clone)]
pub struct ClientConfig {
    /// The host to connect to.
    pub host: String,
    /// The port to connect to.
    pub port: u16,
    /// Socket-level options.
    pub socket: TcpSocketConfig,
    /// Encoding for text sends and received data.
    pub encoding: TextEncoding,
    /// Delimiter appended after typed payloads.
    pub delimiter: String,
    /// Reconnect automatically when the remote side resets the connection
    /// or closes it.
    pub reconnect_on_disconnect: bool,
    /// Receives faults that cannot be handled in-process.
    pub supervisor: Arc<dyn Supervisor>,
}

impl ClientConfig {
    /// Create a new client configuration.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            socket: TcpSocketConfig::default(),
            encoding: TextEncoding::default(),
            delimiter: DEFAULT_DELIMITER.to_string(),
            reconnect_on_disconnect: false,
            supervisor: Arc::new(ExitSupervisor::default()),
        }
    }

    /// Set socket options.
    pub fn socket_config(mut self, config: TcpSocketConfig) -> Self {
        self.socket = config;
        self
    }

    /// Enable TCP_NODELAY.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.socket.no_delay = enabled;
        self
    }

    /// Set the per-attempt connect timeout (also the retry interval).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.socket.connect_timeout = timeout;
        self
    }

    /// Set the text encoding.
    pub fn encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Set the typed-payload delimiter.
    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    /// Enable or disable reconnect-on-disconnect.
    pub fn reconnect_on_disconnect(mut self, enabled: bool) -> Self {
        self.reconnect_on_disconnect = enabled;
        self
    }

    /// Set the supervisor that receives unrecoverable faults.
    pub fn supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Get the address string (host:port).
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("address", &self.address())
            .field("socket", &self.socket)
            .field("encoding", &self.encoding)
            .field("delimiter", &self.delimiter)
            .field("reconnect_on_disconnect", &self.reconnect_on_disconnect)
            .field("supervisor", &self.supervisor)
            .finish()
    }
}

/// Configuration for a [`TcpServer`](crate::TcpServer).
#[derive(Clone)]
pub struct ServerConfig {
    /// The address to bind to.
    pub bind_address: String,
    /// The port to listen on. Use 0 to let the OS pick one.
    pub port: u16,
    /// Socket-level options for accepted connections.
    pub socket: TcpSocketConfig,
    /// Encoding for text sends and received data.
    pub encoding: TextEncoding,
    /// Delimiter appended after typed payloads.
    pub delimiter: String,
    /// Pending-connection backlog.
    pub backlog: u32,
    /// Set SO_REUSEADDR on the listener.
    pub reuse_address: bool,
    /// SO_LINGER on the listener. `None` keeps the OS default.
    pub linger: Option<Duration>,
    /// Connections silent for longer than this are disconnected.
    pub client_timeout: Duration,
    /// How often the idle sweep runs.
    pub sweep_interval: Duration,
    /// How long `stop` waits for connections to close on their own.
    pub stop_grace: Duration,
    /// Receives faults that cannot be handled in-process.
    pub supervisor: Arc<dyn Supervisor>,
}

impl ServerConfig {
    /// Create a new server configuration.
    pub fn new(bind_address: impl Into<String>, port: u16) -> Self {
        Self {
            bind_address: bind_address.into(),
            port,
            socket: TcpSocketConfig::default(),
            encoding: TextEncoding::default(),
            delimiter: DEFAULT_DELIMITER.to_string(),
            backlog: 1000,
            reuse_address: false,
            linger: None,
            client_timeout: Duration::from_millis(1_020_000),
            sweep_interval: Duration::from_secs(1),
            stop_grace: Duration::from_secs(2),
            supervisor: Arc::new(ExitSupervisor::default()),
        }
    }

    /// Set socket options for accepted connections.
    pub fn socket_config(mut self, config: TcpSocketConfig) -> Self {
        self.socket = config;
        self
    }

    /// Enable TCP_NODELAY for accepted connections.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.socket.no_delay = enabled;
        self
    }

    /// Set the text encoding.
    pub fn encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Set the typed-payload delimiter.
    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    /// Set the connection backlog size.
    pub fn backlog(mut self, size: u32) -> Self {
        self.backlog = size;
        self
    }

    /// Enable or disable SO_REUSEADDR.
    pub fn reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }

    /// Set SO_LINGER on the listener.
    pub fn linger(mut self, linger: Duration) -> Self {
        self.linger = Some(linger);
        self
    }

    /// Set the idle-disconnect threshold.
    pub fn client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    /// Set the idle sweep tick.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the grace period `stop` allows before forcing connections closed.
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Set the supervisor that receives unrecoverable faults.
    pub fn supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Get the bind address string (address:port).
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr())
            .field("socket", &self.socket)
            .field("encoding", &self.encoding)
            .field("delimiter", &self.delimiter)
            .field("backlog", &self.backlog)
            .field("reuse_address", &self.reuse_address)
            .field("linger", &self.linger)
            .field("client_timeout", &self.client_timeout)
            .field("sweep_interval", &self.sweep_interval)
            .field("stop_grace", &self.stop_grace)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encodings_round_trip_ascii_text() {
        for encoding in [TextEncoding::Utf8, TextEncoding::Ascii, TextEncoding::Latin1] {
            let bytes = encoding.encode("ping\r\n");
            assert_eq!(bytes, b"ping\r\n");
            assert_eq!(encoding.decode(&bytes), "ping\r\n");
        }
    }

    #[test]
    fn test_unrepresentable_characters() {
        assert_eq!(TextEncoding::Ascii.encode("héllo"), b"h?llo");
        assert_eq!(TextEncoding::Latin1.encode("é€"), vec![0xE9, b'?']);
        assert_eq!(TextEncoding::Ascii.decode(&[b'a', 0xFF]), "a?");
        assert_eq!(TextEncoding::Latin1.decode(&[0xE9]), "é");
        assert_eq!(TextEncoding::Utf8.decode(&[0xC3]), "\u{FFFD}");
    }

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::new("localhost", 8080);
        assert_eq!(config.address(), "localhost:8080");
        assert_eq!(config.delimiter, "\r\n");
        assert_eq!(config.encoding, TextEncoding::Utf8);
        assert!(!config.reconnect_on_disconnect);
        assert_eq!(config.socket.connect_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfig::new("127.0.0.1", 9000)
            .no_delay(true)
            .connect_timeout(Duration::from_millis(250))
            .encoding(TextEncoding::Latin1)
            .delimiter("\n")
            .reconnect_on_disconnect(true);

        assert!(config.socket.no_delay);
        assert_eq!(config.socket.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.encoding, TextEncoding::Latin1);
        assert_eq!(config.delimiter, "\n");
        assert!(config.reconnect_on_disconnect);
    }

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::new("0.0.0.0", 9000);
        assert_eq!(config.bind_addr(), "0.0.0.0:9000");
        assert_eq!(config.backlog, 1000);
        assert!(!config.reuse_address);
        assert_eq!(config.linger, None);
        assert_eq!(config.client_timeout, Duration::from_secs(1020));
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_server_config_builder() {
        let config = ServerConfig::new("127.0.0.1", 0)
            .backlog(16)
            .reuse_address(true)
            .linger(Duration::from_secs(1))
            .client_timeout(Duration::from_secs(2))
            .sweep_interval(Duration::from_millis(100))
            .stop_grace(Duration::ZERO);

        assert_eq!(config.backlog, 16);
        assert!(config.reuse_address);
        assert_eq!(config.linger, Some(Duration::from_secs(1)));
        assert_eq!(config.client_timeout, Duration::from_secs(2));
        assert_eq!(config.sweep_interval, Duration::from_millis(100));
        assert_eq!(config.stop_grace, Duration::ZERO);
    }

    #[test]
    fn test_read_buffer_size_never_zero() {
        assert_eq!(TcpSocketConfig::new().read_buffer_size(0).read_buffer_size, 1);
    }
}
