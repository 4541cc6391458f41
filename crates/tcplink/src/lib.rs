//! Bidirectional TCP client/server connections with signal-based events.
//!
//! This crate manages raw socket lifecycles for both roles:
//!
//! - **Client**: [`TcpClient`] owns one outbound connection, retries the
//!   connect until it succeeds, serializes sends and optionally reconnects
//!   when the peer drops it
//! - **Server**: [`TcpServer`] accepts connections into a concurrent
//!   registry, supports unicast and broadcast sends and evicts idle clients
//!
//! Both publish `connected`, `disconnected` and `data_received` signals.
//! Transport faults are classified at the I/O boundary (see [`fault`]) and
//! never surface through the public API, except for the rare unrecoverable
//! ones, which go to a configurable [`Supervisor`].
//!
//! # Example
//!
//! ```no_run
//! use tcplink::{ClientConfig, ServerConfig, TcpClient, TcpServer};
//!
//! let server = TcpServer::new(ServerConfig::new("127.0.0.1", 0));
//! let addr = server.start()?;
//!
//! let client = TcpClient::new(ClientConfig::new("127.0.0.1", addr.port()));
//! client.data_received().connect(|event| println!("{}", event.text));
//! client.open()?;
//! client.send_text("ping\r\n")?;
//!
//! server.broadcast_text("hi\r\n");
//!
//! client.close();
//! server.stop();
//! # Ok::<(), tcplink::NetworkError>(())
//! ```
//!
//! # Framing
//!
//! Typed sends (`send_object`) append the configured delimiter. Received
//! bytes are delivered exactly as each read returns them: there is no
//! reassembly on the receiving side.

mod client;
mod config;
mod connection;
mod error;
mod event;
pub mod fault;
mod registry;
mod serializer;
mod server;
mod state;

pub use client::TcpClient;
pub use config::{ClientConfig, DEFAULT_DELIMITER, ServerConfig, TcpSocketConfig, TextEncoding};
pub use connection::ConnectionId;
pub use error::{NetworkError, Result};
pub use event::{ConnectionEvent, DataReceived, DisconnectEvent, DisconnectReason};
pub use fault::{ExitSupervisor, FaultAction, FaultKind, FaultReport, LogSupervisor, Supervisor};
pub use serializer::{JsonSerializer, PayloadSerializer, frame};
pub use server::TcpServer;
pub use state::{ClientState, ServerState};

pub use tcplink_core::{AsyncRuntime, AsyncRuntimeConfig, Signal, SlotGuard, SlotId};
