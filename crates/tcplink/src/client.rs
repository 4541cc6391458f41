//! TCP client session with signal-based event delivery.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tcplink_core::logging::{span_names, targets};
use tcplink_core::{AsyncRuntime, Gate, Signal, block_on};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tracing::Instrument;

use crate::Result;
use crate::config::ClientConfig;
use crate::connection::{ConnectionState, ReceiveEnd};
use crate::error::NetworkError;
use crate::event::{ConnectionEvent, DataReceived, DisconnectEvent, DisconnectReason, Notifications};
use crate::fault::{
    Fault, FaultAction, FaultKind, FaultReport, Operation, Subsystem, spawn_supervised,
};
use crate::serializer::{JsonSerializer, PayloadSerializer, frame};
use crate::state::ClientState;

/// A TCP client session.
///
/// The session owns at most one outbound connection at a time. Opening runs
/// a connect loop that retries until it succeeds or the session is closed;
/// sends are queued and written one at a time in FIFO order; received bytes
/// are published through [`data_received`](Self::data_received) as they
/// arrive.
///
/// The blocking methods ([`open`](Self::open), [`send`](Self::send),
/// [`close`](Self::close)) wait for the matching I/O completion. Each has an
/// `*_async` counterpart for use inside async code.
///
/// # Signals
///
/// - [`connected`](Self::connected): Emitted when the connection is established
/// - [`disconnected`](Self::disconnected): Emitted when the connection is closed or lost
/// - [`data_received`](Self::data_received): Emitted for every successful read
///
/// # Example
///
/// ```no_run
/// use tcplink::{ClientConfig, TcpClient};
///
/// let client = TcpClient::new(
///     ClientConfig::new("127.0.0.1", 8080).reconnect_on_disconnect(true),
/// );
///
/// client.data_received().connect(|event| println!("<- {}", event.text));
///
/// client.open()?;
/// client.send_text("ping\r\n")?;
/// client.close();
/// # Ok::<(), tcplink::NetworkError>(())
/// ```
pub struct TcpClient {
    shared: Arc<ClientShared>,
}

struct ClientShared {
    config: ClientConfig,
    handle: Handle,
    notifications: Notifications,
    state: Mutex<ClientState>,
    session: Mutex<Option<Arc<ConnectionState>>>,
    /// Set exactly while `session` holds a connection.
    connected: Gate,
    /// Set once `close` is requested, releasing anyone waiting for a connection.
    closing: Gate,
    shutting_down: AtomicBool,
    connecting: AtomicBool,
}

impl TcpClient {
    /// Create a new client that runs its I/O on the global runtime.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_handle(config, AsyncRuntime::global().handle().clone())
    }

    /// Create a new client that runs its I/O on the given runtime.
    pub fn with_handle(config: ClientConfig, handle: Handle) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                config,
                handle,
                notifications: Notifications::new(),
                state: Mutex::new(ClientState::Disconnected),
                session: Mutex::new(None),
                connected: Gate::closed(),
                closing: Gate::closed(),
                shutting_down: AtomicBool::new(false),
                connecting: AtomicBool::new(false),
            }),
        }
    }

    /// Get the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Signal emitted when the connection is established.
    pub fn connected(&self) -> &Signal<ConnectionEvent> {
        &self.shared.notifications.connected
    }

    /// Signal emitted when the connection is closed or lost.
    pub fn disconnected(&self) -> &Signal<DisconnectEvent> {
        &self.shared.notifications.disconnected
    }

    /// Signal emitted for every successful read.
    pub fn data_received(&self) -> &Signal<DataReceived> {
        &self.shared.notifications.data_received
    }

    /// Get the current session state.
    pub fn state(&self) -> ClientState {
        *self.shared.state.lock()
    }

    /// Check if the client is connected.
    pub fn is_connected(&self) -> bool {
        self.shared.session.lock().is_some()
    }

    /// The remote endpoint of the current connection.
    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.shared.session.lock().as_ref().map(|s| s.remote_addr())
    }

    /// The local address of the current connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.session.lock().as_ref().map(|s| s.local_addr())
    }

    /// Bytes written on the current connection.
    pub fn bytes_sent(&self) -> u64 {
        self.shared
            .session
            .lock()
            .as_ref()
            .map_or(0, |s| s.bytes_sent())
    }

    /// Connect to the configured endpoint, blocking until connected.
    ///
    /// Retries forever, one attempt per connect timeout, until a connection
    /// is made or [`close`](Self::close) is called from another thread.
    /// Returns immediately if already connected.
    pub fn open(&self) -> Result<()> {
        block_on(&self.shared.handle, self.open_async())
    }

    /// Async variant of [`open`](Self::open).
    pub async fn open_async(&self) -> Result<()> {
        self.shared.shutting_down.store(false, Ordering::Release);
        self.shared.closing.reset();
        self.shared.connect_loop().await
    }

    /// Close the connection, blocking until the socket is released.
    ///
    /// Waits for an in-flight write, half-closes the socket and emits
    /// [`disconnected`](Self::disconnected). Safe to call when not connected.
    pub fn close(&self) {
        block_on(&self.shared.handle, self.close_async())
    }

    /// Async variant of [`close`](Self::close).
    pub async fn close_async(&self) {
        self.shared.close().await
    }

    /// Send raw bytes.
    ///
    /// Blocks until a connection exists, then queues `data`. If no other
    /// caller is writing, this call writes the whole queue before returning.
    /// Transport faults are handled internally and never returned.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        block_on(&self.shared.handle, self.send_async(data))
    }

    /// Async variant of [`send`](Self::send).
    pub async fn send_async(&self, data: impl Into<Bytes>) -> Result<()> {
        let shared = &self.shared;
        let state = shared.current_session().await?;
        state.enqueue(data.into());

        if let Err(fault) = state.drain(&shared.shutting_down).await {
            let reason = DisconnectReason::Fault(fault.kind);
            shared.handle_fault(&state, fault, reason).await;
        }
        Ok(())
    }

    /// Send text encoded with the configured encoding.
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send(self.shared.config.encoding.encode(text))
    }

    /// Send a value as JSON followed by the configured delimiter.
    pub fn send_object<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        self.send_serialized(&JsonSerializer, value)
    }

    /// Send a value serialized by `serializer`, followed by the delimiter.
    pub fn send_serialized<S, T>(&self, serializer: &S, value: &T) -> Result<()>
    where
        S: PayloadSerializer,
        T: Serialize + ?Sized,
    {
        let payload = serializer.serialize(value)?;
        let config = &self.shared.config;
        self.send(frame(&payload, &config.encoding.encode(&config.delimiter)))
    }
}

impl ClientShared {
    fn set_state(&self, state: ClientState) {
        *self.state.lock() = state;
    }

    async fn current_session(&self) -> Result<Arc<ConnectionState>> {
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(NetworkError::ShuttingDown);
            }
            if let Some(state) = self.session.lock().clone() {
                return Ok(state);
            }
            tokio::select! {
                _ = self.connected.wait() => {}
                _ = self.closing.wait() => {}
            }
        }
    }

    async fn connect_loop(self: &Arc<Self>) -> Result<()> {
        if self.session.lock().is_some() {
            return Ok(());
        }
        if self
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another caller owns the loop; wait for its outcome.
            self.current_session().await?;
            return Ok(());
        }
        let _claim = ConnectClaim(&self.connecting);

        self.set_state(ClientState::Connecting);
        let address = self.config.address();
        let span = tracing::debug_span!(
            target: targets::CLIENT,
            span_names::CONNECT,
            address = %address
        );

        async {
            let mut attempt: u64 = 0;
            loop {
                if self.shutting_down.load(Ordering::Acquire) {
                    return Err(NetworkError::ShuttingDown);
                }
                attempt += 1;
                let started = Instant::now();

                let fault = match self.connect_once(&address).await {
                    Ok(stream) => {
                        match ConnectionState::new(stream, &self.config.socket, Operation::Connect) {
                            Ok((state, reader)) => return self.install(state, reader),
                            Err(fault) => fault,
                        }
                    }
                    Err(fault) => fault,
                };

                match fault.action(self.config.reconnect_on_disconnect) {
                    FaultAction::TerminateProcess => {
                        let message = fault.to_string();
                        self.escalate(fault);
                        return Err(NetworkError::Escalated(message));
                    }
                    action => {
                        tracing::debug!(
                            target: targets::CLIENT,
                            attempt,
                            kind = %fault.kind,
                            %action,
                            "connect attempt failed: {}",
                            fault.message
                        );
                    }
                }

                let pause = self
                    .config
                    .socket
                    .connect_timeout
                    .saturating_sub(started.elapsed());
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = self.closing.wait() => {}
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn connect_once(&self, address: &str) -> std::result::Result<TcpStream, Fault> {
        let wait = self.config.socket.connect_timeout;
        match tokio::time::timeout(wait, connect_stream(address, self.config.socket.keep_alive))
            .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Fault::from_io(Operation::Connect, &e)),
            Err(_) => Err(Fault::timed_out(Operation::Connect)),
        }
    }

    fn install(self: &Arc<Self>, state: Arc<ConnectionState>, reader: OwnedReadHalf) -> Result<()> {
        {
            let mut session = self.session.lock();
            if self.shutting_down.load(Ordering::Acquire) {
                drop(session);
                self.handle.spawn(async move {
                    state.dispose().await;
                });
                return Err(NetworkError::ShuttingDown);
            }
            *session = Some(state.clone());
            self.connected.set();
            self.set_state(ClientState::Connected);
        }

        tracing::debug!(
            target: targets::CLIENT,
            connection = %state.id(),
            endpoint = %state.remote_addr(),
            "connected"
        );
        self.notifications.connected.emit(ConnectionEvent {
            connection: state.id(),
            endpoint: state.remote_addr(),
            timestamp: state.connected_at(),
        });

        self.spawn_receive(state, reader);
        Ok(())
    }

    fn spawn_receive(self: &Arc<Self>, state: Arc<ConnectionState>, reader: OwnedReadHalf) {
        let shared = self.clone();
        let supervisor = self.clone();
        spawn_supervised(
            &self.handle,
            async move {
                let connection = state.id();
                let source = state.remote_addr();
                let end = state
                    .receive(
                        reader,
                        shared.config.socket.read_buffer_size,
                        shared.config.encoding,
                        |text| {
                            shared.notifications.data_received.emit(DataReceived {
                                connection,
                                text,
                                source,
                            })
                        },
                    )
                    .await;
                shared.receive_ended(&state, end).await;
            },
            move |fault| supervisor.escalate(fault),
        );
    }

    async fn receive_ended(self: &Arc<Self>, state: &Arc<ConnectionState>, end: ReceiveEnd) {
        match end {
            ReceiveEnd::Cancelled => {}
            ReceiveEnd::PeerClosed => {
                let fault = Fault::new(
                    FaultKind::Reset,
                    Operation::Receive,
                    "connection closed by peer",
                );
                self.handle_fault(state, fault, DisconnectReason::PeerClosed)
                    .await;
            }
            ReceiveEnd::Fault(fault) => {
                let reason = DisconnectReason::Fault(fault.kind);
                self.handle_fault(state, fault, reason).await;
            }
        }
    }

    async fn handle_fault(
        self: &Arc<Self>,
        state: &Arc<ConnectionState>,
        fault: Fault,
        reason: DisconnectReason,
    ) {
        let action = fault.action(self.config.reconnect_on_disconnect);
        match action {
            FaultAction::TransientIgnore => {
                tracing::trace!(target: targets::FAULT, %fault, "ignored");
            }
            FaultAction::TerminateProcess => self.escalate(fault),
            FaultAction::Reconnect | FaultAction::TerminateConnection => {
                if reason == DisconnectReason::PeerClosed {
                    tracing::debug!(
                        target: targets::CLIENT,
                        connection = %state.id(),
                        %action,
                        "peer closed the connection"
                    );
                } else {
                    tracing::warn!(
                        target: targets::CLIENT,
                        connection = %state.id(),
                        operation = %fault.operation,
                        kind = %fault.kind,
                        %action,
                        "connection fault: {}",
                        fault.message
                    );
                }
                self.connection_lost(state, reason, action == FaultAction::Reconnect)
                    .await;
            }
        }
    }

    /// Tear down `state` if it is still the current session.
    async fn connection_lost(
        self: &Arc<Self>,
        state: &Arc<ConnectionState>,
        reason: DisconnectReason,
        reconnect: bool,
    ) {
        let current = {
            let mut session = self.session.lock();
            match session.as_ref() {
                Some(current) if Arc::ptr_eq(current, state) => {
                    self.connected.reset();
                    let mut client_state = self.state.lock();
                    if *client_state != ClientState::ShuttingDown {
                        *client_state = ClientState::Disconnected;
                    }
                    session.take()
                }
                // Already torn down by close or an earlier fault.
                _ => None,
            }
        };
        let Some(state) = current else {
            return;
        };

        state.dispose().await;
        self.notifications.disconnected.emit(DisconnectEvent {
            connection: state.id(),
            endpoint: state.remote_addr(),
            timestamp: chrono::Utc::now(),
            reason,
        });

        if reconnect && !self.shutting_down.load(Ordering::Acquire) {
            tracing::debug!(target: targets::CLIENT, "reconnecting");
            let shared = self.clone();
            let supervisor = self.clone();
            spawn_supervised(
                &self.handle,
                async move {
                    if let Err(e) = shared.connect_loop().await {
                        tracing::debug!(target: targets::CLIENT, error = %e, "reconnect abandoned");
                    }
                },
                move |fault| supervisor.escalate(fault),
            );
        }
    }

    async fn close(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.closing.set();
        self.set_state(ClientState::ShuttingDown);

        let session = {
            let mut session = self.session.lock();
            self.connected.reset();
            session.take()
        };

        if let Some(state) = session
            && state.dispose().await
        {
            tracing::debug!(
                target: targets::CLIENT,
                connection = %state.id(),
                "closed"
            );
            self.notifications.disconnected.emit(DisconnectEvent {
                connection: state.id(),
                endpoint: state.remote_addr(),
                timestamp: chrono::Utc::now(),
                reason: DisconnectReason::Requested,
            });
        }

        self.set_state(ClientState::Disconnected);
    }

    /// Hand an unrecoverable fault to the supervisor, then shut down.
    fn escalate(self: &Arc<Self>, fault: Fault) {
        let endpoint = self.session.lock().as_ref().map(|s| s.remote_addr());
        tracing::error!(
            target: targets::FAULT,
            subsystem = %Subsystem::Client,
            endpoint = ?endpoint,
            %fault,
            "escalating"
        );
        self.config
            .supervisor
            .escalate(&FaultReport::new(fault, Subsystem::Client, endpoint));

        let shared = self.clone();
        self.handle.spawn(async move { shared.close().await });
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        self.shared.closing.set();
        let session = {
            let mut session = self.shared.session.lock();
            self.shared.connected.reset();
            session.take()
        };
        if let Some(state) = session {
            self.shared.handle.spawn(async move {
                state.dispose().await;
            });
        }
    }
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("address", &self.shared.config.address())
            .field("state", &self.state())
            .finish()
    }
}

/// Clears the connect-loop claim when the loop exits.
struct ConnectClaim<'a>(&'a AtomicBool);

impl Drop for ConnectClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Resolve `address` and try each result in turn.
async fn connect_stream(address: &str, keep_alive: bool) -> std::io::Result<TcpStream> {
    let mut last_error = None;
    for addr in tokio::net::lookup_host(address).await? {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(keep_alive)?;
        match socket.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{address} did not resolve to any address"),
        )
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_client_is_disconnected() {
        let client = TcpClient::new(ClientConfig::new("127.0.0.1", 1));
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(!client.is_connected());
        assert_eq!(client.remote_endpoint(), None);
        assert_eq!(client.bytes_sent(), 0);
    }

    #[test]
    fn test_close_without_connection_is_noop() {
        let client = TcpClient::new(ClientConfig::new("127.0.0.1", 1));
        let disconnects = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = disconnects.clone();
        client.disconnected().connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        client.close();
        client.close();
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[test]
    fn test_send_after_close_fails_fast() {
        let client = TcpClient::new(ClientConfig::new("127.0.0.1", 1));
        client.close();
        assert!(matches!(
            client.send_text("late"),
            Err(NetworkError::ShuttingDown)
        ));
    }

    #[test]
    fn test_close_stops_connect_loop() {
        // The listener is dropped right away, so every attempt is refused.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = Arc::new(TcpClient::new(
            ClientConfig::new("127.0.0.1", port).connect_timeout(Duration::from_millis(50)),
        ));

        let opener = {
            let client = client.clone();
            std::thread::spawn(move || client.open())
        };

        for _ in 0..100 {
            if client.state() == ClientState::Connecting {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(client.state(), ClientState::Connecting);

        client.close();
        let result = opener.join().unwrap();
        assert!(matches!(result, Err(NetworkError::ShuttingDown)));
    }
}
