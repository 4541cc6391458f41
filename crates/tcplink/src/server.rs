//! TCP server with signal-based event delivery.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tcplink_core::logging::{span_names, targets};
use tcplink_core::{AsyncRuntime, CancellationToken, Signal, block_on};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use crate::Result;
use crate::config::ServerConfig;
use crate::connection::{ConnectionId, ConnectionState, ReceiveEnd};
use crate::error::NetworkError;
use crate::event::{ConnectionEvent, DataReceived, DisconnectEvent, DisconnectReason, Notifications};
use crate::fault::{Fault, FaultAction, FaultReport, Operation, Subsystem, spawn_supervised};
use crate::registry::ConnectionRegistry;
use crate::serializer::{JsonSerializer, PayloadSerializer, frame};
use crate::state::ServerState;

/// Pause after a failed accept before re-arming.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Poll interval while waiting out the stop grace period.
const STOP_POLL: Duration = Duration::from_millis(20);

/// A TCP server with signal-based event delivery.
///
/// Every accepted connection is registered under a fresh [`ConnectionId`],
/// announced through [`connected`](Self::connected) and read by its own
/// receive chain. Connections that stay silent for longer than the
/// configured client timeout are disconnected by a periodic sweep.
///
/// Sends never block the caller: payloads are queued on the connection and
/// written by a runtime task, one at a time and in order.
///
/// # Signals
///
/// - [`connected`](Self::connected): Emitted when a client connects
/// - [`disconnected`](Self::disconnected): Emitted when a client goes away for any reason
/// - [`data_received`](Self::data_received): Emitted for every successful read
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tcplink::{ServerConfig, TcpServer};
///
/// let server = Arc::new(TcpServer::new(ServerConfig::new("0.0.0.0", 8080)));
///
/// let echo = server.clone();
/// server.data_received().connect(move |event| {
///     let _ = echo.send_text_to(event.connection, &event.text);
/// });
///
/// let addr = server.start()?;
/// println!("listening on {addr}");
/// # Ok::<(), tcplink::NetworkError>(())
/// ```
pub struct TcpServer {
    shared: Arc<ServerShared>,
}

struct ServerShared {
    config: ServerConfig,
    handle: Handle,
    notifications: Notifications,
    state: Mutex<ServerState>,
    registry: ConnectionRegistry,
    local_addr: Mutex<Option<SocketAddr>>,
    run: Mutex<Option<RunContext>>,
    /// Disposals started by the idle sweep.
    retiring: Mutex<Vec<JoinHandle<()>>>,
    /// Observed by send drains; queued payloads are dropped once set.
    stopping: AtomicBool,
    /// Serializes start and stop.
    lifecycle: tokio::sync::Mutex<()>,
}

/// Tasks belonging to one start/stop cycle.
struct RunContext {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TcpServer {
    /// Create a new server that runs its I/O on the global runtime.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_handle(config, AsyncRuntime::global().handle().clone())
    }

    /// Create a new server that runs its I/O on the given runtime.
    pub fn with_handle(config: ServerConfig, handle: Handle) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                config,
                handle,
                notifications: Notifications::new(),
                state: Mutex::new(ServerState::Stopped),
                registry: ConnectionRegistry::new(),
                local_addr: Mutex::new(None),
                run: Mutex::new(None),
                retiring: Mutex::new(Vec::new()),
                stopping: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Signal emitted when a client connects.
    pub fn connected(&self) -> &Signal<ConnectionEvent> {
        &self.shared.notifications.connected
    }

    /// Signal emitted when a client goes away.
    pub fn disconnected(&self) -> &Signal<DisconnectEvent> {
        &self.shared.notifications.disconnected
    }

    /// Signal emitted for every successful read.
    pub fn data_received(&self) -> &Signal<DataReceived> {
        &self.shared.notifications.data_received
    }

    /// Get the current server state.
    pub fn state(&self) -> ServerState {
        *self.shared.state.lock()
    }

    /// Check if the server is accepting connections.
    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// The address the listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    /// Get the number of registered connections.
    ///
    /// Advisory: accepts and disconnects in flight may change it at any time.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Get a list of all registered connection IDs.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.shared.registry.ids()
    }

    /// The remote endpoint of a connection.
    pub fn remote_endpoint(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.shared.registry.get(id).map(|s| s.remote_addr())
    }

    /// Bytes written to a connection so far.
    pub fn bytes_sent(&self, id: ConnectionId) -> Option<u64> {
        self.shared.registry.get(id).map(|s| s.bytes_sent())
    }

    /// Bind, listen and start accepting. Returns the bound address.
    ///
    /// If the server is already running, this is a no-op that returns the
    /// current address.
    pub fn start(&self) -> Result<SocketAddr> {
        block_on(&self.shared.handle, self.start_async())
    }

    /// Async variant of [`start`](Self::start).
    pub async fn start_async(&self) -> Result<SocketAddr> {
        self.shared.start().await
    }

    /// Stop accepting and close every connection.
    ///
    /// Gives connections the configured grace period to close on their own,
    /// then disposes whatever is left. No-op if the server is not running.
    pub fn stop(&self) {
        block_on(&self.shared.handle, self.stop_async())
    }

    /// Async variant of [`stop`](Self::stop).
    pub async fn stop_async(&self) {
        self.shared.stop().await
    }

    /// Stop, then start again with the same configuration.
    pub fn restart(&self) -> Result<SocketAddr> {
        block_on(&self.shared.handle, self.restart_async())
    }

    /// Async variant of [`restart`](Self::restart).
    pub async fn restart_async(&self) -> Result<SocketAddr> {
        self.shared.stop().await;
        self.shared.start().await
    }

    /// Close one connection. Returns `false` if the ID is not registered.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        block_on(&self.shared.handle, self.disconnect_async(id))
    }

    /// Async variant of [`disconnect`](Self::disconnect).
    pub async fn disconnect_async(&self, id: ConnectionId) -> bool {
        self.shared
            .remove_connection(id, DisconnectReason::Requested)
            .await
    }

    /// Queue raw bytes for one connection.
    pub fn send_to(&self, id: ConnectionId, data: impl Into<Bytes>) -> Result<()> {
        let state = self
            .shared
            .registry
            .get(id)
            .ok_or(NetworkError::UnknownConnection(id))?;
        state.enqueue(data.into());
        self.shared.spawn_drain(state);
        Ok(())
    }

    /// Queue text for one connection, encoded with the configured encoding.
    pub fn send_text_to(&self, id: ConnectionId, text: &str) -> Result<()> {
        self.send_to(id, self.shared.config.encoding.encode(text))
    }

    /// Queue a value for one connection as JSON followed by the delimiter.
    pub fn send_object_to<T: Serialize + ?Sized>(&self, id: ConnectionId, value: &T) -> Result<()> {
        let payload = self.shared.typed_payload(&JsonSerializer, value)?;
        self.send_to(id, payload)
    }

    /// Queue raw bytes for every connection registered right now.
    ///
    /// Returns how many connections the payload was queued for. Connections
    /// accepted while this runs may or may not be included.
    pub fn broadcast(&self, data: impl Into<Bytes>) -> usize {
        let data = data.into();
        let mut queued = 0;
        for state in self.shared.registry.snapshot() {
            if state.is_disposed() {
                continue;
            }
            state.enqueue(data.clone());
            self.shared.spawn_drain(state);
            queued += 1;
        }
        tracing::trace!(target: targets::SERVER, bytes = data.len(), queued, "broadcast");
        queued
    }

    /// Broadcast text encoded with the configured encoding.
    pub fn broadcast_text(&self, text: &str) -> usize {
        self.broadcast(self.shared.config.encoding.encode(text))
    }

    /// Broadcast a value as JSON followed by the delimiter.
    pub fn broadcast_object<T: Serialize + ?Sized>(&self, value: &T) -> Result<usize> {
        let payload = self.shared.typed_payload(&JsonSerializer, value)?;
        Ok(self.broadcast(payload))
    }

    /// Broadcast a value serialized by `serializer`, followed by the delimiter.
    pub fn broadcast_serialized<S, T>(&self, serializer: &S, value: &T) -> Result<usize>
    where
        S: PayloadSerializer,
        T: Serialize + ?Sized,
    {
        let payload = self.shared.typed_payload(serializer, value)?;
        Ok(self.broadcast(payload))
    }
}

impl ServerShared {
    fn set_state(&self, state: ServerState) {
        *self.state.lock() = state;
    }

    fn typed_payload<S, T>(&self, serializer: &S, value: &T) -> Result<Bytes>
    where
        S: PayloadSerializer,
        T: Serialize + ?Sized,
    {
        let payload = serializer.serialize(value)?;
        Ok(frame(
            &payload,
            &self.config.encoding.encode(&self.config.delimiter),
        ))
    }

    async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let _lifecycle = self.lifecycle.lock().await;
        if *self.state.lock() != ServerState::Stopped {
            return (*self.local_addr.lock()).ok_or(NetworkError::NotRunning);
        }

        self.set_state(ServerState::Starting);
        let (listener, local_addr) = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                self.set_state(ServerState::Stopped);
                return Err(e);
            }
        };

        self.stopping.store(false, Ordering::Release);
        let cancel = CancellationToken::new();

        let accept = {
            let shared = self.clone();
            let supervisor = self.clone();
            let cancel = cancel.clone();
            spawn_supervised(
                &self.handle,
                async move { shared.accept_loop(listener, cancel).await },
                move |fault| supervisor.escalate(fault),
            )
        };
        let sweep = {
            let shared = self.clone();
            let supervisor = self.clone();
            let cancel = cancel.clone();
            spawn_supervised(
                &self.handle,
                async move { shared.sweep_loop(cancel).await },
                move |fault| supervisor.escalate(fault),
            )
        };

        *self.run.lock() = Some(RunContext {
            cancel,
            tasks: vec![accept, sweep],
        });
        *self.local_addr.lock() = Some(local_addr);
        self.set_state(ServerState::Running);

        tracing::info!(
            target: targets::SERVER,
            address = %local_addr,
            backlog = self.config.backlog,
            "listening"
        );
        Ok(local_addr)
    }

    async fn bind(&self) -> Result<(TcpListener, SocketAddr)> {
        let address = self.config.bind_addr();
        let bind_error = |e: std::io::Error| NetworkError::Bind {
            address: address.clone(),
            message: e.to_string(),
        };

        let addr = tokio::net::lookup_host(&address)
            .await
            .map_err(|e| NetworkError::InvalidAddress {
                address: address.clone(),
                message: e.to_string(),
            })?
            .next()
            .ok_or_else(|| NetworkError::InvalidAddress {
                address: address.clone(),
                message: "did not resolve to any address".into(),
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_error)?;

        socket
            .set_reuseaddr(self.config.reuse_address)
            .map_err(bind_error)?;
        if let Some(linger) = self.config.linger {
            set_listener_linger(&socket, linger).map_err(bind_error)?;
        }
        // Accepted sockets inherit this from the listener.
        socket
            .set_keepalive(self.config.socket.keep_alive)
            .map_err(bind_error)?;
        socket.bind(addr).map_err(bind_error)?;
        let listener = socket.listen(self.config.backlog).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        Ok((listener, local_addr))
    }

    async fn accept_loop(self: &Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        let span = tracing::debug_span!(
            target: targets::SERVER,
            span_names::ACCEPT,
            address = ?listener.local_addr().ok()
        );

        async move {
            loop {
                let accepted = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, _)) => self.register(stream),
                    Err(e) => {
                        let fault = Fault::from_io(Operation::Accept, &e);
                        if fault.action(false) == FaultAction::TerminateProcess {
                            self.escalate(fault);
                            break;
                        }
                        tracing::debug!(
                            target: targets::SERVER,
                            kind = %fault.kind,
                            "accept failed, re-arming: {}",
                            fault.message
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        }
                    }
                }
            }
            tracing::debug!(target: targets::SERVER, "accept loop stopped");
        }
        .instrument(span)
        .await
    }

    fn register(self: &Arc<Self>, stream: TcpStream) {
        let (state, reader) =
            match ConnectionState::new(stream, &self.config.socket, Operation::Accept) {
                Ok(accepted) => accepted,
                Err(fault) => {
                    // The peer vanished before we could look at it.
                    tracing::debug!(target: targets::SERVER, %fault, "dropping accepted socket");
                    return;
                }
            };

        self.registry.insert(state.clone());
        tracing::debug!(
            target: targets::SERVER,
            connection = %state.id(),
            endpoint = %state.remote_addr(),
            connections = self.registry.len(),
            "client connected"
        );
        self.notifications.connected.emit(ConnectionEvent {
            connection: state.id(),
            endpoint: state.remote_addr(),
            timestamp: state.connected_at(),
        });

        self.spawn_receive(state, reader);
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

                match end {
                    ReceiveEnd::Cancelled => {}
                    ReceiveEnd::PeerClosed => {
                        shared
                            .remove_connection(connection, DisconnectReason::PeerClosed)
                            .await;
                    }
                    ReceiveEnd::Fault(fault) => shared.handle_fault(&state, fault).await,
                }
            },
            move |fault| supervisor.escalate(fault),
        );
    }

    fn spawn_drain(self: &Arc<Self>, state: Arc<ConnectionState>) {
        let shared = self.clone();
        let supervisor = self.clone();
        spawn_supervised(
            &self.handle,
            async move {
                if let Err(fault) = state.drain(&shared.stopping).await {
                    shared.handle_fault(&state, fault).await;
                }
            },
            move |fault| supervisor.escalate(fault),
        );
    }

    async fn handle_fault(self: &Arc<Self>, state: &Arc<ConnectionState>, fault: Fault) {
        match fault.action(false) {
            FaultAction::TransientIgnore => {
                tracing::trace!(target: targets::FAULT, %fault, "ignored");
            }
            FaultAction::TerminateProcess => self.escalate(fault),
            action => {
                tracing::warn!(
                    target: targets::SERVER,
                    connection = %state.id(),
                    operation = %fault.operation,
                    kind = %fault.kind,
                    %action,
                    "connection fault: {}",
                    fault.message
                );
                self.remove_connection(state.id(), DisconnectReason::Fault(fault.kind))
                    .await;
            }
        }
    }

    /// Unregister, dispose and announce one connection.
    ///
    /// Only the caller that wins the registry removal does the rest, so each
    /// connection is announced as disconnected exactly once.
    async fn remove_connection(&self, id: ConnectionId, reason: DisconnectReason) -> bool {
        let Some(state) = self.registry.remove(id) else {
            return false;
        };
        self.retire(state, reason).await;
        true
    }

    async fn retire(&self, state: Arc<ConnectionState>, reason: DisconnectReason) {
        state.dispose().await;
        tracing::debug!(
            target: targets::SERVER,
            connection = %state.id(),
            %reason,
            connections = self.registry.len(),
            "client disconnected"
        );
        self.notifications.disconnected.emit(DisconnectEvent {
            connection: state.id(),
            endpoint: state.remote_addr(),
            timestamp: chrono::Utc::now(),
            reason,
        });
    }

    async fn sweep_loop(self: &Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.sweep_idle(),
            }
        }
    }

    /// Unregister every idle connection, then retire each on its own task.
    ///
    /// Disposal may wait out a stuck write; the tick does not wait for it.
    fn sweep_idle(self: &Arc<Self>) {
        let threshold = self.config.client_timeout;
        let mut retiring = self.retiring.lock();
        retiring.retain(|task| !task.is_finished());

        for id in self.registry.idle(threshold, Instant::now()) {
            let Some(state) = self.registry.remove(id) else {
                continue;
            };
            tracing::debug!(
                target: targets::SERVER,
                connection = %id,
                threshold_ms = threshold.as_millis() as u64,
                "idle connection swept"
            );
            let shared = self.clone();
            let supervisor = self.clone();
            retiring.push(spawn_supervised(
                &self.handle,
                async move { shared.retire(state, DisconnectReason::IdleTimeout).await },
                move |fault| supervisor.escalate(fault),
            ));
        }
    }

    async fn stop(self: &Arc<Self>) {
        let _lifecycle = self.lifecycle.lock().await;
        if *self.state.lock() != ServerState::Running {
            return;
        }

        self.set_state(ServerState::Stopping);
        self.stopping.store(true, Ordering::Release);
        tracing::debug!(
            target: targets::SERVER,
            connections = self.registry.len(),
            "stopping"
        );

        let run = self.run.lock().take();
        if let Some(run) = run {
            run.cancel.cancel();
            for task in run.tasks {
                let _ = task.await;
            }
        }
        let swept = std::mem::take(&mut *self.retiring.lock());
        for task in swept {
            let _ = task.await;
        }

        let deadline = Instant::now() + self.config.stop_grace;
        while !self.registry.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(STOP_POLL).await;
        }

        let remaining = self.registry.drain_all();
        if !remaining.is_empty() {
            tracing::debug!(
                target: targets::SERVER,
                count = remaining.len(),
                "forcing remaining connections closed"
            );
        }
        let mut closing = JoinSet::new();
        for state in remaining {
            let shared = self.clone();
            closing.spawn_on(
                async move { shared.retire(state, DisconnectReason::Shutdown).await },
                &self.handle,
            );
        }
        while closing.join_next().await.is_some() {}

        *self.local_addr.lock() = None;
        self.set_state(ServerState::Stopped);
        tracing::info!(target: targets::SERVER, "stopped");
    }

    /// Hand an unrecoverable fault to the supervisor, then stop.
    fn escalate(self: &Arc<Self>, fault: Fault) {
        let endpoint = *self.local_addr.lock();
        tracing::error!(
            target: targets::FAULT,
            subsystem = %Subsystem::Server,
            endpoint = ?endpoint,
            %fault,
            "escalating"
        );
        self.config
            .supervisor
            .escalate(&FaultReport::new(fault, Subsystem::Server, endpoint));

        let shared = self.clone();
        self.handle.spawn(async move { shared.stop().await });
    }
}

#[allow(deprecated)] // TcpSocket has no non-deprecated linger setter; only used when configured.
fn set_listener_linger(socket: &TcpSocket, linger: Duration) -> std::io::Result<()> {
    socket.set_linger(Some(linger))
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);
        if let Some(run) = self.shared.run.lock().take() {
            run.cancel.cancel();
        }
        for state in self.shared.registry.drain_all() {
            self.shared.handle.spawn(async move {
                state.dispose().await;
            });
        }
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("bind_addr", &self.shared.config.bind_addr())
            .field("state", &self.state())
            .field("connections", &self.connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_server_is_stopped() {
        let server = TcpServer::new(ServerConfig::new("127.0.0.1", 0));
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(!server.is_running());
        assert_eq!(server.local_addr(), None);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_stop_when_stopped_is_noop() {
        let server = TcpServer::new(ServerConfig::new("127.0.0.1", 0));
        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_start_twice_returns_same_address() {
        let server = TcpServer::new(
            ServerConfig::new("127.0.0.1", 0).stop_grace(Duration::ZERO),
        );
        let first = server.start().unwrap();
        let second = server.start().unwrap();
        assert_eq!(first, second);
        assert!(server.is_running());

        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.local_addr(), None);
    }

    #[test]
    fn test_unresolvable_bind_address() {
        let server = TcpServer::new(ServerConfig::new("not an address", 0));
        assert!(matches!(
            server.start(),
            Err(NetworkError::InvalidAddress { .. })
        ));
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_send_to_unknown_connection() {
        let server = TcpServer::new(ServerConfig::new("127.0.0.1", 0));
        let id = ConnectionId::new();
        assert!(matches!(
            server.send_text_to(id, "hello"),
            Err(NetworkError::UnknownConnection(missing)) if missing == id
        ));
        assert!(!server.disconnect(id));
        assert_eq!(server.broadcast_text("nobody"), 0);
    }
}
