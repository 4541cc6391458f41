//! Per-socket connection state.
//!
//! A [`ConnectionState`] is created when a connect or accept succeeds and
//! lives until the socket is disposed. Its two halves are driven separately:
//!
//! - the read half is owned by exactly one receive chain, which reads,
//!   touches the activity clock and publishes, strictly one read at a time;
//! - the write half sits behind a FIFO queue and a send gate, so only one
//!   payload is ever in flight and enqueue order equals wire order.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tcplink_core::logging::{span_names, targets};
use tcplink_core::{CancellationToken, Gate};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::Instrument;

use crate::config::{TcpSocketConfig, TextEncoding};
use crate::fault::{Fault, Operation};

/// How long disposal waits for an in-flight write before interrupting it.
const DISPOSE_SEND_GRACE: Duration = Duration::from_secs(5);

/// Unique identifier for a connection. Never reused within a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new connection ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// How a receive chain ended.
#[derive(Debug)]
pub(crate) enum ReceiveEnd {
    /// The peer closed its side (a zero-byte read).
    PeerClosed,
    /// The connection was disposed locally.
    Cancelled,
    /// The read failed.
    Fault(Fault),
}

pub(crate) struct ConnectionState {
    id: ConnectionId,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    outbound: Mutex<VecDeque<Bytes>>,
    draining: AtomicBool,
    send_gate: Gate,
    last_receive: Mutex<Instant>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    write_timeout: Option<Duration>,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl ConnectionState {
    /// Wrap a freshly connected or accepted stream.
    ///
    /// Returns the shared state and the read half for the receive chain.
    pub(crate) fn new(
        stream: TcpStream,
        config: &TcpSocketConfig,
        operation: Operation,
    ) -> Result<(Arc<Self>, OwnedReadHalf), Fault> {
        let io_fault = |e: std::io::Error| Fault::from_io(operation, &e);

        stream.set_nodelay(config.no_delay).map_err(io_fault)?;
        let local_addr = stream.local_addr().map_err(io_fault)?;
        let remote_addr = stream.peer_addr().map_err(io_fault)?;
        let (reader, writer) = stream.into_split();

        let state = Arc::new(Self {
            id: ConnectionId::new(),
            local_addr,
            remote_addr,
            connected_at: Utc::now(),
            writer: tokio::sync::Mutex::new(Some(writer)),
            outbound: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            send_gate: Gate::open(),
            last_receive: Mutex::new(Instant::now()),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            write_timeout: config.write_timeout,
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        });

        Ok((state, reader))
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub(crate) fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Bytes written so far (the send-completion offset).
    pub(crate) fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Time since the last successful read.
    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_receive.lock())
    }

    fn touch(&self) {
        *self.last_receive.lock() = Instant::now();
    }

    /// Append a payload to the outbound queue.
    pub(crate) fn enqueue(&self, payload: Bytes) {
        self.outbound.lock().push_back(payload);
    }

    fn discard_queued(&self) -> usize {
        let mut queue = self.outbound.lock();
        let discarded = queue.len();
        queue.clear();
        discarded
    }

    /// Write queued payloads until the queue is empty.
    ///
    /// Only the first caller to find the send path idle writes; everyone else
    /// returns as soon as their payload is queued behind it. When
    /// `shutting_down` is observed the remaining payloads are discarded.
    pub(crate) async fn drain(&self, shutting_down: &AtomicBool) -> Result<(), Fault> {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Ok(());
            }

            let result = {
                let _claim = FlagGuard(&self.draining);
                self.drain_claimed(shutting_down).await
            };
            result?;

            // A payload queued between our last pop and releasing the claim
            // has nobody else to write it.
            if self.outbound.lock().is_empty() {
                return Ok(());
            }
        }
    }

    async fn drain_claimed(&self, shutting_down: &AtomicBool) -> Result<(), Fault> {
        loop {
            if shutting_down.load(Ordering::Acquire) || self.is_disposed() {
                let discarded = self.discard_queued();
                if discarded > 0 {
                    tracing::debug!(
                        target: targets::CONNECTION,
                        connection = %self.id,
                        discarded,
                        "discarded queued payloads on shutdown"
                    );
                }
                return Ok(());
            }

            let Some(payload) = self.outbound.lock().pop_front() else {
                return Ok(());
            };

            self.send_gate.reset();
            let _reopen = GateGuard(&self.send_gate);
            self.write_one(&payload).await?;
        }
    }

    async fn write_one(&self, payload: &[u8]) -> Result<(), Fault> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(Fault::disposed(Operation::Send));
        };

        let write = async {
            match self.write_timeout {
                Some(limit) => match tokio::time::timeout(limit, stream.write_all(payload)).await {
                    Ok(result) => result.map_err(|e| Fault::from_io(Operation::Send, &e)),
                    Err(_) => Err(Fault::timed_out(Operation::Send)),
                },
                None => stream
                    .write_all(payload)
                    .await
                    .map_err(|e| Fault::from_io(Operation::Send, &e)),
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Fault::disposed(Operation::Send)),
            result = write => result?,
        }

        let total = self
            .bytes_sent
            .fetch_add(payload.len() as u64, Ordering::Relaxed)
            + payload.len() as u64;
        tracing::trace!(
            target: targets::CONNECTION,
            connection = %self.id,
            bytes = payload.len(),
            total,
            "payload written"
        );
        Ok(())
    }

    /// Shut the socket down and release it. Idempotent.
    ///
    /// Waits for an in-flight write to finish first, then half-closes the
    /// write side and stops the receive chain. Returns `false` if the
    /// connection was already disposed.
    pub(crate) async fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }

        if !self.send_gate.wait_timeout(DISPOSE_SEND_GRACE).await {
            tracing::debug!(
                target: targets::CONNECTION,
                connection = %self.id,
                "in-flight write did not finish, interrupting"
            );
            self.cancel.cancel();
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer
            && let Err(e) = writer.shutdown().await
        {
            // Already reset by the peer; nothing left to close.
            tracing::trace!(
                target: targets::CONNECTION,
                connection = %self.id,
                error = %e,
                "shutdown on a dead socket"
            );
        }

        self.cancel.cancel();
        self.discard_queued();

        tracing::debug!(
            target: targets::CONNECTION,
            connection = %self.id,
            endpoint = %self.remote_addr,
            bytes_sent = self.bytes_sent(),
            bytes_received = self.bytes_received(),
            "connection disposed"
        );
        true
    }

    /// Run the receive chain until the peer closes, the read fails or the
    /// connection is disposed.
    ///
    /// Each read touches the activity clock, then its bytes are decoded and
    /// handed to `on_data` before the next read is posted.
    pub(crate) async fn receive<F>(
        &self,
        mut reader: OwnedReadHalf,
        buffer_size: usize,
        encoding: TextEncoding,
        mut on_data: F,
    ) -> ReceiveEnd
    where
        F: FnMut(String),
    {
        let span = tracing::debug_span!(
            target: targets::CONNECTION,
            span_names::RECEIVE,
            connection = %self.id,
            endpoint = %self.remote_addr
        );

        async move {
            let mut buffer = vec![0u8; buffer_size];
            loop {
                let read = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return ReceiveEnd::Cancelled,
                    read = reader.read(&mut buffer) => read,
                };

                match read {
                    Ok(0) => return ReceiveEnd::PeerClosed,
                    Ok(n) => {
                        self.touch();
                        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                        tracing::trace!(target: targets::CONNECTION, bytes = n, "read");
                        on_data(encoding.decode(&buffer[..n]));
                    }
                    Err(e) if self.is_disposed() => {
                        tracing::trace!(target: targets::CONNECTION, error = %e, "read on disposed socket");
                        return ReceiveEnd::Cancelled;
                    }
                    Err(e) => return ReceiveEnd::Fault(Fault::from_io(Operation::Receive, &e)),
                }
            }
        }
        .instrument(span)
        .await
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("bytes_sent", &self.bytes_sent())
            .field("bytes_received", &self.bytes_received())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Clears a claim flag when dropped, so a cancelled drain cannot wedge the
/// send path.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct GateGuard<'a>(&'a Gate);

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.0.set();
    }
}
