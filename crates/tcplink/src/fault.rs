//! Transport fault classification and supervision.
//!
//! Every failure raised inside an I/O completion is resolved once into a
//! [`Fault`] carrying a portable [`FaultKind`] and the [`Operation`] that
//! produced it. [`classify`] then decides what the owning session does about
//! it. Faults the library cannot recover from in-process are handed to a
//! [`Supervisor`].

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use tcplink_core::logging::targets;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Portable category of a transport fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// The remote side reset or half-closed the connection.
    Reset,
    /// The remote side actively refused the connection.
    Refused,
    /// The connection was aborted by the local stack.
    Aborted,
    /// The operation did not complete in time.
    TimedOut,
    /// The socket was already disposed by a concurrent disconnect.
    Disposed,
    /// The OS ran out of descriptors, buffers or memory.
    ResourceExhausted,
    /// Anything else.
    Other,
}

impl FaultKind {
    /// Resolve the category of an I/O error.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Self::Reset,
            io::ErrorKind::ConnectionRefused => Self::Refused,
            io::ErrorKind::ConnectionAborted => Self::Aborted,
            io::ErrorKind::TimedOut => Self::TimedOut,
            io::ErrorKind::NotConnected => Self::Disposed,
            io::ErrorKind::OutOfMemory => Self::ResourceExhausted,
            _ => err.raw_os_error().map_or(Self::Other, Self::from_os_code),
        }
    }

    #[cfg(unix)]
    fn from_os_code(code: i32) -> Self {
        match code {
            // EBADF
            9 => Self::Disposed,
            // ENOMEM, ENFILE, EMFILE
            12 | 23 | 24 => Self::ResourceExhausted,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            105 => Self::ResourceExhausted, // ENOBUFS
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
            55 => Self::ResourceExhausted, // ENOBUFS
            _ => Self::Other,
        }
    }

    #[cfg(windows)]
    fn from_os_code(code: i32) -> Self {
        match code {
            10054 => Self::Reset,
            10061 => Self::Refused,
            10053 => Self::Aborted,
            10060 => Self::TimedOut,
            10038 | 10057 | 995 => Self::Disposed,
            8 | 10024 | 10055 => Self::ResourceExhausted,
            _ => Self::Other,
        }
    }

    #[cfg(not(any(unix, windows)))]
    fn from_os_code(_code: i32) -> Self {
        Self::Other
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reset => write!(f, "reset"),
            Self::Refused => write!(f, "refused"),
            Self::Aborted => write!(f, "aborted"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Disposed => write!(f, "disposed"),
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// The operation that produced a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Establishing an outbound connection.
    Connect,
    /// Writing to a connection.
    Send,
    /// Reading from a connection.
    Receive,
    /// Accepting an inbound connection.
    Accept,
    /// The completion-handling layer itself, not a specific socket.
    Completion,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Send => write!(f, "send"),
            Self::Receive => write!(f, "receive"),
            Self::Accept => write!(f, "accept"),
            Self::Completion => write!(f, "completion"),
        }
    }
}

/// What the owner of a connection does about a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultAction {
    /// Nothing; a retry loop already covers it.
    TransientIgnore,
    /// Tear the connection down and restart the connect loop.
    Reconnect,
    /// Dispose the socket and forget the connection.
    TerminateConnection,
    /// Escalate to the supervisor and stop the whole session.
    TerminateProcess,
}

impl fmt::Display for FaultAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransientIgnore => write!(f, "transient-ignore"),
            Self::Reconnect => write!(f, "reconnect"),
            Self::TerminateConnection => write!(f, "terminate-connection"),
            Self::TerminateProcess => write!(f, "terminate-process"),
        }
    }
}

/// Decide how to react to a fault of `kind` raised by `operation`.
///
/// `reconnect_enabled` is the owning session's reconnect-on-disconnect
/// policy. Servers always pass `false`.
pub fn classify(kind: FaultKind, operation: Operation, reconnect_enabled: bool) -> FaultAction {
    if operation == Operation::Completion || kind == FaultKind::ResourceExhausted {
        return FaultAction::TerminateProcess;
    }

    match (operation, kind) {
        (Operation::Connect, _) | (Operation::Accept, _) => FaultAction::TransientIgnore,
        (
            Operation::Send | Operation::Receive,
            FaultKind::Disposed | FaultKind::Reset | FaultKind::Aborted,
        ) if reconnect_enabled => FaultAction::Reconnect,
        _ => FaultAction::TerminateConnection,
    }
}

/// A classified transport fault.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{operation} fault ({kind}): {message}")]
pub struct Fault {
    /// Portable category.
    pub kind: FaultKind,
    /// The operation that failed.
    pub operation: Operation,
    /// Human-readable detail.
    pub message: String,
}

impl Fault {
    /// Create a fault.
    pub fn new(kind: FaultKind, operation: Operation, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation,
            message: message.into(),
        }
    }

    /// Resolve an I/O error raised by `operation`.
    pub fn from_io(operation: Operation, err: &io::Error) -> Self {
        Self::new(FaultKind::from_io(err), operation, err.to_string())
    }

    pub(crate) fn disposed(operation: Operation) -> Self {
        Self::new(FaultKind::Disposed, operation, "socket already disposed")
    }

    pub(crate) fn timed_out(operation: Operation) -> Self {
        Self::new(FaultKind::TimedOut, operation, "operation timed out")
    }

    /// A fault raised by the completion layer itself.
    pub fn completion(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Other, Operation::Completion, message)
    }

    /// Classify this fault under the given reconnect policy.
    pub fn action(&self, reconnect_enabled: bool) -> FaultAction {
        classify(self.kind, self.operation, reconnect_enabled)
    }
}

/// Which half of the library raised an escalation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subsystem {
    /// A [`TcpClient`](crate::TcpClient).
    Client,
    /// A [`TcpServer`](crate::TcpServer).
    Server,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// An unrecoverable fault, as handed to a [`Supervisor`].
#[derive(Clone, Debug)]
pub struct FaultReport {
    /// The fault.
    pub fault: Fault,
    /// Who raised it.
    pub subsystem: Subsystem,
    /// The remote endpoint (client) or bound address (server), if known.
    pub endpoint: Option<SocketAddr>,
    /// When it was raised.
    pub timestamp: DateTime<Utc>,
}

impl FaultReport {
    pub(crate) fn new(fault: Fault, subsystem: Subsystem, endpoint: Option<SocketAddr>) -> Self {
        Self {
            fault,
            subsystem,
            endpoint,
            timestamp: Utc::now(),
        }
    }
}

/// Receives faults classified as [`FaultAction::TerminateProcess`].
///
/// After `escalate` returns, the session that raised the fault shuts itself
/// down. A supervisor decides whether that is enough or whether the whole
/// process has to go.
pub trait Supervisor: Send + Sync + fmt::Debug {
    /// Handle an unrecoverable fault.
    fn escalate(&self, report: &FaultReport);
}

/// Logs the fault and exits the process with `code`.
///
/// This is the default: an external orchestrator is expected to restart the
/// service. Install a [`LogSupervisor`] or your own [`Supervisor`] to keep the
/// process alive.
#[derive(Clone, Copy, Debug)]
pub struct ExitSupervisor {
    /// Process exit code.
    pub code: i32,
}

impl Default for ExitSupervisor {
    fn default() -> Self {
        Self { code: 1 }
    }
}

impl Supervisor for ExitSupervisor {
    fn escalate(&self, report: &FaultReport) {
        tracing::error!(
            target: targets::FAULT,
            subsystem = %report.subsystem,
            endpoint = ?report.endpoint,
            operation = %report.fault.operation,
            kind = %report.fault.kind,
            code = self.code,
            "unrecoverable fault, exiting: {}",
            report.fault.message
        );
        std::process::exit(self.code);
    }
}

/// Logs the fault and lets the session shut itself down.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSupervisor;

impl Supervisor for LogSupervisor {
    fn escalate(&self, report: &FaultReport) {
        tracing::error!(
            target: targets::FAULT,
            subsystem = %report.subsystem,
            endpoint = ?report.endpoint,
            operation = %report.fault.operation,
            kind = %report.fault.kind,
            "unrecoverable fault: {}",
            report.fault.message
        );
    }
}

/// Spawn a completion task and report a panic inside it as a
/// [`Operation::Completion`] fault.
///
/// The returned handle completes once the task and any panic handling have
/// finished.
pub(crate) fn spawn_supervised<F, P>(handle: &Handle, future: F, on_panic: P) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
    P: FnOnce(Fault) + Send + 'static,
{
    let task = handle.spawn(future);
    handle.spawn(async move {
        if let Err(err) = task.await
            && err.is_panic()
        {
            on_panic(Fault::completion(panic_message(err.into_panic())));
        }
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("completion task panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("completion task panicked: {message}")
    } else {
        "completion task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    #[test]
    fn test_connect_faults_are_transient() {
        for kind in [
            FaultKind::Refused,
            FaultKind::TimedOut,
            FaultKind::Reset,
            FaultKind::Aborted,
            FaultKind::Other,
        ] {
            assert_eq!(
                classify(kind, Operation::Connect, false),
                FaultAction::TransientIgnore
            );
            assert_eq!(
                classify(kind, Operation::Connect, true),
                FaultAction::TransientIgnore
            );
        }
    }

    #[test]
    fn test_reset_reconnects_only_when_enabled() {
        for operation in [Operation::Send, Operation::Receive] {
            for kind in [FaultKind::Reset, FaultKind::Aborted, FaultKind::Disposed] {
                assert_eq!(classify(kind, operation, true), FaultAction::Reconnect);
                assert_eq!(
                    classify(kind, operation, false),
                    FaultAction::TerminateConnection
                );
            }
        }
    }

    #[test]
    fn test_other_send_faults_terminate_connection() {
        assert_eq!(
            classify(FaultKind::TimedOut, Operation::Send, true),
            FaultAction::TerminateConnection
        );
        assert_eq!(
            classify(FaultKind::Other, Operation::Receive, true),
            FaultAction::TerminateConnection
        );
    }

    #[test]
    fn test_accept_faults_rearm() {
        assert_eq!(
            classify(FaultKind::Aborted, Operation::Accept, false),
            FaultAction::TransientIgnore
        );
    }

    #[test]
    fn test_process_level_faults_escalate() {
        assert_eq!(
            classify(FaultKind::ResourceExhausted, Operation::Accept, false),
            FaultAction::TerminateProcess
        );
        assert_eq!(
            classify(FaultKind::ResourceExhausted, Operation::Connect, true),
            FaultAction::TerminateProcess
        );
        assert_eq!(
            Fault::completion("boom").action(true),
            FaultAction::TerminateProcess
        );
    }

    #[test]
    fn test_io_error_kinds() {
        let cases = [
            (io::ErrorKind::ConnectionReset, FaultKind::Reset),
            (io::ErrorKind::BrokenPipe, FaultKind::Reset),
            (io::ErrorKind::ConnectionRefused, FaultKind::Refused),
            (io::ErrorKind::ConnectionAborted, FaultKind::Aborted),
            (io::ErrorKind::TimedOut, FaultKind::TimedOut),
            (io::ErrorKind::NotConnected, FaultKind::Disposed),
            (io::ErrorKind::OutOfMemory, FaultKind::ResourceExhausted),
            (io::ErrorKind::InvalidData, FaultKind::Other),
        ];
        for (kind, expected) in cases {
            assert_eq!(FaultKind::from_io(&io::Error::from(kind)), expected);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_descriptor_exhaustion() {
        let err = io::Error::from_raw_os_error(24);
        assert_eq!(FaultKind::from_io(&err), FaultKind::ResourceExhausted);
        let fault = Fault::from_io(Operation::Accept, &err);
        assert_eq!(fault.action(false), FaultAction::TerminateProcess);
    }

    #[test]
    fn test_fault_display() {
        let fault = Fault::new(FaultKind::Reset, Operation::Receive, "peer went away");
        assert_eq!(fault.to_string(), "receive fault (reset): peer went away");
    }

    #[test]
    fn test_spawn_supervised_reports_panics() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let reported = Arc::new(Mutex::new(None));

        let sink = reported.clone();
        let handle = spawn_supervised(
            runtime.handle(),
            async { panic!("slot exploded") },
            move |fault| *sink.lock() = Some(fault),
        );
        runtime.block_on(handle).unwrap();

        let fault = reported.lock().take().expect("panic reported");
        assert_eq!(fault.operation, Operation::Completion);
        assert!(fault.message.contains("slot exploded"));
    }

    #[test]
    fn test_spawn_supervised_quiet_on_success() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let reported = Arc::new(Mutex::new(false));

        let sink = reported.clone();
        let handle = spawn_supervised(
            runtime.handle(),
            async { tokio::time::sleep(Duration::from_millis(1)).await },
            move |_| *sink.lock() = true,
        );
        runtime.block_on(handle).unwrap();
        assert!(!*reported.lock());
    }
}
