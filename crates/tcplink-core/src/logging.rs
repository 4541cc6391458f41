//! Tracing targets and span names.
//!
//! tcplink logs through the `tracing` crate and never installs a subscriber
//! itself. Install one in your application to see output:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("tcplink=debug")
//!     .init();
//! ```
//!
//! The constants below can be used in filter directives to narrow output to
//! a single subsystem.

/// Span names used for tracing.
pub mod span_names {
    /// Client connect loop.
    pub const CONNECT: &str = "tcplink::connect";
    /// Per-connection receive chain.
    pub const RECEIVE: &str = "tcplink::receive";
    /// Server accept loop.
    pub const ACCEPT: &str = "tcplink::accept";
}

/// Target names for log filtering.
pub mod targets {
    /// Core runtime target.
    pub const RUNTIME: &str = "tcplink_core::runtime";
    /// Signal emission target.
    pub const SIGNAL: &str = "tcplink_core::signal";
    /// Client session target.
    pub const CLIENT: &str = "tcplink::client";
    /// Server listener target.
    pub const SERVER: &str = "tcplink::server";
    /// Per-connection I/O target.
    pub const CONNECTION: &str = "tcplink::connection";
    /// Fault classification and escalation target.
    pub const FAULT: &str = "tcplink::fault";
}
