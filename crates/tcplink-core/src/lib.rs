//! Core runtime plumbing for tcplink.
//!
//! This crate holds the pieces of the connection library that have nothing to
//! do with sockets themselves:
//!
//! - **Signals**: [`Signal`], the thread-safe fan-out used for notifications
//! - **Gates**: [`Gate`], the manual-reset rendezvous between callers and
//!   I/O completions
//! - **Cancellation**: [`CancellationToken`] for stopping receive chains
//! - **Runtime**: [`AsyncRuntime`], the worker pool completions run on, and
//!   [`block_on`], the bridge behind the blocking public API
//! - **Logging**: tracing target constants in [`logging`]
//!
//! # Example
//!
//! ```
//! use tcplink_core::{Gate, Signal};
//!
//! let connected = Signal::<String>::new();
//! connected.connect(|endpoint| println!("connected to {endpoint}"));
//! connected.emit("127.0.0.1:9000".to_string());
//!
//! let gate = Gate::closed();
//! gate.set();
//! assert!(gate.is_set());
//! ```

pub mod async_runtime;
mod cancel;
mod error;
mod gate;
pub mod logging;
mod signal;

pub use async_runtime::{AsyncRuntime, AsyncRuntimeConfig, block_on};
pub use cancel::CancellationToken;
pub use error::{CoreError, Result};
pub use gate::Gate;
pub use signal::{Signal, SlotGuard, SlotId};
