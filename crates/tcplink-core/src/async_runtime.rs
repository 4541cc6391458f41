//! The worker pool that drives socket completions.
//!
//! Every connect, accept, read and write completes on a task running on an
//! [`AsyncRuntime`]. Sessions default to the lazily created global runtime,
//! but can be pointed at any tokio runtime handle.
//!
//! # Blocking bridge
//!
//! The public session API is synchronous: `open`, `send` and `close` block the
//! caller until the matching completion arrives. [`block_on`] is the bridge.
//! It is safe to call from plain threads and from inside a multi-threaded
//! tokio runtime (the current worker is handed off with
//! [`tokio::task::block_in_place`] first). Calling it from a current-thread
//! runtime panics; use the `*_async` variants there.
//!
//! ```no_run
//! use tcplink_core::AsyncRuntime;
//!
//! let runtime = AsyncRuntime::global();
//! let handle = runtime.spawn(async { 40 + 2 });
//! let value = runtime.block_on(handle).unwrap();
//! assert_eq!(value, 42);
//! ```

use std::future::Future;
use std::sync::OnceLock;

use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use tokio::task::JoinHandle;

use crate::error::{CoreError, Result};
use crate::logging::targets;

static GLOBAL_RUNTIME: OnceLock<AsyncRuntime> = OnceLock::new();

/// Configuration for the async runtime.
#[derive(Debug, Clone)]
pub struct AsyncRuntimeConfig {
    /// Number of worker threads. Defaults to the number of CPU cores.
    pub worker_threads: Option<usize>,
    /// Name prefix for runtime threads.
    pub thread_name: String,
}

impl Default for AsyncRuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            thread_name: "tcplink-io".to_string(),
        }
    }
}

impl AsyncRuntimeConfig {
    /// Set the number of worker threads.
    pub fn with_worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = Some(count);
        self
    }

    /// Set the thread name prefix.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

/// A multi-threaded tokio runtime owned by the library.
pub struct AsyncRuntime {
    // Kept alive so the worker pool does not shut down.
    _runtime: Runtime,
    handle: Handle,
}

impl AsyncRuntime {
    /// Get the global async runtime, creating it on first use.
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to spawn the worker threads.
    /// No connection can make progress without them.
    pub fn global() -> &'static AsyncRuntime {
        GLOBAL_RUNTIME.get_or_init(|| {
            AsyncRuntime::new(AsyncRuntimeConfig::default())
                .expect("failed to create global async runtime")
        })
    }

    /// Initialize the global runtime with a custom configuration.
    ///
    /// Returns an error if the global runtime already exists.
    pub fn init_global(config: AsyncRuntimeConfig) -> Result<&'static AsyncRuntime> {
        let runtime = AsyncRuntime::new(config)?;
        GLOBAL_RUNTIME
            .set(runtime)
            .map_err(|_| CoreError::RuntimeAlreadyInitialized)?;
        GLOBAL_RUNTIME.get().ok_or(CoreError::RuntimeAlreadyInitialized)
    }

    /// Create a new runtime with the given configuration.
    pub fn new(config: AsyncRuntimeConfig) -> Result<Self> {
        let mut builder = Builder::new_multi_thread();
        builder.thread_name(&config.thread_name).enable_all();

        if let Some(workers) = config.worker_threads {
            builder.worker_threads(workers);
        }

        let runtime = builder
            .build()
            .map_err(|e| CoreError::RuntimeCreation(e.to_string()))?;
        let handle = runtime.handle().clone();

        tracing::debug!(
            target: targets::RUNTIME,
            thread_name = %config.thread_name,
            workers = ?config.worker_threads,
            "async runtime created"
        );

        Ok(Self {
            _runtime: runtime,
            handle,
        })
    }

    /// Get a handle to the tokio runtime.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn a task on the runtime.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Block the current thread until `future` completes.
    ///
    /// See [`block_on`] for the rules about calling context.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        block_on(&self.handle, future)
    }
}

impl std::fmt::Debug for AsyncRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncRuntime")
            .field("flavor", &self.handle.runtime_flavor())
            .finish()
    }
}

/// Drive `future` to completion on `handle`, blocking the calling thread.
///
/// # Panics
///
/// Panics when called from a current-thread tokio runtime, where blocking
/// would starve the only worker.
pub fn block_on<F: Future>(handle: &Handle, future: F) -> F::Output {
    match Handle::try_current() {
        Ok(current) => {
            assert!(
                current.runtime_flavor() != RuntimeFlavor::CurrentThread,
                "blocking tcplink calls are not supported on a current-thread runtime; \
                 use the async variants instead"
            );
            tokio::task::block_in_place(|| handle.block_on(future))
        }
        Err(_) => handle.block_on(future),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_spawn_and_block_on() {
        let runtime = AsyncRuntime::new(AsyncRuntimeConfig::default()).unwrap();
        let handle = runtime.spawn(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            "hello"
        });
        assert_eq!(runtime.block_on(handle).unwrap(), "hello");
    }

    #[test]
    fn test_tasks_run_in_parallel_workers() {
        let runtime =
            AsyncRuntime::new(AsyncRuntimeConfig::default().with_worker_threads(2)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let counter = counter.clone();
                runtime.spawn(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            runtime.block_on(handle).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_block_on_inside_multi_thread_runtime() {
        let handle = Handle::current();
        let value = block_on(&handle, async { 7 });
        assert_eq!(value, 7);
    }

    #[test]
    fn test_global_runtime_is_shared() {
        let a = AsyncRuntime::global() as *const AsyncRuntime;
        let b = AsyncRuntime::global() as *const AsyncRuntime;
        assert_eq!(a, b);
        assert!(AsyncRuntime::init_global(AsyncRuntimeConfig::default()).is_err());
    }
}
