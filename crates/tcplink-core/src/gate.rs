//! Manual-reset gates.
//!
//! A [`Gate`] is a binary signal: while it is set, every waiter passes
//! straight through; while it is reset, waiters block until someone calls
//! [`Gate::set`]. Setting does not consume the signal, so one `set` releases
//! all current and future waiters until the next [`Gate::reset`].
//!
//! Gates rendezvous asynchronous I/O completions with callers. A session
//! resets its "connected" gate when it starts connecting and sets it once the
//! socket is up; `send` waits on it before queueing anything.

use std::time::Duration;

use tokio::sync::watch;

/// A manual-reset binary gate.
#[derive(Debug)]
pub struct Gate {
    state: watch::Sender<bool>,
}

impl Gate {
    /// Create a new gate in the given state.
    pub fn new(set: bool) -> Self {
        let (state, _) = watch::channel(set);
        Self { state }
    }

    /// Create a gate that starts reset (closed).
    pub fn closed() -> Self {
        Self::new(false)
    }

    /// Create a gate that starts set (open).
    pub fn open() -> Self {
        Self::new(true)
    }

    /// Open the gate, releasing all waiters.
    pub fn set(&self) {
        self.state.send_replace(true);
    }

    /// Close the gate. Later waiters block until the next [`set`](Self::set).
    pub fn reset(&self) {
        self.state.send_replace(false);
    }

    /// Check whether the gate is currently open.
    pub fn is_set(&self) -> bool {
        *self.state.borrow()
    }

    /// Wait until the gate is open.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|set| *set).await;
    }

    /// Wait until the gate is open or `timeout` elapses.
    ///
    /// Returns `true` if the gate opened in time.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_open_gate_passes_immediately() {
        let gate = Gate::open();
        assert!(gate.is_set());
        assert!(gate.wait_timeout(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_closed_gate_times_out() {
        let gate = Gate::closed();
        assert!(!gate.is_set());
        assert!(!gate.wait_timeout(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_set_releases_waiters() {
        let gate = Arc::new(Gate::closed());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.set();

        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter released")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_reset_closes_again() {
        let gate = Gate::open();
        gate.reset();
        assert!(!gate.wait_timeout(Duration::from_millis(10)).await);
        gate.set();
        assert!(gate.wait_timeout(Duration::from_millis(10)).await);
    }
}
