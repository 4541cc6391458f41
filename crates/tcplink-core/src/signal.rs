//! Signal/slot notification channel.
//!
//! A [`Signal<Args>`] is a thread-safe observer registry. Any number of slots
//! (closures) can be connected, and every call to [`Signal::emit`] invokes all
//! of them with a reference to the emitted value.
//!
//! Connection sockets publish their `Connected`, `Disconnected` and
//! `DataReceived` notifications through signals. Emission happens on whichever
//! runtime worker completed the I/O, so slots must be `Send + Sync` and should
//! return quickly; a slow slot delays the next read on the emitting connection.
//!
//! # Example
//!
//! ```
//! use tcplink_core::Signal;
//!
//! let text_received = Signal::<String>::new();
//!
//! let id = text_received.connect(|text| {
//!     println!("received: {}", text);
//! });
//!
//! text_received.emit("ping\r\n".to_string());
//! text_received.disconnect(id);
//! ```
//!
//! # Re-entrancy
//!
//! The slot list is snapshotted before invocation, so a slot may connect or
//! disconnect slots on the same signal while it is being emitted. Changes
//! take effect from the next emission.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};

use crate::logging::targets;

new_key_type! {
    /// Identifies one slot connected to a [`Signal`].
    ///
    /// Returned by [`Signal::connect`] and accepted by [`Signal::disconnect`].
    pub struct SlotId;
}

type SlotFn<Args> = Arc<dyn Fn(&Args) + Send + Sync>;
type SlotMapRef<Args> = Arc<Mutex<SlotMap<SlotId, SlotFn<Args>>>>;

/// A type-safe signal that can have multiple connected slots.
///
/// # Type Parameter
///
/// - `Args`: The value passed to connected slots. Use `()` for signals with
///   no payload.
///
/// # Thread Safety
///
/// `Signal<Args>` is `Send + Sync` whenever `Args` is `Send`. Slots run
/// directly on the emitting thread.
pub struct Signal<Args> {
    slots: SlotMapRef<Args>,
    blocked: AtomicBool,
    emissions: AtomicU64,
}

impl<Args: Send + 'static> Default for Signal<Args> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Args: Send + 'static> Signal<Args> {
    /// Create a new signal with no connections.
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(SlotMap::with_key())),
            blocked: AtomicBool::new(false),
            emissions: AtomicU64::new(0),
        }
    }

    /// Connect a slot (closure) to this signal.
    ///
    /// Returns a [`SlotId`] that can be used to disconnect the slot later.
    pub fn connect<F>(&self, slot: F) -> SlotId
    where
        F: Fn(&Args) + Send + Sync + 'static,
    {
        self.slots.lock().insert(Arc::new(slot))
    }

    /// Connect a slot that is disconnected when the returned guard is dropped.
    ///
    /// The guard only holds a weak reference, so it may safely outlive the
    /// signal.
    ///
    /// ```
    /// use tcplink_core::Signal;
    /// use std::sync::atomic::{AtomicI32, Ordering};
    /// use std::sync::Arc;
    ///
    /// let signal = Signal::<i32>::new();
    /// let counter = Arc::new(AtomicI32::new(0));
    /// {
    ///     let counter = counter.clone();
    ///     let _guard = signal.connect_scoped(move |&n| {
    ///         counter.fetch_add(n, Ordering::SeqCst);
    ///     });
    ///     signal.emit(42);
    /// }
    /// signal.emit(43);
    /// assert_eq!(counter.load(Ordering::SeqCst), 42);
    /// ```
    pub fn connect_scoped<F>(&self, slot: F) -> SlotGuard<Args>
    where
        F: Fn(&Args) + Send + Sync + 'static,
    {
        let id = self.connect(slot);
        SlotGuard {
            slots: Arc::downgrade(&self.slots),
            id,
        }
    }

    /// Disconnect a specific slot.
    ///
    /// Returns `true` if the slot was found and removed.
    pub fn disconnect(&self, id: SlotId) -> bool {
        self.slots.lock().remove(id).is_some()
    }

    /// Disconnect all slots from this signal.
    pub fn disconnect_all(&self) {
        self.slots.lock().clear();
    }

    /// Get the number of connected slots.
    pub fn connection_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Block signal emission temporarily.
    ///
    /// While blocked, calls to [`emit`](Self::emit) do nothing.
    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    /// Check if signal emission is currently blocked.
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    /// Total number of emissions that reached at least the slot snapshot.
    pub fn emission_count(&self) -> u64 {
        self.emissions.load(Ordering::Relaxed)
    }

    /// Emit the signal, invoking all connected slots in connection order.
    #[tracing::instrument(skip_all, target = "tcplink_core::signal", level = "trace")]
    pub fn emit(&self, args: Args) {
        if self.is_blocked() {
            tracing::trace!(target: targets::SIGNAL, "signal blocked, skipping emit");
            return;
        }

        // Invoke outside the lock so slots may touch this signal.
        let snapshot: Vec<SlotFn<Args>> = self.slots.lock().values().cloned().collect();
        self.emissions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(target: targets::SIGNAL, slot_count = snapshot.len(), "emitting signal");

        for slot in snapshot {
            slot(&args);
        }
    }
}

impl<Args> std::fmt::Debug for Signal<Args> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("slots", &self.slots.lock().len())
            .field("blocked", &self.blocked.load(Ordering::SeqCst))
            .finish()
    }
}

/// A slot connection that disconnects itself when dropped.
///
/// Created via [`Signal::connect_scoped`].
pub struct SlotGuard<Args> {
    slots: Weak<Mutex<SlotMap<SlotId, SlotFn<Args>>>>,
    id: SlotId,
}

impl<Args> SlotGuard<Args> {
    /// The id of the guarded slot.
    pub fn id(&self) -> SlotId {
        self.id
    }
}

impl<Args> Drop for SlotGuard<Args> {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.upgrade() {
            slots.lock().remove(self.id);
        }
    }
}
