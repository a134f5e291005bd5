//! Per-operation cancellation, forwarded to the underlying RPC primitive
//! when it supports it (alarms, requests) and otherwise simply recorded.
//!
//! This is the realization of the "cancellation slot" associated state
//! `GrpcContext`'s RPC primitives preserve across their completion (§4.4,
//! §4.6): a small shared flag a caller can set from any thread, and that a
//! primitive's future checks (or forwards to `Alarm::cancel`) when it is
//! polled or dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type CancelCallback = Box<dyn FnOnce() + Send>;

/// The writer half of a cancellation signal.
///
/// Cloning a [`CancellationToken`] shares the same underlying flag --
/// cancelling any clone cancels all of them, mirroring the original's
/// associated cancellation slot living for the operation's lifetime inside
/// the operation object.
///
/// [`register`](Self::register) is this slot's asio `cancellation_slot::
/// assign` equivalent: primitives that support forwarding a cancellation to
/// the underlying RPC call (alarms, per §4.4) register a callback that fires
/// the first time [`cancel`](Self::cancel) is called, or immediately if the
/// token was already cancelled by the time the primitive registered.
/// Primitives that do not support forwarding simply never register one,
/// matching §4.4's "for other primitives, cancellation is deferred until the
/// natural completion".
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    slot: Arc<CancellationSlot>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.slot.cancelled.store(true, Ordering::Release);
        let callback = self.slot.callback.lock().unwrap().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.slot.cancelled.load(Ordering::Acquire)
    }

    /// Register `callback` to run the first time this token is cancelled.
    /// If the token is already cancelled, `callback` runs immediately
    /// instead of being stored. Only the most recently registered callback
    /// is kept, matching asio's single-slot cancellation_slot (one
    /// primitive is ever in flight per operation at a time).
    pub fn register(&self, callback: impl FnOnce() + Send + 'static) {
        if self.is_cancelled() {
            callback();
            return;
        }
        *self.slot.callback.lock().unwrap() = Some(Box::new(callback));
        // `cancel()` may have raced us between the `is_cancelled` check
        // above and taking the lock; re-check and drain if so.
        if self.is_cancelled() {
            if let Some(callback) = self.slot.callback.lock().unwrap().take() {
                callback();
            }
        }
    }

    #[must_use]
    pub(crate) fn slot(&self) -> Arc<CancellationSlot> {
        Arc::clone(&self.slot)
    }
}

/// The shared flag backing a [`CancellationToken`].
#[derive(Default)]
pub struct CancellationSlot {
    cancelled: AtomicBool,
    callback: Mutex<Option<CancelCallback>>,
}

impl std::fmt::Debug for CancellationSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationSlot")
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl CancellationSlot {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
