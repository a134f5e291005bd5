//! A one-shot, `Waker`-based completion cell shared between an [`Operation`]
//! node and the future a caller is awaiting.
//!
//! This plays the role the original's `Sender`/`Receiver` oneshot channel
//! (one per asio completion handler) plays: the owning operation holds one
//! handle, the awaiting future holds the other, and whichever side finishes
//! last wakes (or observes) the value. Grounded on the teacher's
//! `sync::oneshot` channel shape, simplified to a `std::sync::Mutex` since
//! this crate is not `no_std` and does not carry the teacher's lock-free
//! `WaitCell` (see DESIGN.md).
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

enum State<T> {
    Pending,
    Waiting(Waker),
    Ready(T),
}

/// Shared slot a boxed [`Operation`](crate::operation::Operation) writes its
/// result into, and a `Future` polls for readiness.
pub(crate) struct CompletionSlot<T> {
    state: Mutex<State<T>>,
}

impl<T> CompletionSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending),
        }
    }

    /// Called from the run thread when the operation completes.
    pub(crate) fn set(&self, value: T) {
        let mut guard = self.state.lock().unwrap();
        let prev = std::mem::replace(&mut *guard, State::Ready(value));
        drop(guard);
        if let State::Waiting(waker) = prev {
            waker.wake();
        }
    }

    /// Called from the awaiting future's `poll`.
    pub(crate) fn poll(&self, cx: &mut Context<'_>) -> Poll<T> {
        let mut guard = self.state.lock().unwrap();
        match std::mem::replace(&mut *guard, State::Pending) {
            State::Ready(value) => Poll::Ready(value),
            State::Pending | State::Waiting(_) => {
                *guard = State::Waiting(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}
