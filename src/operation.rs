//! The type-erased operation node.
//!
//! Every pending unit of work known to a [`GrpcContext`](crate::context::GrpcContext)
//! -- a queued `execute()` closure, a schedule-sender waiting for its turn on
//! the run thread, an in-flight RPC primitive -- is represented by an
//! [`Operation`]. It carries just enough information to be queued
//! (an intrusive link) and completed (a function pointer), with the
//! type-specific state living in whatever struct embeds the `Operation` as
//! its first field.
//!
//! This is a much smaller relative of the vtable-based type erasure the
//! async-executor literature usually reaches for (a full ref-counted task
//! with join handles and wakers): an `Operation` has exactly one owner, is
//! never shared, and completes exactly once.

use std::ptr::NonNull;

use crate::queue::{Linked, Links};

/// How an [`Operation`] is being completed.
#[derive(Debug, Clone, Copy)]
pub enum Completion {
    /// Ordinary completion: run the operation's success path.
    Invoke,
    /// Completion of an RPC tag, carrying the completion queue's `ok` flag.
    InvokeRpc { ok: bool },
    /// The owning context is shutting down. Run the operation's
    /// cancellation path instead of its success path; the operation must
    /// not touch the completion queue or any other context state.
    Discard,
}

impl Completion {
    #[must_use]
    pub fn is_discard(&self) -> bool {
        matches!(self, Completion::Discard)
    }

    #[must_use]
    pub fn ok(&self) -> bool {
        matches!(self, Completion::Invoke | Completion::InvokeRpc { ok: true })
    }
}

type CompleteFn = unsafe fn(NonNull<Operation>, Completion);

/// The vtable for an [`Operation`]: a single function pointer invoked
/// exactly once, however the operation ends.
pub struct OperationVTable {
    pub complete: CompleteFn,
}

static_assertions::assert_eq_size!(CompleteFn, usize);

/// Intrusive, type-erased operation node.
///
/// `Operation` is always embedded as the first field of a larger struct
/// (the "operation state") that holds whatever the specific primitive
/// needs -- a waker, a result slot, a responder handle. The run loop only
/// ever touches the `Operation` header; `complete` is responsible for
/// recovering the containing struct via `NonNull::cast`.
#[repr(C)]
pub struct Operation {
    links: Links<Operation>,
    vtable: &'static OperationVTable,
}

impl Operation {
    pub const fn new(vtable: &'static OperationVTable) -> Self {
        Self {
            links: Links::new(),
            vtable,
        }
    }

    /// Complete this operation.
    ///
    /// # Safety
    ///
    /// `op` must point at a live `Operation` that is the first field of its
    /// containing struct, and the caller must not touch `op` again after
    /// this call (the vtable function is free to deallocate it).
    pub unsafe fn complete(op: NonNull<Operation>, completion: Completion) {
        // SAFETY: caller guarantees `op` is live and correctly embedded.
        let vtable = unsafe { op.as_ref().vtable };
        // SAFETY: forwarding the caller's guarantee.
        unsafe {
            (vtable.complete)(op, completion);
        }
    }
}

static_assertions::assert_impl_all!(Operation: Send);

// SAFETY: `Operation` nodes are only ever accessed by the single thread that
// dequeues them, or handed across threads as a bare pointer before any
// access occurs; the containing state types are `Send`.
unsafe impl Send for Operation {}

// SAFETY: see `queue::Linked`'s contract; the run loop is the sole accessor
// of the `links` field while an `Operation` is queued.
unsafe impl Linked for Operation {
    fn links(&self) -> &Links<Self> {
        &self.links
    }
}

/// Casts a pointer to an `Operation` header back to its containing state
/// type `S`, which must embed `Operation` as its first field (enforced by
/// `#[repr(C)]` on both sides).
///
/// # Safety
///
/// `op` must point at the `Operation` header embedded as the first field of
/// a live `S`.
pub unsafe fn container_of<S>(op: NonNull<Operation>) -> NonNull<S> {
    op.cast()
}
