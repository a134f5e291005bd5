//! The trait boundary between this crate and a concrete RPC C-core binding.
//!
//! No production gRPC binding is vendored into this workspace, so the "to
//! the RPC library" side of the external interface (completion queue,
//! server completion queue, alarm, responder types) is expressed as traits
//! here. A real binding crate (an FFI layer analogous to `grpc-sys`)
//! implements these traits against the actual C core; [`sim`] is an
//! in-process implementation used by this crate's own test suite.

pub mod primitives;
pub mod repeated_request;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

use std::fmt;
use std::time::Instant;

use bitflags::bitflags;

use crate::operation::Operation;
use std::ptr::NonNull;

/// A completion-queue tag: the address of the [`Operation`] that should be
/// completed when this tag comes back off the queue.
///
/// This is the Rust equivalent of the raw `void*` tag gRPC's C core passes
/// back and forth -- a `Tag` never is dereferenced by code in this module;
/// only [`crate::context::GrpcContext`]'s run loop (which knows the
/// `Operation` is alive) converts it back into an `Operation` pointer.
#[derive(Clone, Copy)]
pub struct Tag(NonNull<Operation>);

impl Tag {
    /// # Safety
    ///
    /// `op` must point at a live `Operation` that remains valid until this
    /// tag is delivered back through [`RpcCompletionQueue::next`].
    #[must_use]
    pub unsafe fn new(op: NonNull<Operation>) -> Self {
        Self(op)
    }

    #[must_use]
    pub fn into_operation(self) -> NonNull<Operation> {
        self.0
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({:p})", self.0.as_ptr())
    }
}

// SAFETY: a `Tag` is just an address; the pointed-to `Operation` is `Send`.
unsafe impl Send for Tag {}

/// How long [`RpcCompletionQueue::next`] may block before reporting
/// [`CompletionEvent::Timeout`].
#[derive(Debug, Clone, Copy)]
pub enum Deadline {
    /// Return immediately if nothing is ready (used for `poll`/`poll_one`).
    Now,
    /// Block until woken by a completion or an explicit wakeup tag.
    Infinite,
    /// Block until the given instant.
    At(Instant),
}

/// The result of polling a completion queue once.
#[derive(Debug)]
pub enum CompletionEvent {
    /// A tag completed.
    Tag { tag: Tag, ok: bool },
    /// The deadline elapsed with nothing ready.
    Timeout,
    /// The queue has been shut down and fully drained; no further events
    /// will ever be produced.
    Shutdown,
}

/// The completion queue a [`GrpcContext`](crate::context::GrpcContext)
/// drives.
pub trait RpcCompletionQueue: Send + Sync {
    /// Block (per `deadline`) for the next event.
    fn next(&self, deadline: Deadline) -> CompletionEvent;

    /// Begin shutting the queue down. `next` will return
    /// [`CompletionEvent::Shutdown`] once all outstanding tags have drained.
    fn shutdown(&self);

    /// Unblock a concurrent or future call to `next` without delivering any
    /// particular tag. Used to wake a sleeping
    /// [`GrpcContext`](crate::context::GrpcContext) run loop when a remote
    /// thread hands it new work; implementations typically realize this
    /// with their own alarm/interrupt primitive. A `next` call unblocked
    /// this way returns [`CompletionEvent::Timeout`], which is
    /// indistinguishable to the run loop from an ordinary deadline elapsing
    /// (both simply mean "recheck the local and remote queues").
    fn interrupt(&self);
}

impl<T: RpcCompletionQueue + ?Sized> RpcCompletionQueue for std::sync::Arc<T> {
    fn next(&self, deadline: Deadline) -> CompletionEvent {
        (**self).next(deadline)
    }

    fn shutdown(&self) {
        (**self).shutdown();
    }

    fn interrupt(&self) {
        (**self).interrupt();
    }
}

/// A completion queue used specifically to accept incoming calls.
///
/// gRPC's C core distinguishes the "notification" completion queue from the
/// "server" completion queue passed to `RequestCall`; most applications use
/// the same queue for both, but the distinction matters for the
/// repeated-request loop (§4.5), which always needs a server completion
/// queue handle.
pub trait ServerRpcCompletionQueue: RpcCompletionQueue {}

impl<T: ServerRpcCompletionQueue + ?Sized> ServerRpcCompletionQueue for std::sync::Arc<T> {}

/// A one-shot, cancellable deadline timer delivered through a completion
/// queue, mirroring the RPC library's own alarm primitive. This is the only
/// timer facility this crate provides; general-purpose timers are out of
/// scope.
pub trait Alarm: Send {
    /// Arm the alarm to fire `tag` at `deadline` on `cq`.
    fn set(&mut self, cq: &dyn RpcCompletionQueue, deadline: Instant, tag: Tag);

    /// Cancel a previously armed alarm. The tag still comes back through
    /// the completion queue, with `ok = false`.
    fn cancel(&mut self);
}

bitflags! {
    /// Per-message write options, mirroring `grpc::WriteOptions`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteOptions: u32 {
        const NONE = 0;
        const NO_COMPRESS = 0b001;
        const BUFFER_HINT = 0b010;
        const CORKED = 0b100;
    }
}

/// A minimal RPC status, mirroring `grpc::Status`'s code/message pair.
#[derive(Debug, Clone)]
pub struct RpcStatus {
    pub code: StatusCode,
    pub message: String,
}

impl RpcStatus {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

/// The subset of gRPC status codes this crate's tests and scenarios need.
/// A production binding will use its own, complete status code enum; this
/// one exists only so `rpc::sim` and this crate's own tests have something
/// concrete to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    DeadlineExceeded,
    Unavailable,
}

/// Common behavior of every responder handle: sending initial metadata.
pub trait Responder: Send {
    /// Asynchronously send initial metadata ahead of the first response
    /// message. Completes `tag` when done.
    fn send_initial_metadata(&mut self, tag: Tag);
}

/// Server-side responder for a unary RPC (`ServerAsyncResponseWriter`).
pub trait UnaryResponder<Resp>: Responder {
    fn finish(&mut self, response: Resp, status: RpcStatus, tag: Tag);
    fn finish_with_error(&mut self, status: RpcStatus, tag: Tag);
}

/// Server-side responder for a client-streaming RPC (`ServerAsyncReader`).
pub trait ClientStreamingResponder<Req, Resp>: Responder {
    /// Read the next request message. Completes `tag` with `ok = false`
    /// once the client half-closes the stream.
    fn read(&mut self, tag: Tag) -> ReadSlot<Req>;
    fn finish(&mut self, response: Resp, status: RpcStatus, tag: Tag);
    fn finish_with_error(&mut self, status: RpcStatus, tag: Tag);
}

/// Server-side responder for a server-streaming RPC (`ServerAsyncWriter`).
pub trait ServerStreamingResponder<Resp>: Responder {
    fn write(&mut self, response: Resp, options: WriteOptions, tag: Tag);

    /// Write the final response message. Distinct from `write` only in
    /// that it tells the implementation no further `write` will follow
    /// before `finish` -- a real binding can use this to cork the last
    /// message onto the same batch as the status, the way
    /// `ServerAsyncWriter::WriteLast` does.
    fn write_last(&mut self, response: Resp, options: WriteOptions, tag: Tag);

    fn finish(&mut self, status: RpcStatus, tag: Tag);
}

/// Server-side responder for a bidirectional-streaming RPC
/// (`ServerAsyncReaderWriter`).
pub trait BidiStreamingResponder<Req, Resp>: Responder {
    fn read(&mut self, tag: Tag) -> ReadSlot<Req>;
    fn write(&mut self, response: Resp, options: WriteOptions, tag: Tag);
    fn write_and_finish(&mut self, response: Resp, options: WriteOptions, status: RpcStatus, tag: Tag);
    fn finish(&mut self, status: RpcStatus, tag: Tag);
}

/// A handle a `read` call writes its message into once the corresponding
/// tag completes with `ok = true`.
///
/// Modeled as a small shared cell rather than an out-parameter reference so
/// that the responder implementation (which may run the read on another
/// thread, as `rpc::sim` does) does not need to borrow across the await
/// point.
pub type ReadSlot<T> = std::sync::Arc<std::sync::Mutex<Option<T>>>;

#[must_use]
pub fn new_read_slot<T>() -> ReadSlot<T> {
    std::sync::Arc::new(std::sync::Mutex::new(None))
}

/// A handle a client-side `finish` call writes its final status into.
pub type StatusSlot = std::sync::Arc<std::sync::Mutex<Option<RpcStatus>>>;

#[must_use]
pub fn new_status_slot() -> StatusSlot {
    std::sync::Arc::new(std::sync::Mutex::new(None))
}

/// A handle a client-side unary `finish` call writes its response message
/// and final status into.
pub type UnaryResult<T> = std::sync::Arc<std::sync::Mutex<Option<(T, RpcStatus)>>>;

#[must_use]
pub fn new_unary_result<T>() -> UnaryResult<T> {
    std::sync::Arc::new(std::sync::Mutex::new(None))
}

/// Client-side call handle for a unary RPC (`ClientAsyncResponseReader`
/// equivalent).
pub trait UnaryCall<Resp>: Send {
    /// Wait for the response message and final status. Completes `tag`
    /// once both have arrived.
    fn finish(&mut self, tag: Tag) -> UnaryResult<Resp>;
}

/// Client-side call handle for a client-streaming RPC
/// (`ClientAsyncWriter` equivalent).
pub trait ClientStreamingCall<Req, Resp>: Send {
    fn write(&mut self, request: Req, options: WriteOptions, tag: Tag);
    fn writes_done(&mut self, tag: Tag);
    fn finish(&mut self, tag: Tag) -> UnaryResult<Resp>;
}

/// Client-side call handle for a server-streaming RPC
/// (`ClientAsyncReader` equivalent).
pub trait ServerStreamingCall<Resp>: Send {
    /// Completes `tag` with `ok = false` once the server half-closes the
    /// stream.
    fn read(&mut self, tag: Tag) -> ReadSlot<Resp>;
    fn finish(&mut self, tag: Tag) -> StatusSlot;
}

/// Client-side call handle for a bidirectional-streaming RPC
/// (`ClientAsyncReaderWriter` equivalent).
pub trait BidiStreamingCall<Req, Resp>: Send {
    fn read(&mut self, tag: Tag) -> ReadSlot<Resp>;
    fn write(&mut self, request: Req, options: WriteOptions, tag: Tag);
    fn writes_done(&mut self, tag: Tag);
    fn finish(&mut self, tag: Tag) -> StatusSlot;
}
