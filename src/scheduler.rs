//! The *schedule* sender (§4.7): a cheap awaitable that completes on the
//! context's run thread.
//!
//! The original carries two near-identical `ScheduleSender` types -- a
//! public, `connect`-only one and a `detail` one with an extra `submit`
//! fast path used internally by the primitives and the repeated-request
//! loop to dispatch a closure without building a full sender/receiver pair.
//! Per §9's note, this crate does not replicate that duplication: `submit`
//! is equivalent to `execute()` on the same executor a `schedule().await`
//! would resume on, so [`GrpcScheduler::spawn_detached`] is kept as the one
//! non-public fast path, and [`ScheduleSender`] (itself a plain
//! `std::future::Future`, per the realization described in
//! `crate::handler`) is the one sender type applications see.

use std::future::Future;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::completion::CompletionSlot;
use crate::context::GrpcContext;
use crate::executor::{OperationAllocator, SystemAllocator};
use crate::operation::{container_of, Completion, Operation, OperationVTable};
use crate::rpc::RpcCompletionQueue;

/// How a [`ScheduleSender`] completed.
///
/// Stands in for the sender/receiver framework's separate value/done
/// completion channels (§4.7: `sends_done = false` in the non-shutdown
/// path, `value_types = ()`): a plain `Future` has only one output type, so
/// the two outcomes the original models as distinct completion channels are
/// folded into this enum instead of (mis-)using `Result`'s error channel
/// for a condition that is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// The operation ran its turn on the context's run thread.
    Completed,
    /// The context had already stopped; the operation was discarded
    /// without running.
    ContextStopped,
}

impl ScheduleOutcome {
    #[must_use]
    pub fn is_completed(self) -> bool {
        matches!(self, ScheduleOutcome::Completed)
    }
}

/// A factory for [`ScheduleSender`]s bound to one [`GrpcContext`].
///
/// Obtained from [`GrpcContext::get_scheduler`].
pub struct GrpcScheduler<Q> {
    ctx: Arc<GrpcContext<Q>>,
}

impl<Q: RpcCompletionQueue + 'static> GrpcScheduler<Q> {
    #[must_use]
    pub(crate) fn new(ctx: Arc<GrpcContext<Q>>) -> Self {
        Self { ctx }
    }

    /// Return a sender that, once polled, schedules one turn on the
    /// context's run thread (submitting to the local queue if already
    /// running there, the remote queue otherwise) and completes when that
    /// turn runs.
    #[must_use]
    pub fn schedule(&self) -> ScheduleSender<Q> {
        ScheduleSender {
            ctx: Arc::clone(&self.ctx),
            allocator: SystemAllocator,
            started: false,
            slot: Arc::new(CompletionSlot::new()),
        }
    }

    /// Submit `f` to run on the context's run thread without building an
    /// awaitable around it -- the `detail::ScheduleSender::submit` fast
    /// path, used internally wherever a caller wants fire-and-forget
    /// dispatch rather than a value to await.
    pub(crate) fn spawn_detached(&self, f: impl FnOnce() + Send + 'static) {
        self.ctx.get_executor().execute(f);
    }
}

impl<Q> Clone for GrpcScheduler<Q> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
        }
    }
}

#[repr(C)]
struct ScheduleOp<Q> {
    op: Operation,
    slot: Arc<CompletionSlot<ScheduleOutcome>>,
    ctx: Arc<GrpcContext<Q>>,
}

impl<Q: RpcCompletionQueue + 'static> ScheduleOp<Q> {
    const VTABLE: OperationVTable = OperationVTable {
        complete: schedule_complete::<Q>,
    };
}

unsafe fn schedule_complete<Q: RpcCompletionQueue>(op: NonNull<Operation>, completion: Completion) {
    // SAFETY: `op` is the header of a live, exclusively-owned `ScheduleOp<Q>`
    // allocated by `ScheduleSender::poll`, per `Operation::complete`'s
    // contract.
    let state: NonNull<ScheduleOp<Q>> = unsafe { container_of(op) };
    let boxed = unsafe { Box::from_raw(state.as_ptr()) };
    let outcome = if completion.is_discard() {
        ScheduleOutcome::ContextStopped
    } else {
        ScheduleOutcome::Completed
    };
    boxed.slot.set(outcome);
    boxed.ctx.work_finished();
}

/// A sender whose first `poll` schedules one turn on the owning context's
/// run thread and whose subsequent polls report that turn's outcome.
///
/// `ScheduleSender` is cold: constructing one via
/// [`GrpcScheduler::schedule`] does nothing by itself, exactly like a
/// `connect`ed-but-not-`start`ed sender/receiver operation state. The first
/// `poll` is the `start()` call; this is also what realizes the
/// `original_source` distinction between `connect` (build the operation
/// state) and `start` (actually submit it) without needing a separate
/// receiver type, since a `Future`'s executor *is* the receiver.
pub struct ScheduleSender<Q, A = SystemAllocator> {
    ctx: Arc<GrpcContext<Q>>,
    allocator: A,
    started: bool,
    slot: Arc<CompletionSlot<ScheduleOutcome>>,
}

impl<Q, A> Unpin for ScheduleSender<Q, A> {}

impl<Q, A> Future for ScheduleSender<Q, A>
where
    Q: RpcCompletionQueue + 'static,
    A: OperationAllocator,
{
    type Output = ScheduleOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.started {
            this.started = true;
            if this.ctx.is_stopped() {
                return Poll::Ready(ScheduleOutcome::ContextStopped);
            }
            this.ctx.work_started();
            let boxed = this.allocator.allocate_boxed(ScheduleOp {
                op: Operation::new(&ScheduleOp::<Q>::VTABLE),
                slot: Arc::clone(&this.slot),
                ctx: Arc::clone(&this.ctx),
            });
            let raw = Box::into_raw(boxed);
            // SAFETY: `raw` was just allocated and embeds `Operation` as
            // its first field; it is exclusively owned until `submit`
            // hands it to the context.
            let op_ptr: NonNull<Operation> = unsafe { NonNull::new_unchecked(raw).cast() };
            // SAFETY: forwarding the guarantee above.
            unsafe {
                this.ctx.submit(op_ptr);
            }
        }
        this.slot.poll(cx)
    }
}
