//! Executor and allocator bindings (§4.3): the handle applications use to
//! submit work to a [`GrpcContext`], and the allocation customization point
//! operations are boxed through.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::context::GrpcContext;
use crate::operation::{container_of, Completion, Operation, OperationVTable};
use crate::rpc::RpcCompletionQueue;

/// Whether dispatch through this executor may run the submitted work
/// synchronously on the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocking {
    /// Dispatch always goes through the context's queues, even if the
    /// calling thread is the run thread.
    Never,
    /// Dispatch may run inline if the calling thread is already the run
    /// thread. This is the default -- it is what makes the context's own
    /// executor an "inline executor" for the purposes of §4.6's
    /// work-tracking elision.
    Possibly,
}

/// How a submission relates to work already queued, mirroring the
/// fork/continuation distinction asio-style executors expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relationship {
    /// The submitted work is unrelated to whatever is currently running;
    /// queue it behind existing local work.
    Fork,
    /// The submitted work is a continuation of the work that submitted it;
    /// queue it ahead of other local work so it runs next.
    Continuation,
}

/// Stable-Rust stand-in for the original's allocator customization point
/// (Rust's own `Allocator` trait is nightly-only). Defaults to
/// [`SystemAllocator`], a thin `Box::new` wrapper.
pub trait OperationAllocator: Clone + Send + 'static {
    #[must_use]
    fn allocate_boxed<T: Send + 'static>(&self, value: T) -> Box<T> {
        Box::new(value)
    }
}

/// The default [`OperationAllocator`]: ordinary heap allocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAllocator;

impl OperationAllocator for SystemAllocator {}

/// A handle to a [`GrpcContext`], carrying the blocking/relationship/
/// tracked-work/allocator options that govern how work submitted through it
/// is dispatched.
///
/// Cloning or constructing a `GrpcExecutor` with `tracked_work` enabled
/// bumps the context's outstanding-work counter; dropping it (including
/// each clone) decrements it again. This is what invariant #4 in §8 means
/// by "an executor with tracked_work keeps run alive until all copies of
/// the executor are destroyed" -- the work token is per-handle, not
/// per-context.
pub struct GrpcExecutor<Q, A = SystemAllocator> {
    ctx: Arc<GrpcContext<Q>>,
    blocking: Blocking,
    relationship: Relationship,
    tracked_work: bool,
    allocator: A,
}

impl<Q, A> GrpcExecutor<Q, A>
where
    Q: RpcCompletionQueue + 'static,
    A: OperationAllocator,
{
    /// The default executor a freshly-created context hands out:
    /// `blocking = possibly`, `relationship = fork`, tracked work on,
    /// system allocator.
    #[must_use]
    pub(crate) fn new(ctx: Arc<GrpcContext<Q>>) -> GrpcExecutor<Q, SystemAllocator> {
        ctx.work_started();
        GrpcExecutor {
            ctx,
            blocking: Blocking::Possibly,
            relationship: Relationship::Fork,
            tracked_work: true,
            allocator: SystemAllocator,
        }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<GrpcContext<Q>> {
        &self.ctx
    }

    #[must_use]
    pub fn blocking(&self) -> Blocking {
        self.blocking
    }

    #[must_use]
    pub fn relationship(&self) -> Relationship {
        self.relationship
    }

    #[must_use]
    pub fn tracked_work(&self) -> bool {
        self.tracked_work
    }

    /// The only "inline" executor this binding recognizes (§9 Open
    /// Question): `blocking = possibly` and the caller happens to already
    /// be the context's run thread. Decided structurally per-call, not
    /// detected via any runtime type inspection.
    #[must_use]
    pub fn is_inline(&self) -> bool {
        self.blocking == Blocking::Possibly && self.ctx.running_in_this_thread()
    }

    /// Return an executor with the requested blocking mode. Does not
    /// change work tracking.
    #[must_use]
    pub fn require_blocking(mut self, blocking: Blocking) -> Self {
        self.blocking = blocking;
        self
    }

    /// Return an executor with the requested fork/continuation
    /// relationship. Does not change work tracking.
    #[must_use]
    pub fn require_relationship(mut self, relationship: Relationship) -> Self {
        self.relationship = relationship;
        self
    }

    /// Return an executor with work-tracking turned on or off, adjusting
    /// the context's work counter by exactly one to account for the
    /// transition.
    #[must_use]
    pub fn require_tracked_work(mut self, tracked: bool) -> Self {
        if tracked != self.tracked_work {
            if tracked {
                self.ctx.work_started();
            } else {
                self.ctx.work_finished();
            }
            self.tracked_work = tracked;
        }
        self
    }

    /// Return an executor that allocates operation storage through
    /// `allocator` instead.
    #[must_use]
    pub fn require_allocator<A2: OperationAllocator>(self, allocator: A2) -> GrpcExecutor<Q, A2> {
        let ctx = Arc::clone(&self.ctx);
        let blocking = self.blocking;
        let relationship = self.relationship;
        let tracked_work = self.tracked_work;
        // `self` already holds this handle's one work token; forget it
        // instead of dropping so the token transfers to the new handle
        // rather than being released and never reacquired.
        std::mem::forget(self);
        GrpcExecutor {
            ctx,
            blocking,
            relationship,
            tracked_work,
            allocator,
        }
    }

    /// Submit a nullary closure to run on this executor.
    ///
    /// If the calling thread is the context's run thread, it is queued
    /// locally (at the front if `relationship = continuation`, otherwise
    /// at the back); if `blocking = possibly` and the calling thread is
    /// already the run thread this is true regardless of whether a
    /// caller would see it run "inline" -- the run loop still drains the
    /// local queue on its next pass rather than calling `f` from within
    /// `execute` itself, keeping the dispatch order predictable. From any
    /// other thread it is enqueued on the remote queue, waking the run
    /// loop if it was asleep. This is what §4.6's work-tracking decorator
    /// wraps: when `tracked_work` is set, the submitted closure's own
    /// lifetime (not just this executor handle's) holds a work token,
    /// released right after `f` runs or is discarded.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        debug_assert!(!self.ctx.is_stopped(), "{}", crate::error::ContextError::Stopped);
        tracing::trace!(
            relationship = ?self.relationship,
            on_run_thread = self.ctx.running_in_this_thread(),
            "executor dispatching closure"
        );
        if self.tracked_work {
            self.ctx.work_started();
        }
        let op = self.allocator.allocate_boxed(ExecuteOp {
            op: Operation::new(&ExecuteOp::<Q>::VTABLE),
            f: Some(Box::new(f)),
            tracked_work: self.tracked_work,
            ctx: Arc::clone(&self.ctx),
        });
        let raw = Box::into_raw(op);
        // SAFETY: `raw` was just allocated and embeds `Operation` as its
        // first field (`#[repr(C)]`); it is exclusively owned until
        // `submit`/`submit_local_front` hands it to the context.
        let op_ptr: NonNull<Operation> = unsafe { NonNull::new_unchecked(raw).cast() };
        let on_run_thread = self.ctx.running_in_this_thread();
        match (on_run_thread, self.relationship) {
            // SAFETY: `op_ptr` is a live, exclusively-owned, freshly
            // allocated operation.
            (true, Relationship::Continuation) => unsafe {
                self.ctx.submit_local_front(op_ptr);
            },
            (true, Relationship::Fork) => unsafe {
                self.ctx.submit_local(op_ptr);
            },
            (false, _) => unsafe {
                self.ctx.submit_remote(op_ptr);
            },
        }
    }
}

impl<Q: RpcCompletionQueue, A: Clone> Clone for GrpcExecutor<Q, A> {
    fn clone(&self) -> Self {
        if self.tracked_work {
            self.ctx.work_started();
        }
        Self {
            ctx: Arc::clone(&self.ctx),
            blocking: self.blocking,
            relationship: self.relationship,
            tracked_work: self.tracked_work,
            allocator: self.allocator.clone(),
        }
    }
}

impl<Q: RpcCompletionQueue, A> Drop for GrpcExecutor<Q, A> {
    fn drop(&mut self) {
        if self.tracked_work {
            self.ctx.work_finished();
        }
    }
}

impl<Q, A> std::fmt::Debug for GrpcExecutor<Q, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcExecutor")
            .field("blocking", &self.blocking)
            .field("relationship", &self.relationship)
            .field("tracked_work", &self.tracked_work)
            .finish_non_exhaustive()
    }
}

#[repr(C)]
struct ExecuteOp<Q> {
    op: Operation,
    f: Option<Box<dyn FnOnce() + Send>>,
    tracked_work: bool,
    ctx: Arc<GrpcContext<Q>>,
}

impl<Q: RpcCompletionQueue + 'static> ExecuteOp<Q> {
    // A `const` of a `Copy`, drop-glue-free type (a bare fn pointer here)
    // promotes to `'static` storage when referenced with `&`, giving each
    // monomorphization of `ExecuteOp<Q>` its own vtable without needing a
    // generic `static` item (which Rust does not allow directly).
    const VTABLE: OperationVTable = OperationVTable {
        complete: execute_complete::<Q>,
    };
}

unsafe fn execute_complete<Q: RpcCompletionQueue>(op: NonNull<Operation>, completion: Completion) {
    // SAFETY: `op` points at the `Operation` embedded as the first field
    // of a live, exclusively-owned `ExecuteOp<Q>`, per `execute`'s
    // contract; we own it exclusively from here, matching `Operation`'s
    // safety contract that `complete` runs exactly once.
    let state: NonNull<ExecuteOp<Q>> = unsafe { container_of(op) };
    let mut boxed = unsafe { Box::from_raw(state.as_ptr()) };
    if !completion.is_discard() {
        if let Some(f) = boxed.f.take() {
            f();
        }
    }
    if boxed.tracked_work {
        boxed.ctx.work_finished();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::sim::SimCompletionQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn execute_runs_on_run_loop() {
        let ctx = GrpcContext::new(SimCompletionQueue::new());
        let exec = ctx.get_executor();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        exec.execute(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        drop(exec);
        ctx.run().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cross_thread_execute_wakes_run() {
        let ctx = GrpcContext::new(SimCompletionQueue::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        let ctx2 = Arc::clone(&ctx);
        let handle = std::thread::spawn(move || {
            let exec = ctx2.get_executor();
            exec.execute(move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            });
        });
        handle.join().unwrap();
        ctx.run().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tracked_work_keeps_run_alive_until_dropped() {
        let ctx = GrpcContext::new(SimCompletionQueue::new());
        let exec = ctx.get_executor();
        let exec2 = exec.clone();
        // Two tracked-work tokens are outstanding (exec, exec2) and no
        // other work is queued; `run` must block rather than exit, and
        // must wake up and return once both are dropped -- not because
        // of any tag or explicit `stop()`.
        let ctx2 = Arc::clone(&ctx);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            drop(exec);
            drop(exec2);
            ctx2
        });
        ctx.run().unwrap();
        let _ctx2 = handle.join().unwrap();
    }
}
