//! The execution context that owns a completion queue and drives it.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use crate::error::ContextError;
use crate::executor::GrpcExecutor;
use crate::operation::{Completion, Operation};
use crate::queue::{AtomicIntrusiveQueue, IntrusiveQueue};
use crate::rpc::{CompletionEvent, Deadline, RpcCompletionQueue};
use crate::scheduler::GrpcScheduler;

/// An async execution context backed by a tag-based completion queue.
///
/// `GrpcContext` is the bridge between a completion-queue RPC runtime and
/// `std::future`: it owns the completion queue, a local (run-thread-only)
/// operation queue, and a remote (cross-thread) operation queue, and drives
/// all three from a single run loop. Exactly one thread may be inside
/// [`run`](Self::run) (or its siblings) at a time; all other access is
/// thread-safe.
pub struct GrpcContext<Q> {
    cq: Q,
    local: UnsafeCell<IntrusiveQueue<Operation>>,
    remote: AtomicIntrusiveQueue<Operation>,
    work_count: AtomicUsize,
    stopped: AtomicBool,
    run_thread: Mutex<Option<ThreadId>>,
}

// SAFETY: `local` is only ever touched by the single thread currently
// inside `run`/`run_one`/`poll`/`poll_one`, which `run_thread` enforces by
// refusing a second concurrent run. `remote`, `work_count`, and `stopped`
// are all atomics.
unsafe impl<Q: Send> Sync for GrpcContext<Q> {}

impl<Q: RpcCompletionQueue> GrpcContext<Q> {
    #[must_use]
    pub fn new(cq: Q) -> Arc<Self> {
        Arc::new(Self {
            cq,
            local: UnsafeCell::new(IntrusiveQueue::new()),
            remote: AtomicIntrusiveQueue::with_initial_state(true),
            work_count: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            run_thread: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn completion_queue(&self) -> &Q {
        &self.cq
    }

    /// Get an executor bound to this context with the default options
    /// (`blocking = possibly`, `relationship = fork`, tracked work on).
    #[must_use]
    pub fn get_executor(self: &Arc<Self>) -> GrpcExecutor<Q> {
        GrpcExecutor::new(Arc::clone(self))
    }

    /// Get a scheduler sender factory bound to this context.
    #[must_use]
    pub fn get_scheduler(self: &Arc<Self>) -> GrpcScheduler<Q> {
        GrpcScheduler::new(Arc::clone(self))
    }

    /// Increment the outstanding-work counter. The run loop keeps running
    /// as long as this counter is above zero.
    pub fn work_started(&self) {
        self.work_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the outstanding-work counter. If this was the last
    /// outstanding unit of work, wakes the run loop so it can observe the
    /// counter reaching zero and return -- otherwise a run loop blocked
    /// inside the completion-queue poll with no further tags coming would
    /// never notice.
    pub fn work_finished(&self) {
        let prev = self.work_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "work_finished called without matching work_started");
        if prev == 1 {
            tracing::trace!("work counter reached zero, interrupting run loop");
            self.cq.interrupt();
        }
    }

    /// Request that the run loop stop as soon as it next checks, regardless
    /// of outstanding work. Idempotent.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.cq.interrupt();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Reset the stop flag so the context can be `run` again. Must not be
    /// called while a thread is inside `run`.
    pub fn reset(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn running_in_this_thread(&self) -> bool {
        let current = std::thread::current().id();
        matches!(*self.run_thread.lock().unwrap(), Some(id) if id == current)
    }

    /// Submit an operation to the local queue. Only valid from the run
    /// thread.
    ///
    /// # Safety
    ///
    /// `op` must point at a live, exclusively-owned `Operation`.
    pub(crate) unsafe fn submit_local(&self, op: NonNull<Operation>) {
        debug_assert!(self.running_in_this_thread());
        // SAFETY: only the run thread touches `local`, and we are it.
        unsafe {
            (*self.local.get()).push_back(op.as_ptr());
        }
    }

    /// Submit an operation to the front of the local queue, so it runs
    /// before already-queued work. Only valid from the run thread.
    ///
    /// # Safety
    ///
    /// `op` must point at a live, exclusively-owned `Operation`.
    pub(crate) unsafe fn submit_local_front(&self, op: NonNull<Operation>) {
        debug_assert!(self.running_in_this_thread());
        // SAFETY: only the run thread touches `local`, and we are it.
        unsafe {
            (*self.local.get()).push_front(op.as_ptr());
        }
    }

    /// Submit an operation to the remote queue, waking the run loop if it
    /// was asleep.
    ///
    /// # Safety
    ///
    /// `op` must point at a live, exclusively-owned `Operation`.
    pub(crate) unsafe fn submit_remote(&self, op: NonNull<Operation>) {
        // SAFETY: forwarding caller's guarantee.
        let was_inactive = unsafe { self.remote.enqueue(op.as_ptr()) };
        if was_inactive {
            tracing::trace!("remote queue was inactive, waking run loop");
            self.cq.interrupt();
        }
    }

    /// Submit to the local queue if called from the run thread, otherwise
    /// to the remote queue. This is the dispatch rule every primitive and
    /// the schedule sender use to decide how to hand work to the context.
    ///
    /// # Safety
    ///
    /// `op` must point at a live, exclusively-owned `Operation`.
    pub(crate) unsafe fn submit(&self, op: NonNull<Operation>) {
        if self.running_in_this_thread() {
            // SAFETY: forwarding caller's guarantee.
            unsafe { self.submit_local(op) };
        } else {
            // SAFETY: forwarding caller's guarantee.
            unsafe { self.submit_remote(op) };
        }
    }

    fn enter_run(&self) -> Result<RunGuard<'_, Q>, ContextError> {
        let mut slot = self.run_thread.lock().unwrap();
        if slot.is_some() {
            return Err(ContextError::AlreadyRunning);
        }
        *slot = Some(std::thread::current().id());
        drop(slot);
        Ok(RunGuard { ctx: self })
    }

    /// Drain the local queue, then splice in anything waiting on the remote
    /// queue, repeating until both are empty. Returns `true` if any
    /// operation was completed.
    fn drain_queues(&self) -> bool {
        let mut did_work = false;
        loop {
            loop {
                // SAFETY: called only from the run thread.
                let next = unsafe { (*self.local.get()).pop_front() };
                let Some(op) = next else { break };
                did_work = true;
                // SAFETY: `op` came from our own local queue, which only
                // ever holds live, exclusively-owned operations.
                unsafe {
                    Operation::complete(
                        NonNull::new_unchecked(op),
                        if self.stopped.load(Ordering::Acquire) {
                            Completion::Discard
                        } else {
                            Completion::Invoke
                        },
                    );
                }
            }

            let drained = self.remote.try_mark_inactive_or_dequeue_all();
            if drained.is_empty() {
                break;
            }
            // SAFETY: only the run thread touches `local`.
            unsafe {
                (*self.local.get()).append(drained);
            }
        }
        did_work
    }

    fn run_impl(&self, deadline: impl Fn() -> Deadline) -> Result<bool, ContextError> {
        let _guard = self.enter_run()?;
        let mut did_work = false;
        loop {
            did_work |= self.drain_queues();

            if self.stopped.load(Ordering::Acquire) {
                tracing::trace!("run loop observed stop");
                return Ok(did_work);
            }
            if self.work_count.load(Ordering::Acquire) == 0 {
                tracing::trace!("run loop observed zero outstanding work");
                return Ok(did_work);
            }

            match self.cq.next(deadline()) {
                CompletionEvent::Shutdown => {
                    tracing::debug!("completion queue shut down, run loop exiting");
                    return Ok(did_work);
                }
                CompletionEvent::Timeout => continue,
                CompletionEvent::Tag { tag, ok } => {
                    did_work = true;
                    let op = tag.into_operation();
                    let completion = if self.stopped.load(Ordering::Acquire) {
                        Completion::Discard
                    } else {
                        Completion::InvokeRpc { ok }
                    };
                    tracing::trace!(tag = ?op, ok, "completion queue delivered tag");
                    // SAFETY: `tag` was constructed from a live `Operation`
                    // by whoever submitted the RPC primitive, and the
                    // completion queue guarantees each tag is delivered
                    // exactly once.
                    unsafe {
                        Operation::complete(op, completion);
                    }
                    return Ok(true);
                }
            }
        }
    }

    /// Run until there is no more outstanding work or [`stop`](Self::stop)
    /// is called, blocking between events.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn run(&self) -> Result<(), ContextError> {
        tracing::debug!("entering run loop");
        loop {
            let did_work = self.run_impl(|| Deadline::Infinite)?;
            if self.stopped.load(Ordering::Acquire) || self.work_count.load(Ordering::Acquire) == 0 {
                tracing::debug!("run loop returning");
                return Ok(());
            }
            if !did_work {
                // spurious wakeup with nothing to do; loop and block again
                continue;
            }
        }
    }

    /// Run until exactly one operation has completed, or there is nothing
    /// left to do.
    pub fn run_one(&self) -> Result<bool, ContextError> {
        self.run_impl(|| Deadline::Infinite)
    }

    /// Run only currently-ready work; never blocks.
    pub fn poll(&self) -> Result<bool, ContextError> {
        let mut any = false;
        loop {
            let did_work = self.run_impl(|| Deadline::Now)?;
            any |= did_work;
            if !did_work || self.stopped.load(Ordering::Acquire) || self.work_count.load(Ordering::Acquire) == 0 {
                return Ok(any);
            }
        }
    }

    /// Run at most one currently-ready operation; never blocks.
    pub fn poll_one(&self) -> Result<bool, ContextError> {
        self.run_impl(|| Deadline::Now)
    }
}

struct RunGuard<'a, Q> {
    ctx: &'a GrpcContext<Q>,
}

impl<Q> Drop for RunGuard<'_, Q> {
    fn drop(&mut self) {
        *self.ctx.run_thread.lock().unwrap() = None;
    }
}
