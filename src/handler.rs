//! Completion-handler decoration (§4.6).
//!
//! The original composes three decorators around every asio completion
//! handler: `UnbindResult` strips the associated executor/allocator/
//! cancellation-slot off the handler and remembers them;
//! `WorkTrackingCompletionHandler` wraps dispatch with a work-counted
//! executor preference (elided for the context's own inline executor);
//! `AssociatedCompletionHandler` forwards the associator queries to the
//! values `UnbindResult` captured.
//!
//! Rust's `Future`/`Waker` model already supplies "resume where woken" --
//! there is no handler object distinct from the thing being awaited. What
//! remains to realize here is: *which* executor a primitive's completion
//! runs its continuation on, and whether dispatching onto it keeps
//! `GrpcContext::run` alive. [`CompletionContext`] is the `UnbindResult`
//! step (capturing the executor + cancellation token at operation-start
//! time); its `dispatch` method is `WorkTrackingCompletionHandler` +
//! `AssociatedCompletionHandler` collapsed into one call, since
//! `GrpcExecutor::execute` already brackets the submitted closure with
//! work-tracking per its `tracked_work` option (§4.3).

use crate::cancellation::CancellationToken;
use crate::executor::{GrpcExecutor, OperationAllocator};
use crate::rpc::RpcCompletionQueue;

/// The associated state a primitive captures from its caller at start time:
/// an executor to dispatch the completion on, and a cancellation token to
/// forward or check.
///
/// Constructed once per primitive invocation and stored inside that
/// primitive's operation node alongside the `Operation` header.
pub struct CompletionContext<Q, A = crate::executor::SystemAllocator> {
    executor: GrpcExecutor<Q, A>,
    cancellation: CancellationToken,
}

impl<Q, A> CompletionContext<Q, A>
where
    Q: RpcCompletionQueue,
    A: OperationAllocator,
{
    #[must_use]
    pub fn new(executor: GrpcExecutor<Q, A>, cancellation: CancellationToken) -> Self {
        Self {
            executor,
            cancellation,
        }
    }

    #[must_use]
    pub fn executor(&self) -> &GrpcExecutor<Q, A> {
        &self.executor
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Run `f` on the associated executor, per the `blocking = possibly`
    /// rule from §4.6: if the executor is the context's own inline
    /// executor and the call is already happening on the run thread, run
    /// `f` synchronously; otherwise dispatch it through
    /// [`GrpcExecutor::execute`], which brackets it with work-tracking
    /// when the executor has `tracked_work` enabled.
    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.executor.is_inline() {
            f();
        } else {
            self.executor.execute(f);
        }
    }
}
