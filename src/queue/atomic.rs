//! Lock-free intrusive MPSC queue with an "active/inactive" producer state,
//! ported from the completion-queue runtime's atomic intrusive queue.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

use super::{IntrusiveQueue, Linked};

/// A lock-free multi-producer, single-consumer intrusive queue.
///
/// The queue has two states for its (single) consumer side: *active* and
/// *inactive*. While inactive, an `enqueue` that observes the queue going
/// from empty to non-empty returns `true`, telling the producer that it is
/// responsible for waking the consumer up (there is nobody else watching the
/// queue). This is how cross-thread submissions to a sleeping
/// [`GrpcContext`](crate::context::GrpcContext) avoid a lost wakeup without
/// a lock: the producer only pays for a wakeup notification when the
/// consumer was actually asleep.
///
/// The "inactive" sentinel is the address of the queue's own `head` field,
/// cast to `*mut T`. No real node can ever live at that address, so it can
/// never be confused with a queued item, and it is never dereferenced.
pub struct AtomicIntrusiveQueue<T> {
    // Padded so the head word, hammered by every producer's CAS loop, does
    // not share a cache line with whatever the consumer keeps next to this
    // queue (e.g. `GrpcContext`'s own fields).
    head: CachePadded<AtomicPtr<T>>,
}

impl<T: Linked> AtomicIntrusiveQueue<T> {
    pub const fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    pub fn with_initial_state(initially_active: bool) -> Self {
        let queue = Self::new();
        if !initially_active {
            queue.head.store(queue.inactive_sentinel(), Ordering::Relaxed);
        }
        queue
    }

    fn inactive_sentinel(&self) -> *mut T {
        (&*self.head as *const AtomicPtr<T>).cast_mut().cast()
    }

    /// Attempt to transition the queue from inactive to active.
    ///
    /// Returns `true` if the previous state was inactive and this call
    /// successfully marked it active.
    #[must_use]
    pub fn try_mark_active(&self) -> bool {
        let inactive = self.inactive_sentinel();
        self.head
            .compare_exchange(inactive, ptr::null_mut(), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Enqueue `item`.
    ///
    /// Returns `true` if the queue was inactive before this call, meaning
    /// the caller is responsible for waking the consumer.
    ///
    /// # Safety
    ///
    /// `item` must point at a live node that is not currently linked into
    /// any other queue, and must remain live and unmoved until it is
    /// dequeued.
    #[must_use]
    pub unsafe fn enqueue(&self, item: *mut T) -> bool {
        let inactive = self.inactive_sentinel();
        let mut old_value = self.head.load(Ordering::Relaxed);
        loop {
            let next = if old_value == inactive {
                ptr::null_mut()
            } else {
                old_value
            };
            // SAFETY: caller guarantees `item` is a live, exclusively-owned node.
            unsafe {
                (*item).links().next.store(next, Ordering::Relaxed);
            }
            match self
                .head
                .compare_exchange_weak(old_value, item, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return old_value == inactive,
                Err(actual) => old_value = actual,
            }
        }
    }

    /// Attempt to mark the queue inactive. Only succeeds if the queue is
    /// currently empty (head is null, not the inactive sentinel).
    pub fn try_mark_inactive(&self) -> bool {
        let inactive = self.inactive_sentinel();
        let old_value = self.head.load(Ordering::Relaxed);
        if old_value.is_null() {
            self.head
                .compare_exchange(ptr::null_mut(), inactive, Ordering::Release, Ordering::Relaxed)
                .is_ok()
        } else {
            false
        }
    }

    /// Either mark the queue inactive (if it was empty) or drain it,
    /// returning the drained items in FIFO order.
    ///
    /// Not valid to call while the queue is already marked inactive.
    #[must_use]
    pub fn try_mark_inactive_or_dequeue_all(&self) -> IntrusiveQueue<T> {
        if self.try_mark_inactive() {
            return IntrusiveQueue::new();
        }
        let old_head = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        // SAFETY: `old_head` was produced by `enqueue`, which builds a valid
        // reverse-chronological singly-linked chain of live nodes.
        unsafe { IntrusiveQueue::make_reversed(old_head) }
    }
}

impl<T: Linked> Default for AtomicIntrusiveQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: all mutable state is accessed exclusively through atomic ops on `head`.
unsafe impl<T: Send> Send for AtomicIntrusiveQueue<T> {}
// SAFETY: all mutable state is accessed exclusively through atomic ops on `head`.
unsafe impl<T: Send> Sync for AtomicIntrusiveQueue<T> {}
