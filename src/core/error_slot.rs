//! Terminal error aggregation.
//!
//! [`ErrorSlot`] collects errors from any number of concurrent sources and hands
//! them out once, merged, when the terminal signal is emitted. It is a lock-free
//! stack of error nodes whose head is swapped for a sealed marker on termination;
//! errors arriving after that go to the context's undeliverable sink.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::context::Context;
use crate::core::traits::Subscriber;
use crate::error::Error;

struct Node {
    error: Error,
    next: *mut Node,
}

/// Marker stored in the head once the slot has been terminated. Never a real
/// allocation: it is the dangling, well-aligned address.
fn sealed() -> *mut Node {
    NonNull::<Node>::dangling().as_ptr()
}

enum Taken {
    Empty,
    Error(Error),
    AlreadyTerminated,
}

/// Lock-free holder of the terminal error of one subscription.
pub struct ErrorSlot {
    head: AtomicPtr<Node>,
    ctx: Context,
}

impl ErrorSlot {
    pub fn new(ctx: Context) -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            ctx,
        }
    }

    /// Record an error.
    ///
    /// Returns `true` when this was the first error recorded. After
    /// [`terminate`](Self::terminate) the error is routed to the undeliverable sink
    /// and `false` is returned.
    pub fn add_error(&self, error: Error) -> bool {
        let node = Box::into_raw(Box::new(Node {
            error,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head == sealed() {
                // SAFETY: `node` was never published, this thread still owns it.
                let node = unsafe { Box::from_raw(node) };
                self.ctx.on_undeliverable(node.error);
                return false;
            }
            // SAFETY: `node` is not yet visible to other threads.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return head.is_null(),
                Err(actual) => head = actual,
            }
        }
    }

    /// `true` while an error is pending and the slot has not been terminated.
    pub fn has_error(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        !head.is_null() && head != sealed()
    }

    pub fn is_terminated(&self) -> bool {
        self.head.load(Ordering::Acquire) == sealed()
    }

    /// Seal the slot and return what was recorded: the single error, or a
    /// composite of all of them in arrival order.
    pub fn terminate(&self) -> Option<Error> {
        match self.take() {
            Taken::Error(error) => Some(error),
            Taken::Empty | Taken::AlreadyTerminated => None,
        }
    }

    /// Seal the slot and emit the matching terminal signal, unless another caller
    /// already did.
    pub fn try_terminate_consumer<T>(&self, subscriber: &dyn Subscriber<T>) {
        match self.take() {
            Taken::Empty => subscriber.on_complete(),
            Taken::Error(error) => subscriber.on_error(error),
            Taken::AlreadyTerminated => {}
        }
    }

    /// Seal the slot, routing any pending error to the undeliverable sink.
    pub fn try_terminate_and_report(&self) {
        if let Taken::Error(error) = self.take() {
            self.ctx.on_undeliverable(error);
        }
    }

    fn take(&self) -> Taken {
        let head = self.head.swap(sealed(), Ordering::AcqRel);
        if head == sealed() {
            return Taken::AlreadyTerminated;
        }
        // SAFETY: the swap detached the list; the sealed marker stops every later
        // `add_error` from linking onto it, so this thread owns every node.
        match unsafe { drain_nodes(head) } {
            errors if errors.is_empty() => Taken::Empty,
            errors => Taken::Error(Error::composite(errors)),
        }
    }
}

/// Take ownership of a detached list, returning its errors oldest first.
///
/// # Safety
///
/// `head` must be null or the head of a list that no other thread can reach.
unsafe fn drain_nodes(mut head: *mut Node) -> Vec<Error> {
    let mut errors = Vec::new();
    while !head.is_null() {
        let node = Box::from_raw(head);
        head = node.next;
        errors.push(node.error);
    }
    errors.reverse();
    errors
}

impl Drop for ErrorSlot {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        if head != sealed() {
            // SAFETY: `&mut self` means no other thread can reach the list.
            drop(unsafe { drain_nodes(head) });
        }
    }
}

impl std::fmt::Debug for ErrorSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorSlot")
            .field("has_error", &self.has_error())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn first_error_wins_and_composite_keeps_order() {
        let slot = ErrorSlot::new(Context::new());
        assert!(slot.add_error("first".into()));
        assert!(!slot.add_error("second".into()));
        assert!(slot.has_error());

        let error = slot.terminate().unwrap();
        let messages: Vec<String> = error.errors().iter().map(|e| e.to_string()).collect();
        assert_eq!(messages, vec!["first", "second"]);
        assert!(slot.is_terminated());
        assert!(slot.terminate().is_none());
    }

    #[test]
    fn late_errors_go_to_the_undeliverable_sink() {
        let ctx = Context::new();
        let routed = Arc::new(AtomicUsize::new(0));
        let counter = routed.clone();
        ctx.set_undeliverable_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let slot = ErrorSlot::new(ctx);
        assert!(slot.terminate().is_none());
        assert!(!slot.add_error("late".into()));
        assert!(!slot.add_error("later".into()));
        assert_eq!(routed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_errors_are_never_lost() {
        let ctx = Context::new();
        let routed = Arc::new(AtomicUsize::new(0));
        let counter = routed.clone();
        ctx.set_undeliverable_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let slot = Arc::new(ErrorSlot::new(ctx));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let slot = slot.clone();
                thread::spawn(move || {
                    for j in 0..100 {
                        slot.add_error(format!("{i}-{j}").into());
                    }
                })
            })
            .collect();
        let collected = slot.terminate().map(|e| e.errors().len()).unwrap_or(0);
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(collected + routed.load(Ordering::SeqCst), 800);
    }
}
