//! Reduction of every rail into a single value.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::context::Context;
use crate::core::demand::validate;
use crate::core::{
    Cancellable, ErrorSlot, Publisher, ScalarDeferred, Subscriber, Subscription,
    SubscriptionSlot, Upstream, UNBOUNDED,
};
use crate::error::{Error, Result};
use crate::flowable::Flowable;
use crate::parallel::slot_pair::{Offer, PairArena};

/// Combines two values into one.
pub type Reducer<T> = Arc<dyn Fn(T, T) -> Result<T> + Send + Sync>;

/// Reduces each rail locally, then merges the per-rail results pairwise as the rails
/// finish, in whatever order they finish.
pub struct ReducePublisher<T> {
    rails: Vec<Flowable<T>>,
    reducer: Reducer<T>,
}

impl<T> ReducePublisher<T> {
    pub fn new(rails: Vec<Flowable<T>>, reducer: Reducer<T>) -> Self {
        Self { rails, reducer }
    }
}

impl<T: Send + 'static> Publisher<T> for ReducePublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>, ctx: &Context) {
        let slots: Vec<_> = self
            .rails
            .iter()
            .map(|_| Arc::new(SubscriptionSlot::new()))
            .collect();
        let main = Arc::new(ReduceMain {
            deferred: ScalarDeferred::new(subscriber.clone(), ctx.clone()),
            slots: slots.clone(),
            arena: PairArena::new(self.rails.len()),
            remaining: AtomicUsize::new(self.rails.len()),
            errors: ErrorSlot::new(ctx.clone()),
            reducer: self.reducer.clone(),
        });
        subscriber.on_subscribe(Upstream::plain(main.clone()));

        if self.rails.is_empty() {
            main.deferred.complete_empty();
            return;
        }
        for (rail, slot) in self.rails.iter().zip(slots) {
            let reducer = Arc::new(RailReducer {
                parent: main.clone(),
                slot,
                value: Accumulator::new(),
                done: AtomicBool::new(false),
                ctx: ctx.clone(),
            });
            rail.subscribe_with(reducer, ctx);
        }
    }
}

struct ReduceMain<T> {
    deferred: ScalarDeferred<T>,
    slots: Vec<Arc<SubscriptionSlot>>,
    arena: PairArena<T>,
    /// Rails that have not reported yet.
    remaining: AtomicUsize,
    errors: ErrorSlot,
    reducer: Reducer<T>,
}

impl<T: Send + 'static> ReduceMain<T> {
    fn cancel_rails(&self) {
        for slot in &self.slots {
            slot.cancel_once();
        }
    }

    /// A rail finished with its local result (`None` for an empty rail).
    fn rail_complete(&self, value: Option<T>) {
        if let Some(mut value) = value {
            while let Offer::Paired(first, second) = self.arena.offer(value) {
                match (self.reducer)(first, second) {
                    Ok(combined) => value = combined,
                    Err(error) => {
                        self.rail_error(error);
                        return;
                    }
                }
            }
        }

        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            // SAFETY: every rail has returned from its last offer.
            match unsafe { self.arena.take_result() } {
                Some(result) => {
                    tracing::debug!(rails = self.slots.len(), "parallel reduce completed");
                    self.deferred.complete(result);
                }
                None => self.deferred.complete_empty(),
            }
        }
    }

    fn rail_error(&self, error: Error) {
        if !self.errors.add_error(error) {
            return;
        }
        self.cancel_rails();
        if let Some(error) = self.errors.terminate() {
            tracing::debug!(error = %error, "parallel reduce failed");
            self.deferred.error(error);
        }
    }
}

impl<T: Send + 'static> Cancellable for ReduceMain<T> {
    fn cancel(&self) {
        tracing::trace!("parallel reduce cancelled");
        self.deferred.cancel();
        self.cancel_rails();
    }

    fn is_cancelled(&self) -> bool {
        self.deferred.is_terminated()
    }
}

impl<T: Send + 'static> Subscription for ReduceMain<T> {
    fn request(&self, n: u64) {
        match validate(n) {
            Ok(_) => self.deferred.request(),
            Err(violation) => self.rail_error(violation),
        }
    }
}

/// Running value of one rail, written only by that rail's signals.
struct Accumulator<T> {
    value: UnsafeCell<Option<T>>,
}

// SAFETY: the cell is only reached from `on_next` and `on_complete` of the one rail
// subscriber owning it, and signals to a subscriber never overlap.
unsafe impl<T: Send> Sync for Accumulator<T> {}

impl<T> Accumulator<T> {
    fn new() -> Self {
        Self {
            value: UnsafeCell::new(None),
        }
    }

    /// # Safety
    ///
    /// Must only be called from a signal of the owning subscriber.
    unsafe fn take(&self) -> Option<T> {
        (*self.value.get()).take()
    }

    /// # Safety
    ///
    /// As for [`take`](Self::take).
    unsafe fn put(&self, value: T) {
        *self.value.get() = Some(value);
    }
}

/// Folds the items of one rail into a local accumulator.
struct RailReducer<T> {
    parent: Arc<ReduceMain<T>>,
    slot: Arc<SubscriptionSlot>,
    value: Accumulator<T>,
    done: AtomicBool,
    ctx: Context,
}

impl<T: Send + 'static> Subscriber<T> for RailReducer<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if self.slot.set_once(Arc::new(subscription), &self.ctx) {
            self.slot.request(UNBOUNDED);
        }
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        // SAFETY: called from this subscriber's own `on_next`.
        let current = unsafe { self.value.take() };
        let next = match current {
            None => Ok(item),
            Some(current) => (self.parent.reducer)(current, item),
        };
        match next {
            // SAFETY: as above.
            Ok(next) => unsafe { self.value.put(next) },
            Err(error) => {
                self.done.store(true, Ordering::Release);
                self.slot.cancel_once();
                self.parent.rail_error(error);
            }
        }
    }

    fn on_error(&self, error: Error) {
        if self.done.swap(true, Ordering::AcqRel) {
            self.ctx.on_undeliverable(error);
            return;
        }
        self.parent.rail_error(error);
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            // SAFETY: called from this subscriber's own `on_complete`.
            let value = unsafe { self.value.take() };
            self.parent.rail_complete(value);
        }
    }
}
