//! Windowed correlation of two flows.
//!
//! Every left item opens a window: a [`UnicastProcessor`] handed to the result
//! selector together with the item. Right items are remembered while their own
//! window is open. A right item is forwarded to every open left window, and a new
//! left window starts with every right item still open at that moment. Windows are
//! closed by the first signal of the flow returned by the matching end factory.
//!
//! Both inputs, every window end and every close are funneled through one linked
//! queue of tagged signals, drained by a single serialized loop that owns all the
//! window bookkeeping.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::context::Context;
use crate::core::demand::validate;
use crate::core::{
    CancelKey, Cancellable, CompositeCancellable, Demand, Downstream, ErrorSlot, HandoffQueue,
    LinkedQueue, Publisher, Serialized, Subscriber, Subscription, SubscriptionSlot, Upstream,
    UNBOUNDED,
};
use crate::error::{Error, Result};
use crate::flowable::Flowable;
use crate::processors::UnicastProcessor;

/// Builds the flow whose first signal closes the window of an item.
pub type EndFactory<V> = Arc<dyn Fn(&V) -> Result<Flowable<()>> + Send + Sync>;

/// Combines a left item with its window.
pub type ResultSelector<L, R, U> = Arc<dyn Fn(L, Flowable<R>) -> Result<U> + Send + Sync>;

pub struct GroupJoinPublisher<L, R, U> {
    left: Flowable<L>,
    right: Flowable<R>,
    left_end: EndFactory<L>,
    right_end: EndFactory<R>,
    selector: ResultSelector<L, R, U>,
}

impl<L, R, U> GroupJoinPublisher<L, R, U> {
    pub fn new(
        left: Flowable<L>,
        right: Flowable<R>,
        left_end: EndFactory<L>,
        right_end: EndFactory<R>,
        selector: ResultSelector<L, R, U>,
    ) -> Self {
        Self {
            left,
            right,
            left_end,
            right_end,
            selector,
        }
    }
}

impl<L, R, U> Publisher<U> for GroupJoinPublisher<L, R, U>
where
    L: Send + 'static,
    R: Clone + Send + 'static,
    U: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<U>>, ctx: &Context) {
        let join = Arc::new_cyclic(|me| JoinCoordinator {
            me: me.clone(),
            downstream: Downstream::new(subscriber.clone()),
            queue: LinkedQueue::new(),
            state: Serialized::new(JoinState::default()),
            demand: Demand::new(),
            active: AtomicUsize::new(2),
            errors: ErrorSlot::new(ctx.clone()),
            resources: CompositeCancellable::new(),
            cancelled: AtomicBool::new(false),
            left_end: self.left_end.clone(),
            right_end: self.right_end.clone(),
            selector: self.selector.clone(),
            ctx: ctx.clone(),
        });
        subscriber.on_subscribe(Upstream::plain(join.clone()));

        join.connect(&self.left, Signal::Left);
        join.connect(&self.right, Signal::Right);
    }
}

enum Signal<L, R> {
    Left(L),
    Right(R),
    LeftClose { index: u64, key: CancelKey },
    RightClose { index: u64, key: CancelKey },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

/// Open windows, keyed by arrival index so iteration follows arrival order.
struct JoinState<R> {
    lefts: BTreeMap<u64, Arc<UnicastProcessor<R>>>,
    rights: BTreeMap<u64, R>,
    left_index: u64,
    right_index: u64,
}

impl<R> Default for JoinState<R> {
    fn default() -> Self {
        Self {
            lefts: BTreeMap::new(),
            rights: BTreeMap::new(),
            left_index: 0,
            right_index: 0,
        }
    }
}

impl<R> JoinState<R> {
    fn clear(&mut self) {
        self.lefts.clear();
        self.rights.clear();
    }
}

struct JoinCoordinator<L, R, U> {
    me: Weak<Self>,
    downstream: Downstream<U>,
    queue: LinkedQueue<Signal<L, R>>,
    state: Serialized<JoinState<R>>,
    demand: Demand,
    /// Inputs that have not completed yet.
    active: AtomicUsize,
    errors: ErrorSlot,
    resources: CompositeCancellable,
    cancelled: AtomicBool,
    left_end: EndFactory<L>,
    right_end: EndFactory<R>,
    selector: ResultSelector<L, R, U>,
    ctx: Context,
}

impl<L, R, U> JoinCoordinator<L, R, U>
where
    L: Send + 'static,
    R: Clone + Send + 'static,
    U: Send + 'static,
{
    fn connect<V: Send + 'static>(self: &Arc<Self>, source: &Flowable<V>, wrap: fn(V) -> Signal<L, R>) {
        let slot = Arc::new(SubscriptionSlot::new());
        let Some(key) = self.resources.add(slot.clone()) else {
            return;
        };
        let input = Arc::new(JoinInput {
            parent: self.clone(),
            slot,
            key,
            wrap,
        });
        source.subscribe_with(input, &self.ctx);
    }

    fn offer(&self, signal: Signal<L, R>) {
        // the loop is parked once the consumer is gone, nothing would drain the queue
        if self.cancelled.load(Ordering::Acquire) || self.downstream.is_released() {
            return;
        }
        if let Err(error) = self.queue.offer(signal) {
            self.errors.add_error(error);
        }
        self.drain();
    }

    fn close(&self, side: Side, index: u64, key: CancelKey) {
        self.offer(match side {
            Side::Left => Signal::LeftClose { index, key },
            Side::Right => Signal::RightClose { index, key },
        });
    }

    fn close_error(&self, error: Error) {
        self.errors.add_error(error);
        self.drain();
    }

    fn input_error(&self, error: Error) {
        self.errors.add_error(error);
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.drain();
    }

    fn input_complete(&self, key: CancelKey) {
        self.resources.delete(key);
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.drain();
    }

    fn drain(&self) {
        self.state.drain(|state| self.pass(state));
    }

    fn pass(&self, state: &mut JoinState<R>) -> ControlFlow<()> {
        let Some(downstream) = self.downstream.get() else {
            self.queue.clear();
            state.clear();
            return ControlFlow::Break(());
        };

        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.queue.clear();
                state.clear();
                self.downstream.release();
                return ControlFlow::Break(());
            }
            if self.errors.has_error() {
                return self.error_all(state);
            }

            let done = self.active.load(Ordering::Acquire) == 0;
            let Some(signal) = self.queue.poll() else {
                if done {
                    return self.complete_all(state);
                }
                return ControlFlow::Continue(());
            };

            match signal {
                Signal::Left(left) => self.open_left(state, &*downstream, left)?,
                Signal::Right(right) => self.open_right(state, right)?,
                Signal::LeftClose { index, key } => {
                    self.resources.delete(key);
                    if let Some(window) = state.lefts.remove(&index) {
                        window.on_complete();
                    }
                }
                Signal::RightClose { index, key } => {
                    self.resources.delete(key);
                    state.rights.remove(&index);
                }
            }
        }
    }

    fn open_left(
        &self,
        state: &mut JoinState<R>,
        downstream: &dyn Subscriber<U>,
        left: L,
    ) -> ControlFlow<()> {
        let window = UnicastProcessor::with_context(self.ctx.clone());
        let index = state.left_index;
        state.left_index += 1;
        state.lefts.insert(index, window.clone());

        let end = match (self.left_end)(&left) {
            Ok(end) => end,
            Err(error) => return self.fail(state, error),
        };
        self.watch(end, Side::Left, index);
        if self.errors.has_error() {
            return self.error_all(state);
        }

        let value = match (self.selector)(left, Flowable::from_arc(window.clone())) {
            Ok(value) => value,
            Err(error) => return self.fail(state, error),
        };
        if self.demand.get() == 0 {
            tracing::warn!("group join has no demand for a new window");
            return self.fail(
                state,
                Error::missing_backpressure("Could not emit value due to lack of requests"),
            );
        }
        downstream.on_next(value);
        self.demand.produced(1);

        for right in state.rights.values() {
            window.on_next(right.clone());
        }
        ControlFlow::Continue(())
    }

    fn open_right(&self, state: &mut JoinState<R>, right: R) -> ControlFlow<()> {
        let index = state.right_index;
        state.right_index += 1;

        let end = match (self.right_end)(&right) {
            Ok(end) => end,
            Err(error) => return self.fail(state, error),
        };
        self.watch(end, Side::Right, index);
        if self.errors.has_error() {
            return self.error_all(state);
        }

        for window in state.lefts.values() {
            window.on_next(right.clone());
        }
        state.rights.insert(index, right);
        ControlFlow::Continue(())
    }

    fn watch(&self, end: Flowable<()>, side: Side, index: u64) {
        let Some(parent) = self.me.upgrade() else {
            return;
        };
        let slot = Arc::new(SubscriptionSlot::new());
        let Some(key) = self.resources.add(slot.clone()) else {
            return;
        };
        let watcher = Arc::new(WindowEnd {
            parent,
            side,
            index,
            key,
            slot,
            done: AtomicBool::new(false),
        });
        end.subscribe_with(watcher, &self.ctx);
    }

    fn fail(&self, state: &mut JoinState<R>, error: Error) -> ControlFlow<()> {
        self.errors.add_error(error);
        self.error_all(state)
    }

    fn error_all(&self, state: &mut JoinState<R>) -> ControlFlow<()> {
        self.queue.clear();
        self.resources.cancel();
        if let Some(error) = self.errors.terminate() {
            tracing::debug!(error = %error, windows = state.lefts.len(), "group join failed");
            for window in state.lefts.values() {
                window.on_error(error.clone());
            }
            if let Some(downstream) = self.downstream.release() {
                downstream.on_error(error);
            }
        }
        state.clear();
        ControlFlow::Break(())
    }

    fn complete_all(&self, state: &mut JoinState<R>) -> ControlFlow<()> {
        tracing::debug!(windows = state.lefts.len(), "group join completed");
        for window in state.lefts.values() {
            window.on_complete();
        }
        state.clear();
        self.resources.cancel();
        if let Some(downstream) = self.downstream.release() {
            self.errors.try_terminate_consumer(&*downstream);
        }
        ControlFlow::Break(())
    }
}

impl<L, R, U> Cancellable for JoinCoordinator<L, R, U>
where
    L: Send + 'static,
    R: Clone + Send + 'static,
    U: Send + 'static,
{
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::trace!("group join cancelled");
        self.resources.cancel();
        self.drain();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl<L, R, U> Subscription for JoinCoordinator<L, R, U>
where
    L: Send + 'static,
    R: Clone + Send + 'static,
    U: Send + 'static,
{
    fn request(&self, n: u64) {
        match validate(n) {
            Ok(n) => {
                self.demand.add(n);
            }
            Err(violation) => {
                self.errors.add_error(violation);
                self.drain();
            }
        }
    }
}

/// Subscriber feeding one of the two inputs into the coordinator's queue.
struct JoinInput<L, R, U, V> {
    parent: Arc<JoinCoordinator<L, R, U>>,
    slot: Arc<SubscriptionSlot>,
    key: CancelKey,
    wrap: fn(V) -> Signal<L, R>,
}

impl<L, R, U, V> Subscriber<V> for JoinInput<L, R, U, V>
where
    L: Send + 'static,
    R: Clone + Send + 'static,
    U: Send + 'static,
    V: Send + 'static,
{
    fn on_subscribe(&self, subscription: Upstream<V>) {
        if self.slot.set_once(Arc::new(subscription), &self.parent.ctx) {
            self.slot.request(UNBOUNDED);
        }
    }

    fn on_next(&self, item: V) {
        self.parent.offer((self.wrap)(item));
    }

    fn on_error(&self, error: Error) {
        self.parent.input_error(error);
    }

    fn on_complete(&self) {
        self.parent.input_complete(self.key);
    }
}

/// Watches the flow that ends one window; the first signal closes it.
struct WindowEnd<L, R, U> {
    parent: Arc<JoinCoordinator<L, R, U>>,
    side: Side,
    index: u64,
    key: CancelKey,
    slot: Arc<SubscriptionSlot>,
    done: AtomicBool,
}

impl<L, R, U> Subscriber<()> for WindowEnd<L, R, U>
where
    L: Send + 'static,
    R: Clone + Send + 'static,
    U: Send + 'static,
{
    fn on_subscribe(&self, subscription: Upstream<()>) {
        if self.slot.set_once(Arc::new(subscription), &self.parent.ctx) {
            self.slot.request(UNBOUNDED);
        }
    }

    fn on_next(&self, _item: ()) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.slot.cancel_once();
            self.parent.close(self.side, self.index, self.key);
        }
    }

    fn on_error(&self, error: Error) {
        if self.done.swap(true, Ordering::AcqRel) {
            self.parent.ctx.on_undeliverable(error);
            return;
        }
        self.parent.close_error(error);
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.parent.close(self.side, self.index, self.key);
        }
    }
}
