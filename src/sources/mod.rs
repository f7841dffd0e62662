//! Source implementations for the fluxweld library.
//!
//! This module provides the publishers that start a flow: in-memory sequences
//! ([`IterPublisher`]), the trivial [`ErrorPublisher`] and [`NeverPublisher`], and the
//! time-based sources in [`time`].

pub mod time;

use std::cell::UnsafeCell;
use std::iter::Peekable;
use std::marker::PhantomData;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::context::Context;
use crate::core::demand::validate;
use crate::core::fusion::negotiate;
use crate::core::{
    try_emit, Cancellable, Demand, Downstream, EmptySubscription, ErrorSlot, FusionAware,
    FusionMode, Publisher, Subscriber, Subscription, Upstream, WorkInProgress,
};
use crate::error::{Error, Result};

pub use time::{IntervalPublisher, TimerPublisher};

/// A publisher that emits the items of an iterable, one fresh iterator per
/// subscriber.
///
/// Items are produced only against demand. The subscription supports SYNC fusion
/// and uses the conditional path of consumers that offer one.
pub struct IterPublisher<I> {
    items: I,
}

impl<I> IterPublisher<I> {
    pub fn new(items: I) -> Self {
        Self { items }
    }
}

impl<I> Publisher<I::Item> for IterPublisher<I>
where
    I: IntoIterator + Clone + Send + Sync + 'static,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<I::Item>>, ctx: &Context) {
        let subscription = Arc::new(IterSubscription::new(
            self.items.clone().into_iter(),
            subscriber.clone(),
            ctx.clone(),
        ));
        subscriber.on_subscribe(Upstream::fusable(subscription.clone()));
        if !subscription.is_fused() {
            // completes sources that are empty before anything is requested
            subscription.drain();
        }
    }
}

struct IterSubscription<I: Iterator> {
    iter: UnsafeCell<Option<Peekable<I>>>,
    downstream: Downstream<I::Item>,
    demand: Demand,
    wip: WorkInProgress,
    errors: ErrorSlot,
    cancelled: AtomicBool,
    fused: AtomicBool,
}

// SAFETY: `iter` has a single user at any time. Before fusion is granted only the
// thread holding the drain role of `wip` touches it; once SYNC fusion is granted
// the drain loop never runs again and only the consumer, whose calls never
// overlap, reaches it through `poll`, `is_empty` and `clear`.
unsafe impl<I> Sync for IterSubscription<I>
where
    I: Iterator + Send,
    I::Item: Send,
{
}

impl<I> IterSubscription<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    fn new(iter: I, downstream: Arc<dyn Subscriber<I::Item>>, ctx: Context) -> Self {
        Self {
            iter: UnsafeCell::new(Some(iter.peekable())),
            downstream: Downstream::new(downstream),
            demand: Demand::new(),
            wip: WorkInProgress::new(),
            errors: ErrorSlot::new(ctx),
            cancelled: AtomicBool::new(false),
            fused: AtomicBool::new(false),
        }
    }

    fn is_fused(&self) -> bool {
        self.fused.load(Ordering::Acquire)
    }

    /// # Safety
    ///
    /// The caller must be the single user of the iterator described on the `Sync`
    /// impl, and must not hold the returned reference across another call.
    #[allow(clippy::mut_from_ref)]
    unsafe fn iter(&self) -> &mut Option<Peekable<I>> {
        &mut *self.iter.get()
    }

    fn drain(&self) {
        self.wip.drain(|| self.pass());
    }

    fn pass(&self) -> ControlFlow<()> {
        // SAFETY: called from inside the drain loop only.
        let iter = unsafe { self.iter() };
        let Some(downstream) = self.downstream.get() else {
            iter.take();
            return ControlFlow::Break(());
        };

        let requested = self.demand.get();
        let mut emitted = 0;
        while emitted != requested {
            self.check_stopped(iter)?;
            match iter.as_mut().and_then(Iterator::next) {
                Some(item) => {
                    if try_emit(&*downstream, item) {
                        emitted += 1;
                    }
                }
                None => return self.finish(iter),
            }
        }

        self.check_stopped(iter)?;
        if iter.as_mut().map_or(true, |iter| iter.peek().is_none()) {
            return self.finish(iter);
        }
        if emitted != 0 {
            self.demand.produced(emitted);
        }
        ControlFlow::Continue(())
    }

    fn check_stopped(&self, iter: &mut Option<Peekable<I>>) -> ControlFlow<()> {
        if self.cancelled.load(Ordering::Acquire) {
            iter.take();
            self.downstream.release();
            return ControlFlow::Break(());
        }
        if self.errors.has_error() {
            return self.finish(iter);
        }
        ControlFlow::Continue(())
    }

    fn finish(&self, iter: &mut Option<Peekable<I>>) -> ControlFlow<()> {
        iter.take();
        if let Some(downstream) = self.downstream.release() {
            self.errors.try_terminate_consumer(&*downstream);
        }
        ControlFlow::Break(())
    }
}

impl<I> Cancellable for IterSubscription<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.is_fused() {
            // the consumer drops the iterator on its next poll
            self.downstream.release();
        } else {
            self.drain();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl<I> Subscription for IterSubscription<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    fn request(&self, n: u64) {
        if self.is_fused() {
            // a SYNC consumer never requests; a zero request is still reported
            if let Err(violation) = validate(n) {
                self.errors.add_error(violation);
                self.errors.try_terminate_and_report();
            }
            return;
        }
        match validate(n) {
            Ok(n) => {
                self.demand.add(n);
                self.drain();
            }
            Err(violation) => {
                self.errors.add_error(violation);
                self.drain();
            }
        }
    }
}

impl<I> FusionAware<I::Item> for IterSubscription<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    fn request_fusion(&self, mode: FusionMode) -> FusionMode {
        // fusion is only negotiable before the push path has started
        if self.demand.get() != 0 || !self.wip.is_idle() {
            return FusionMode::NONE;
        }
        let granted = negotiate(mode, FusionMode::SYNC);
        if granted == FusionMode::SYNC {
            self.fused.store(true, Ordering::Release);
        }
        granted
    }

    fn poll(&self) -> Result<Option<I::Item>> {
        // SAFETY: fused consumers are the only user of the iterator.
        let iter = unsafe { self.iter() };
        if self.cancelled.load(Ordering::Acquire) {
            iter.take();
            return Ok(None);
        }
        let item = iter.as_mut().and_then(Iterator::next);
        if item.is_none() {
            iter.take();
            self.downstream.release();
        }
        Ok(item)
    }

    fn is_empty(&self) -> bool {
        // SAFETY: as for `poll`.
        let iter = unsafe { self.iter() };
        iter.as_mut().map_or(true, |iter| iter.peek().is_none())
    }

    fn clear(&self) {
        // SAFETY: as for `poll`.
        unsafe { self.iter() }.take();
        self.downstream.release();
    }
}

/// A publisher that fails every subscriber right away.
pub struct ErrorPublisher<T> {
    error: Error,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ErrorPublisher<T> {
    pub fn new(error: Error) -> Self {
        Self {
            error,
            _marker: PhantomData,
        }
    }
}

impl<T> Publisher<T> for ErrorPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>, _ctx: &Context) {
        subscriber.on_subscribe(Upstream::plain(Arc::new(EmptySubscription::new())));
        subscriber.on_error(self.error.clone());
    }
}

/// A publisher that never signals anything after `on_subscribe`.
pub struct NeverPublisher<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> NeverPublisher<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for NeverPublisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Publisher<T> for NeverPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>, _ctx: &Context) {
        subscriber.on_subscribe(Upstream::plain(Arc::new(EmptySubscription::new())));
    }
}
