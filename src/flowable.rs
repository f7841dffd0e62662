//! The fluent entry point: a cheaply clonable handle to a publisher.

use std::sync::Arc;
use std::time::Duration;

use crate::context::Context;
use crate::core::{Publisher, Subscriber};
use crate::error::{Error, Result};
use crate::operators::{FilterPublisher, GroupJoinPublisher, MapPublisher, ObserveOnPublisher};
use crate::scheduler::Scheduler;
use crate::sources::{
    ErrorPublisher, IntervalPublisher, IterPublisher, NeverPublisher, TimerPublisher,
};

/// A flow of `T` items that can be subscribed to any number of times.
///
/// Every subscription builds a fresh chain of stages; nothing runs until
/// [`subscribe`](Self::subscribe) is called.
///
/// # Example
///
/// ```rust
/// use fluxweld::prelude::*;
///
/// let ts = TestSubscriber::<i32>::new();
/// Flowable::from_iter(1..=6)
///     .filter(|x| x % 2 == 0)
///     .map(|x| x * 10)
///     .subscribe(ts.clone());
///
/// ts.assert_values(&[20, 40, 60]);
/// ts.assert_complete();
/// ```
pub struct Flowable<T> {
    source: Arc<dyn Publisher<T>>,
}

impl<T> Clone for Flowable<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Flowable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flowable").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Flowable<T> {
    pub fn from_publisher<P: Publisher<T> + 'static>(publisher: P) -> Self {
        Self {
            source: Arc::new(publisher),
        }
    }

    /// Wrap a shared publisher, such as a processor the caller keeps feeding.
    pub fn from_arc<P: Publisher<T> + 'static>(publisher: Arc<P>) -> Self {
        Self { source: publisher }
    }

    /// Emit the items of `items`, replaying them from a fresh iterator for every
    /// subscriber.
    #[allow(clippy::should_implement_trait)]
    pub fn from_iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        I::IntoIter: Send + 'static,
    {
        Self::from_publisher(IterPublisher::new(items))
    }

    pub fn just(item: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::from_iter(Some(item))
    }

    pub fn empty() -> Self {
        Self::from_iter(std::iter::empty())
    }

    pub fn error(error: Error) -> Self {
        Self::from_publisher(ErrorPublisher::new(error))
    }

    /// A flow that never signals anything after `on_subscribe`.
    pub fn never() -> Self {
        Self::from_publisher(NeverPublisher::new())
    }

    /// Subscribe with a default [`Context`].
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.subscribe_with(subscriber, &Context::default());
    }

    pub fn subscribe_with(&self, subscriber: Arc<dyn Subscriber<T>>, ctx: &Context) {
        self.source.subscribe(subscriber, ctx);
    }

    pub fn map<U, F>(self, f: F) -> Flowable<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.try_map(move |item| Ok(f(item)))
    }

    /// Like [`map`](Self::map); an `Err` cancels the upstream and fails the flow.
    pub fn try_map<U, F>(self, f: F) -> Flowable<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Result<U> + Send + Sync + 'static,
    {
        Flowable::from_publisher(MapPublisher::new(self, Arc::new(f)))
    }

    pub fn filter<F>(self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self::from_publisher(FilterPublisher::new(self, Arc::new(predicate)))
    }

    /// Deliver signals on a worker of `scheduler`, prefetching the configured
    /// buffer size.
    pub fn observe_on(self, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::from_publisher(ObserveOnPublisher::new(self, scheduler, None))
    }

    pub fn observe_on_with(self, scheduler: Arc<dyn Scheduler>, prefetch: usize) -> Self {
        Self::from_publisher(ObserveOnPublisher::new(self, scheduler, Some(prefetch)))
    }

    /// Correlate this flow (the left side) with `right` by overlapping windows.
    ///
    /// Each left item opens a window that lasts until the flow built by `left_end`
    /// signals; right items are held open the same way by `right_end`. The
    /// `selector` receives each left item with a flow of every right item whose
    /// window overlaps its own, and its result is emitted downstream.
    pub fn group_join<R, LD, RD, U, LE, RE, S>(
        self,
        right: Flowable<R>,
        left_end: LE,
        right_end: RE,
        selector: S,
    ) -> Flowable<U>
    where
        R: Clone + Send + 'static,
        LD: Send + 'static,
        RD: Send + 'static,
        U: Send + 'static,
        LE: Fn(&T) -> Result<Flowable<LD>> + Send + Sync + 'static,
        RE: Fn(&R) -> Result<Flowable<RD>> + Send + Sync + 'static,
        S: Fn(T, Flowable<R>) -> Result<U> + Send + Sync + 'static,
    {
        Flowable::from_publisher(GroupJoinPublisher::new(
            self,
            right,
            Arc::new(move |item: &T| left_end(item).map(|end| end.map(|_| ()))),
            Arc::new(move |item: &R| right_end(item).map(|end| end.map(|_| ()))),
            Arc::new(selector),
        ))
    }
}

impl Flowable<i64> {
    /// `count` consecutive integers starting at `start`.
    pub fn range(start: i64, count: usize) -> Self {
        let end = i64::try_from(count)
            .ok()
            .and_then(|count| start.checked_add(count));
        match end {
            Some(end) => Self::from_iter(start..end),
            None => Self::error(Error::custom(format!(
                "range overflows: start {start}, count {count}"
            ))),
        }
    }
}

impl Flowable<u64> {
    /// Emit `0` after `delay`, then complete.
    pub fn timer(delay: Duration, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::from_publisher(TimerPublisher::new(delay, scheduler))
    }

    /// Emit `0, 1, 2, ...` every `period`.
    pub fn interval(period: Duration, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::from_publisher(IntervalPublisher::new(period, scheduler))
    }
}

impl<T: Send + 'static> Publisher<T> for Flowable<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>, ctx: &Context) {
        self.source.subscribe(subscriber, ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::TestSubscriber;

    #[test]
    fn range_emits_count_items() {
        let ts = TestSubscriber::<i64>::new();
        Flowable::range(5, 3).subscribe(ts.clone());
        ts.assert_values(&[5, 6, 7]);
        ts.assert_complete();
    }

    #[test]
    fn range_overflow_fails() {
        let ts = TestSubscriber::<i64>::new();
        Flowable::range(i64::MAX, 2).subscribe(ts.clone());
        ts.assert_error(|e| e.to_string().starts_with("range overflows"));
    }

    #[test]
    fn flows_are_cold_and_resubscribable() {
        let flow = Flowable::just(7i32).map(|x| x + 1);
        for _ in 0..2 {
            let ts = TestSubscriber::<i32>::new();
            flow.subscribe(ts.clone());
            ts.assert_values(&[8]);
            ts.assert_complete();
        }
    }

    #[test]
    fn empty_and_error() {
        let ts = TestSubscriber::<u8>::new();
        Flowable::<u8>::empty().subscribe(ts.clone());
        ts.assert_complete();
        assert_eq!(ts.value_count(), 0);

        let ts = TestSubscriber::<u8>::new();
        Flowable::<u8>::error(Error::custom("boom")).subscribe(ts.clone());
        ts.assert_error(|e| e.to_string() == "boom");
    }
}
