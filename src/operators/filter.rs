//! Item filtering: the conditional-emission exemplar.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::context::Context;
use crate::core::fusion::{mode_to_u8, negotiate_transitive};
use crate::core::{
    try_emit, Cancellable, ConditionalEmit, Downstream, FusionAware, FusionMode, Publisher,
    Subscriber, Subscription, Upstream,
};
use crate::error::{Error, ProtocolViolation, Result};
use crate::flowable::Flowable;

pub type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Drops the items a predicate rejects.
///
/// Rejected items do not use up demand: a conditional upstream simply emits the next
/// one, any other upstream is asked for one more item.
pub struct FilterPublisher<T> {
    source: Flowable<T>,
    predicate: Predicate<T>,
}

impl<T> FilterPublisher<T> {
    pub fn new(source: Flowable<T>, predicate: Predicate<T>) -> Self {
        Self { source, predicate }
    }
}

impl<T: Send + 'static> Publisher<T> for FilterPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>, ctx: &Context) {
        let parent = Arc::new_cyclic(|me| FilterSubscriber {
            me: me.clone(),
            downstream: Downstream::new(subscriber),
            predicate: self.predicate.clone(),
            upstream: OnceLock::new(),
            mode: AtomicU8::new(0),
            done: AtomicBool::new(false),
            ctx: ctx.clone(),
        });
        self.source.subscribe_with(parent, ctx);
    }
}

struct FilterSubscriber<T> {
    me: Weak<Self>,
    downstream: Downstream<T>,
    predicate: Predicate<T>,
    upstream: OnceLock<Upstream<T>>,
    mode: AtomicU8,
    done: AtomicBool,
    ctx: Context,
}

impl<T: Send + 'static> FilterSubscriber<T> {
    fn source_mode(&self) -> FusionMode {
        FusionMode::from_bits(self.mode.load(Ordering::Acquire))
    }
}

impl<T: Send + 'static> Subscriber<T> for FilterSubscriber<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if self.upstream.set(subscription.clone()).is_err() {
            subscription.cancel();
            self.ctx
                .on_undeliverable(ProtocolViolation::DuplicateSubscription.into());
            return;
        }
        if let (Some(me), Some(downstream)) = (self.me.upgrade(), self.downstream.get()) {
            downstream.on_subscribe(Upstream::fusable(me));
        }
    }

    fn on_next(&self, item: T) {
        if !self.try_on_next(item) {
            if let Some(upstream) = self.upstream.get() {
                upstream.request(1);
            }
        }
    }

    fn on_error(&self, error: Error) {
        if self.done.swap(true, Ordering::AcqRel) {
            self.ctx.on_undeliverable(error);
            return;
        }
        match self.downstream.release() {
            Some(downstream) => downstream.on_error(error),
            None => self.ctx.on_undeliverable(error),
        }
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(downstream) = self.downstream.release() {
            downstream.on_complete();
        }
    }

    fn on_available(&self) {
        if let Some(downstream) = self.downstream.get() {
            downstream.on_available();
        }
    }

    fn as_conditional(&self) -> Option<&dyn ConditionalEmit<T>> {
        Some(self)
    }
}

impl<T: Send + 'static> ConditionalEmit<T> for FilterSubscriber<T> {
    fn try_on_next(&self, item: T) -> bool {
        if self.done.load(Ordering::Acquire) {
            return false;
        }
        let Some(downstream) = self.downstream.get() else {
            return false;
        };
        if self.source_mode() != FusionMode::NONE {
            downstream.on_available();
            return true;
        }
        if (self.predicate)(&item) {
            try_emit(&*downstream, item)
        } else {
            false
        }
    }
}

impl<T: Send + 'static> Cancellable for FilterSubscriber<T> {
    fn cancel(&self) {
        self.downstream.release();
        if let Some(upstream) = self.upstream.get() {
            upstream.cancel();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.upstream.get().is_some_and(Cancellable::is_cancelled)
    }
}

impl<T: Send + 'static> Subscription for FilterSubscriber<T> {
    fn request(&self, n: u64) {
        if let Some(upstream) = self.upstream.get() {
            upstream.request(n);
        }
    }
}

impl<T: Send + 'static> FusionAware<T> for FilterSubscriber<T> {
    fn request_fusion(&self, mode: FusionMode) -> FusionMode {
        let Some(fusable) = self.upstream.get().and_then(Upstream::as_fusable) else {
            return FusionMode::NONE;
        };
        let granted = negotiate_transitive(mode, |mode| fusable.request_fusion(mode));
        self.mode.store(mode_to_u8(granted), Ordering::Release);
        granted
    }

    fn poll(&self) -> Result<Option<T>> {
        let Some(fusable) = self.upstream.get().and_then(Upstream::as_fusable) else {
            return Ok(None);
        };
        loop {
            match fusable.poll() {
                Ok(Some(item)) if (self.predicate)(&item) => return Ok(Some(item)),
                Ok(Some(_)) => {
                    if self.source_mode() == FusionMode::ASYNC {
                        fusable.request(1);
                    }
                }
                finished => {
                    // a SYNC upstream that stops yielding is finished for good
                    if self.source_mode() == FusionMode::SYNC {
                        self.downstream.release();
                    }
                    return finished;
                }
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.upstream
            .get()
            .and_then(Upstream::as_fusable)
            .map_or(true, |fusable| fusable.is_empty())
    }

    fn clear(&self) {
        self.downstream.release();
        if let Some(fusable) = self.upstream.get().and_then(Upstream::as_fusable) {
            fusable.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::UnicastProcessor;
    use crate::sinks::TestSubscriber;

    #[test]
    fn rejected_items_do_not_use_up_demand() {
        let ts = TestSubscriber::<i32>::with_request(3);
        Flowable::from_iter(1..=10)
            .filter(|x| x % 2 == 0)
            .subscribe(ts.clone());

        ts.assert_values(&[2, 4, 6]);
        ts.assert_not_terminated();
        ts.request(10);
        ts.assert_values(&[2, 4, 6, 8, 10]);
        ts.assert_complete();
    }

    #[test]
    fn stacked_filters_keep_the_conditional_path() {
        let ts = TestSubscriber::<i32>::with_request(2);
        Flowable::from_iter(1..)
            .filter(|x| x % 3 == 0)
            .filter(|x| x % 2 == 0)
            .subscribe(ts.clone());
        ts.assert_values(&[6, 12]);
    }

    #[test]
    fn sync_fused_filter() {
        let ts = TestSubscriber::<i32>::with_fusion(FusionMode::ANY, 0);
        Flowable::from_iter(vec![5, 6, 7, 8])
            .filter(|x| *x > 6)
            .subscribe(ts.clone());
        assert_eq!(ts.fusion_mode(), FusionMode::SYNC);
        ts.assert_values(&[7, 8]);
        ts.assert_complete();
    }

    #[test]
    fn push_mode_filter_over_a_processor_requests_replacements() {
        let processor = UnicastProcessor::<i32>::new();
        let ts = TestSubscriber::<i32>::with_request(1);
        Flowable::from_arc(processor.clone())
            .filter(|x| *x > 1)
            .subscribe(ts.clone());

        processor.on_next(0);
        processor.on_next(1);
        processor.on_next(2);
        processor.on_next(3);
        ts.assert_values(&[2]);
        ts.request(1);
        ts.assert_values(&[2, 3]);
    }

    #[test]
    fn completed_filter_chain_releases_its_subscriber() {
        let ts = TestSubscriber::<i32>::new();
        let weak = Arc::downgrade(&ts);
        Flowable::from_iter(1..=6)
            .filter(|x| x % 3 == 0)
            .subscribe(ts.clone());
        ts.assert_values(&[3, 6]);
        ts.assert_complete();

        drop(ts);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn sync_fused_filter_releases_its_subscriber() {
        let ts = TestSubscriber::<i32>::with_fusion(FusionMode::SYNC, 0);
        let weak = Arc::downgrade(&ts);
        Flowable::from_iter(1..=6)
            .filter(|x| x % 2 == 1)
            .subscribe(ts.clone());
        assert_eq!(ts.fusion_mode(), FusionMode::SYNC);
        ts.assert_values(&[1, 3, 5]);

        drop(ts);
        assert!(weak.upgrade().is_none());
    }
}
