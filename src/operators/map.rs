//! Item transformation with fusion pass-through.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::context::Context;
use crate::core::fusion::{mode_to_u8, negotiate_transitive};
use crate::core::{
    Cancellable, Downstream, FusionAware, FusionMode, Publisher, Subscriber, Subscription,
    Upstream,
};
use crate::error::{Error, ProtocolViolation, Result};
use crate::flowable::Flowable;

/// Fallible item transformation.
pub type Mapper<T, U> = Arc<dyn Fn(T) -> Result<U> + Send + Sync>;

/// Applies a function to every item.
///
/// When the upstream can fuse, the function runs inside `poll` on the consumer's
/// side, which is why fusion is refused to consumers on an execution boundary.
pub struct MapPublisher<T, U> {
    source: Flowable<T>,
    mapper: Mapper<T, U>,
}

impl<T, U> MapPublisher<T, U> {
    pub fn new(source: Flowable<T>, mapper: Mapper<T, U>) -> Self {
        Self { source, mapper }
    }
}

impl<T: Send + 'static, U: Send + 'static> Publisher<U> for MapPublisher<T, U> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<U>>, ctx: &Context) {
        let parent = Arc::new_cyclic(|me| MapSubscriber {
            me: me.clone(),
            downstream: Downstream::new(subscriber),
            mapper: self.mapper.clone(),
            upstream: OnceLock::new(),
            mode: AtomicU8::new(0),
            done: AtomicBool::new(false),
            ctx: ctx.clone(),
        });
        self.source.subscribe_with(parent, ctx);
    }
}

struct MapSubscriber<T, U> {
    me: Weak<Self>,
    downstream: Downstream<U>,
    mapper: Mapper<T, U>,
    upstream: OnceLock<Upstream<T>>,
    mode: AtomicU8,
    done: AtomicBool,
    ctx: Context,
}

impl<T: Send + 'static, U: Send + 'static> MapSubscriber<T, U> {
    fn source_mode(&self) -> FusionMode {
        FusionMode::from_bits(self.mode.load(Ordering::Acquire))
    }

    fn fail(&self, error: Error) {
        if let Some(upstream) = self.upstream.get() {
            upstream.cancel();
        }
        self.on_error(error);
    }
}

impl<T: Send + 'static, U: Send + 'static> Subscriber<T> for MapSubscriber<T, U> {
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
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let Some(downstream) = self.downstream.get() else {
            return;
        };
        if self.source_mode() != FusionMode::NONE {
            downstream.on_available();
            return;
        }
        match (self.mapper)(item) {
            Ok(mapped) => downstream.on_next(mapped),
            Err(error) => self.fail(error),
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
}

impl<T: Send + 'static, U: Send + 'static> Cancellable for MapSubscriber<T, U> {
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

impl<T: Send + 'static, U: Send + 'static> Subscription for MapSubscriber<T, U> {
    fn request(&self, n: u64) {
        if let Some(upstream) = self.upstream.get() {
            upstream.request(n);
        }
    }
}

impl<T: Send + 'static, U: Send + 'static> FusionAware<U> for MapSubscriber<T, U> {
    fn request_fusion(&self, mode: FusionMode) -> FusionMode {
        let Some(fusable) = self.upstream.get().and_then(Upstream::as_fusable) else {
            return FusionMode::NONE;
        };
        let granted = negotiate_transitive(mode, |mode| fusable.request_fusion(mode));
        self.mode.store(mode_to_u8(granted), Ordering::Release);
        granted
    }

    fn poll(&self) -> Result<Option<U>> {
        let Some(fusable) = self.upstream.get().and_then(Upstream::as_fusable) else {
            return Ok(None);
        };
        let polled = match fusable.poll() {
            Ok(Some(item)) => (self.mapper)(item).map(Some),
            Ok(None) => Ok(None),
            Err(error) => Err(error),
        };
        // a SYNC upstream that stops yielding is finished for good
        if self.source_mode() == FusionMode::SYNC && !matches!(polled, Ok(Some(_))) {
            self.downstream.release();
        }
        polled
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
