//! Moving emission onto a scheduler worker.
//!
//! The upstream fills a bounded queue (or a fused upstream keeps its own), and the
//! drain loop runs as a task on one [`Worker`]: whoever moves the work counter off
//! zero schedules the loop instead of running it. The upstream is asked for
//! `prefetch` items up front and topped up every time three quarters of that amount
//! has been emitted.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::context::Context;
use crate::core::demand::validate;
use crate::core::fusion::mode_to_u8;
use crate::core::{
    BoundedQueue, Cancellable, Demand, DrainTicket, Downstream, ErrorSlot, FusionAware,
    FusionMode, HandoffQueue, Publisher, Serialized, Subscriber, Subscription, Upstream,
    UNBOUNDED,
};
use crate::error::{Error, ProtocolViolation, Result};
use crate::flowable::Flowable;
use crate::scheduler::{Scheduler, Worker};

/// Re-emits the upstream's signals on a worker of `scheduler`.
pub struct ObserveOnPublisher<T> {
    source: Flowable<T>,
    scheduler: Arc<dyn Scheduler>,
    prefetch: Option<usize>,
}

impl<T> ObserveOnPublisher<T> {
    /// `prefetch: None` takes the buffer size of the subscription's context.
    pub fn new(
        source: Flowable<T>,
        scheduler: Arc<dyn Scheduler>,
        prefetch: Option<usize>,
    ) -> Self {
        Self {
            source,
            scheduler,
            prefetch,
        }
    }
}

impl<T: Send + 'static> Publisher<T> for ObserveOnPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>, ctx: &Context) {
        let prefetch = self
            .prefetch
            .unwrap_or(ctx.config().buffer_size)
            .max(1);
        let worker = self.scheduler.create_worker();
        let parent = ObserveOn::new(subscriber, worker, prefetch, ctx.clone());
        self.source.subscribe_with(parent, ctx);
    }
}

enum Source<T> {
    Fused(Arc<dyn FusionAware<T>>),
    Queue(BoundedQueue<T>),
}

impl<T: Send> Source<T> {
    fn poll(&self) -> Result<Option<T>> {
        match self {
            Source::Fused(fusable) => fusable.poll(),
            Source::Queue(queue) => Ok(queue.poll()),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Source::Fused(fusable) => fusable.is_empty(),
            Source::Queue(queue) => queue.is_empty(),
        }
    }

    fn clear(&self) {
        match self {
            Source::Fused(fusable) => fusable.clear(),
            Source::Queue(queue) => queue.clear(),
        }
    }
}

/// Items emitted since the upstream was last topped up.
#[derive(Debug, Default)]
struct Progress {
    produced: u64,
}

struct ObserveOn<T> {
    me: Weak<Self>,
    downstream: Downstream<T>,
    worker: Arc<dyn Worker>,
    prefetch: usize,
    limit: u64,
    upstream: OnceLock<Upstream<T>>,
    source: OnceLock<Source<T>>,
    source_mode: AtomicU8,
    output_fused: AtomicBool,
    demand: Demand,
    drain: Serialized<Progress>,
    fused_consumed: AtomicU64,
    done: AtomicBool,
    cancelled: AtomicBool,
    errors: ErrorSlot,
    ctx: Context,
}

impl<T: Send + 'static> ObserveOn<T> {
    fn new(
        downstream: Arc<dyn Subscriber<T>>,
        worker: Arc<dyn Worker>,
        prefetch: usize,
        ctx: Context,
    ) -> Arc<Self> {
        let prefetch_items = prefetch as u64;
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            downstream: Downstream::new(downstream),
            worker,
            prefetch,
            limit: prefetch_items - (prefetch_items >> 2),
            upstream: OnceLock::new(),
            source: OnceLock::new(),
            source_mode: AtomicU8::new(0),
            output_fused: AtomicBool::new(false),
            demand: Demand::new(),
            drain: Serialized::new(Progress::default()),
            fused_consumed: AtomicU64::new(0),
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            errors: ErrorSlot::new(ctx.clone()),
            ctx,
        })
    }

    fn source_mode(&self) -> FusionMode {
        FusionMode::from_bits(self.source_mode.load(Ordering::Acquire))
    }

    fn poll_source(&self) -> Result<Option<T>> {
        match self.source.get() {
            Some(source) => source.poll(),
            None => Ok(None),
        }
    }

    fn source_is_empty(&self) -> bool {
        self.source.get().map_or(true, Source::is_empty)
    }

    fn clear_source(&self) {
        if let Some(source) = self.source.get() {
            source.clear();
        }
    }

    fn request_upstream(&self, n: u64) {
        if let Some(upstream) = self.upstream.get() {
            upstream.request(n);
        }
    }

    fn cancel_upstream(&self) {
        if let Some(upstream) = self.upstream.get() {
            upstream.cancel();
        }
    }

    fn attach_downstream(&self) {
        if let (Some(me), Some(downstream)) = (self.me.upgrade(), self.downstream.get()) {
            downstream.on_subscribe(Upstream::fusable(me));
        }
    }

    /// Hand the drain loop to the worker if nobody is running it.
    fn schedule(&self) {
        let Some(ticket) = self.drain.enter() else {
            return;
        };
        if let Some(me) = self.me.upgrade() {
            self.worker.schedule(Box::new(move || me.run(ticket)));
        }
    }

    fn run(&self, ticket: DrainTicket) {
        if self.output_fused.load(Ordering::Acquire) {
            self.drain.run(ticket, |_| self.run_backfused());
        } else if self.source_mode() == FusionMode::SYNC {
            self.drain.run(ticket, |_| self.run_sync());
        } else {
            self.drain.run(ticket, |progress| self.run_async(progress));
        }
    }

    fn run_sync(&self) -> ControlFlow<()> {
        let Some(downstream) = self.downstream.get() else {
            return ControlFlow::Break(());
        };
        let requested = self.demand.get();
        let mut emitted = 0;
        while emitted != requested {
            if self.cancelled.load(Ordering::Acquire) {
                return self.stop();
            }
            if self.errors.has_error() {
                return self.finish();
            }
            let item = match self.poll_source() {
                Ok(item) => item,
                Err(error) => return self.fail_polled(error),
            };
            let Some(item) = item else {
                return self.finish();
            };
            downstream.on_next(item);
            emitted += 1;
        }

        if self.cancelled.load(Ordering::Acquire) {
            return self.stop();
        }
        if self.errors.has_error() || self.source_is_empty() {
            return self.finish();
        }
        if emitted != 0 {
            self.demand.produced(emitted);
        }
        ControlFlow::Continue(())
    }

    fn run_async(&self, progress: &mut Progress) -> ControlFlow<()> {
        let Some(downstream) = self.downstream.get() else {
            return ControlFlow::Break(());
        };
        let mut emitted = progress.produced;
        let mut requested = self.demand.get();
        while emitted != requested {
            let done = self.done.load(Ordering::Acquire);
            let item = match self.poll_source() {
                Ok(item) => item,
                Err(error) => return self.fail_polled(error),
            };
            self.check_terminated(done, item.is_none())?;
            let Some(item) = item else {
                break;
            };
            downstream.on_next(item);
            emitted += 1;
            if emitted == self.limit {
                if requested != UNBOUNDED {
                    requested = self.demand.produced(emitted);
                }
                self.request_upstream(emitted);
                emitted = 0;
            }
        }

        if emitted == requested {
            let done = self.done.load(Ordering::Acquire);
            self.check_terminated(done, self.source_is_empty())?;
        }
        progress.produced = emitted;
        ControlFlow::Continue(())
    }

    fn run_backfused(&self) -> ControlFlow<()> {
        if self.cancelled.load(Ordering::Acquire) {
            self.downstream.release();
            return ControlFlow::Break(());
        }
        let done = self.done.load(Ordering::Acquire);
        if done && self.errors.has_error() {
            return self.finish();
        }
        let Some(downstream) = self.downstream.get() else {
            return ControlFlow::Break(());
        };
        downstream.on_available();
        if done {
            return self.finish();
        }
        ControlFlow::Continue(())
    }

    fn check_terminated(&self, done: bool, empty: bool) -> ControlFlow<()> {
        if self.cancelled.load(Ordering::Acquire) {
            return self.stop();
        }
        if done {
            if self.errors.has_error() {
                self.clear_source();
                return self.finish();
            }
            if empty {
                return self.finish();
            }
        }
        ControlFlow::Continue(())
    }

    fn stop(&self) -> ControlFlow<()> {
        self.clear_source();
        self.downstream.release();
        ControlFlow::Break(())
    }

    fn finish(&self) -> ControlFlow<()> {
        if let Some(downstream) = self.downstream.release() {
            self.errors.try_terminate_consumer(&*downstream);
        }
        self.worker.cancel();
        ControlFlow::Break(())
    }

    fn fail_polled(&self, error: Error) -> ControlFlow<()> {
        self.cancel_upstream();
        self.clear_source();
        self.errors.add_error(error);
        self.finish()
    }
}

impl<T: Send + 'static> Subscriber<T> for ObserveOn<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if self.upstream.set(subscription.clone()).is_err() {
            subscription.cancel();
            self.ctx
                .on_undeliverable(ProtocolViolation::DuplicateSubscription.into());
            return;
        }

        if let Some(fusable) = subscription.as_fusable() {
            let mode = fusable.request_fusion(FusionMode::ANY | FusionMode::BOUNDARY);
            if mode == FusionMode::SYNC {
                self.source_mode.store(mode_to_u8(mode), Ordering::Release);
                let _ = self.source.set(Source::Fused(fusable.clone()));
                self.done.store(true, Ordering::Release);
                self.attach_downstream();
                return;
            }
            if mode == FusionMode::ASYNC {
                self.source_mode.store(mode_to_u8(mode), Ordering::Release);
                let _ = self.source.set(Source::Fused(fusable.clone()));
                self.attach_downstream();
                subscription.request(self.prefetch as u64);
                return;
            }
        }

        let _ = self.source.set(Source::Queue(BoundedQueue::new(self.prefetch)));
        self.attach_downstream();
        subscription.request(self.prefetch as u64);
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if self.source_mode() == FusionMode::ASYNC {
            self.schedule();
            return;
        }
        if let Some(Source::Queue(queue)) = self.source.get() {
            if let Err(error) = queue.offer(item) {
                tracing::warn!(capacity = queue.capacity(), "observe_on queue overflow");
                self.cancel_upstream();
                self.errors.add_error(error);
                self.done.store(true, Ordering::Release);
            }
        }
        self.schedule();
    }

    fn on_error(&self, error: Error) {
        if self.done.swap(true, Ordering::AcqRel) {
            self.ctx.on_undeliverable(error);
            return;
        }
        self.errors.add_error(error);
        self.schedule();
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.schedule();
        }
    }

    fn on_available(&self) {
        self.schedule();
    }
}

impl<T: Send + 'static> Cancellable for ObserveOn<T> {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::trace!("observe_on cancelled");
        self.cancel_upstream();
        self.worker.cancel();
        self.downstream.release();
        if !self.output_fused.load(Ordering::Acquire) {
            if let Some(ticket) = self.drain.enter() {
                self.drain.run(ticket, |_| {
                    self.clear_source();
                    ControlFlow::Break(())
                });
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl<T: Send + 'static> Subscription for ObserveOn<T> {
    fn request(&self, n: u64) {
        match validate(n) {
            Ok(n) => {
                self.demand.add(n);
            }
            Err(violation) => {
                self.cancel_upstream();
                self.errors.add_error(violation);
                self.done.store(true, Ordering::Release);
            }
        }
        self.schedule();
    }
}

impl<T: Send + 'static> FusionAware<T> for ObserveOn<T> {
    fn request_fusion(&self, mode: FusionMode) -> FusionMode {
        if mode.contains(FusionMode::ASYNC) {
            self.output_fused.store(true, Ordering::Release);
            return FusionMode::ASYNC;
        }
        FusionMode::NONE
    }

    fn poll(&self) -> Result<Option<T>> {
        let item = self.poll_source()?;
        if item.is_some() && self.source_mode() != FusionMode::SYNC {
            let consumed = self.fused_consumed.load(Ordering::Relaxed) + 1;
            if consumed == self.limit {
                self.fused_consumed.store(0, Ordering::Relaxed);
                self.request_upstream(consumed);
            } else {
                self.fused_consumed.store(consumed, Ordering::Relaxed);
            }
        }
        Ok(item)
    }

    fn is_empty(&self) -> bool {
        self.source_is_empty()
    }

    fn clear(&self) {
        self.clear_source();
    }
}
