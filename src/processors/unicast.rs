//! A processor that buffers everything for its one subscriber.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::context::Context;
use crate::core::demand::validate;
use crate::core::fusion::negotiate;
use crate::core::{
    Cancellable, Demand, Downstream, EmptySubscription, FusionAware, FusionMode, HandoffQueue,
    LinkedQueue, Publisher, Subscriber, Subscription, Upstream, WorkInProgress, UNBOUNDED,
};
use crate::error::{Error, ProtocolViolation, Result};

/// Both ends of a flow in one object: signals pushed into it as a [`Subscriber`]
/// are queued without bound and replayed to the single subscriber it accepts as a
/// [`Publisher`], under that subscriber's demand.
///
/// A second subscriber is rejected with
/// [`ProtocolViolation::SingleSubscriberOnly`]. The subscriber may request ASYNC
/// fusion and poll the queue directly.
///
/// # Example
///
/// ```rust
/// use fluxweld::prelude::*;
///
/// let processor = UnicastProcessor::<i32>::new();
/// processor.on_next(1);
/// processor.on_next(2);
/// processor.on_complete();
///
/// let ts = TestSubscriber::<i32>::new();
/// processor.subscribe(ts.clone(), &Context::new());
/// ts.assert_values(&[1, 2]);
/// ts.assert_complete();
/// ```
pub struct UnicastProcessor<T> {
    me: Weak<Self>,
    queue: LinkedQueue<T>,
    downstream: Downstream<T>,
    once: AtomicBool,
    attached: AtomicBool,
    demand: Demand,
    wip: WorkInProgress,
    done: AtomicBool,
    error: OnceLock<Error>,
    violation: OnceLock<Error>,
    cancelled: AtomicBool,
    fused: AtomicBool,
    ctx: Context,
}

impl<T: Send + 'static> UnicastProcessor<T> {
    pub fn new() -> Arc<Self> {
        Self::with_context(Context::default())
    }

    /// A processor reporting undeliverable errors to `ctx`.
    pub fn with_context(ctx: Context) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            queue: LinkedQueue::new(),
            downstream: Downstream::empty(),
            once: AtomicBool::new(false),
            attached: AtomicBool::new(false),
            demand: Demand::new(),
            wip: WorkInProgress::new(),
            done: AtomicBool::new(false),
            error: OnceLock::new(),
            violation: OnceLock::new(),
            cancelled: AtomicBool::new(false),
            fused: AtomicBool::new(false),
            ctx,
        })
    }

    pub fn has_subscriber(&self) -> bool {
        self.attached.load(Ordering::Acquire) && !self.downstream.is_released()
    }

    /// Items queued and not yet delivered.
    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    fn drain(&self) {
        self.wip.drain(|| self.pass());
    }

    fn pass(&self) -> ControlFlow<()> {
        let Some(downstream) = self.downstream.get() else {
            if self.attached.load(Ordering::Acquire) {
                // already released: terminated or cancelled
                self.queue.clear();
                return ControlFlow::Break(());
            }
            return ControlFlow::Continue(());
        };
        if self.fused.load(Ordering::Acquire) {
            self.pass_fused(&*downstream)
        } else {
            self.pass_regular(&*downstream)
        }
    }

    fn pass_regular(&self, downstream: &dyn Subscriber<T>) -> ControlFlow<()> {
        let requested = self.demand.get();
        let mut emitted = 0;
        while emitted != requested {
            let done = self.done.load(Ordering::Acquire);
            let item = self.queue.poll();
            self.check_terminated(done, item.is_none())?;
            let Some(item) = item else {
                break;
            };
            downstream.on_next(item);
            emitted += 1;
        }

        if emitted == requested {
            let done = self.done.load(Ordering::Acquire);
            self.check_terminated(done, self.queue.is_empty())?;
        }
        if emitted != 0 {
            self.demand.produced(emitted);
        }
        ControlFlow::Continue(())
    }

    fn pass_fused(&self, downstream: &dyn Subscriber<T>) -> ControlFlow<()> {
        if let Some(violation) = self.violation.get() {
            self.queue.clear();
            self.terminate_with(Some(violation.clone()));
            return ControlFlow::Break(());
        }
        if self.cancelled.load(Ordering::Acquire) {
            self.downstream.release();
            return ControlFlow::Break(());
        }

        let done = self.done.load(Ordering::Acquire);
        downstream.on_available();
        if done {
            self.terminate_with(self.error.get().cloned());
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    fn check_terminated(&self, done: bool, empty: bool) -> ControlFlow<()> {
        // a violation also cancels, but its error still has to go out
        if let Some(violation) = self.violation.get() {
            self.queue.clear();
            self.terminate_with(Some(violation.clone()));
            return ControlFlow::Break(());
        }
        if self.cancelled.load(Ordering::Acquire) {
            self.queue.clear();
            self.downstream.release();
            return ControlFlow::Break(());
        }
        if done && empty {
            self.terminate_with(self.error.get().cloned());
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    fn terminate_with(&self, error: Option<Error>) {
        if let Some(downstream) = self.downstream.release() {
            match error {
                Some(error) => downstream.on_error(error),
                None => downstream.on_complete(),
            }
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for UnicastProcessor<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if self.done.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
            subscription.cancel();
        } else {
            subscription.request(UNBOUNDED);
        }
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if let Err(error) = self.queue.offer(item) {
            self.on_error(error);
            return;
        }
        self.drain();
    }

    fn on_error(&self, error: Error) {
        if self.done.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
            self.ctx.on_undeliverable(error);
            return;
        }
        if let Err(error) = self.error.set(error) {
            self.ctx.on_undeliverable(error);
            return;
        }
        self.done.store(true, Ordering::Release);
        self.drain();
    }

    fn on_complete(&self) {
        if self.done.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
            return;
        }
        self.done.store(true, Ordering::Release);
        self.drain();
    }
}

impl<T: Send + 'static> Publisher<T> for UnicastProcessor<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>, _ctx: &Context) {
        let me = match self.me.upgrade() {
            Some(me) if !self.once.swap(true, Ordering::AcqRel) => me,
            _ => {
                tracing::warn!("second subscriber rejected by unicast processor");
                subscriber.on_subscribe(Upstream::plain(Arc::new(EmptySubscription::new())));
                subscriber.on_error(ProtocolViolation::SingleSubscriberOnly.into());
                return;
            }
        };

        subscriber.on_subscribe(Upstream::fusable(me));
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        self.downstream.set(subscriber);
        self.attached.store(true, Ordering::Release);
        self.drain();
    }
}

impl<T: Send + 'static> Cancellable for UnicastProcessor<T> {
    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.drain();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl<T: Send + 'static> Subscription for UnicastProcessor<T> {
    fn request(&self, n: u64) {
        match validate(n) {
            Ok(n) => {
                self.demand.add(n);
            }
            Err(violation) => match self.violation.set(violation) {
                Ok(()) => {
                    tracing::debug!("unicast processor cancelled by a zero request");
                    self.cancelled.store(true, Ordering::Release);
                }
                Err(violation) => self.ctx.on_undeliverable(violation),
            },
        }
        self.drain();
    }
}

impl<T: Send + 'static> FusionAware<T> for UnicastProcessor<T> {
    fn request_fusion(&self, mode: FusionMode) -> FusionMode {
        let granted = negotiate(mode, FusionMode::ASYNC);
        if granted == FusionMode::ASYNC {
            self.fused.store(true, Ordering::Release);
        }
        granted
    }

    fn poll(&self) -> Result<Option<T>> {
        Ok(self.queue.poll())
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn clear(&self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::TestSubscriber;

    #[test]
    fn buffers_until_requested() {
        let processor = UnicastProcessor::<i32>::new();
        let ts = TestSubscriber::<i32>::with_request(1);
        processor.subscribe(ts.clone(), &Context::new());

        for i in 0..4 {
            processor.on_next(i);
        }
        processor.on_complete();
        ts.assert_values(&[0]);
        assert_eq!(processor.backlog(), 3);

        ts.request(3);
        ts.assert_values(&[0, 1, 2, 3]);
        ts.assert_complete();
    }

    #[test]
    fn error_is_delivered_after_buffered_items() {
        let processor = UnicastProcessor::<&str>::new();
        processor.on_next("a");
        processor.on_error(Error::custom("late"));

        let ts = TestSubscriber::<&str>::new();
        processor.subscribe(ts.clone(), &Context::new());
        ts.assert_values(&["a"]);
        ts.assert_error(|e| e.to_string() == "late");
    }

    #[test]
    fn second_subscriber_is_rejected() {
        let processor = UnicastProcessor::<u8>::new();
        let first = TestSubscriber::<u8>::new();
        let second = TestSubscriber::<u8>::new();
        processor.subscribe(first.clone(), &Context::new());
        processor.subscribe(second.clone(), &Context::new());

        first.assert_not_terminated();
        second.assert_error(|e| {
            matches!(e, Error::Protocol(ProtocolViolation::SingleSubscriberOnly))
        });
    }

    #[test]
    fn async_fusion_signals_availability() {
        let processor = UnicastProcessor::<i32>::new();
        let ts = TestSubscriber::<i32>::with_fusion(FusionMode::ANY, UNBOUNDED);
        processor.subscribe(ts.clone(), &Context::new());
        assert_eq!(ts.fusion_mode(), FusionMode::ASYNC);

        processor.on_next(7);
        processor.on_next(8);
        ts.assert_values(&[7, 8]);
        processor.on_complete();
        ts.assert_complete();
    }

    #[test]
    fn zero_request_fails_once() {
        let processor = UnicastProcessor::<i32>::new();
        let ts = TestSubscriber::<i32>::with_request(0);
        processor.subscribe(ts.clone(), &Context::new());
        processor.on_next(1);

        ts.request(0);
        ts.request(0);
        ts.assert_values(&[]);
        ts.assert_error(Error::is_protocol_violation);
    }

    #[test]
    fn cancel_drops_the_backlog() {
        let processor = UnicastProcessor::<i32>::new();
        let ts = TestSubscriber::<i32>::with_request(0);
        processor.subscribe(ts.clone(), &Context::new());
        processor.on_next(1);
        processor.on_next(2);

        ts.cancel();
        assert!(processor.is_cancelled());
        assert_eq!(processor.backlog(), 0);
        processor.on_next(3);
        ts.request(5);
        ts.assert_values(&[]);
        ts.assert_not_terminated();
    }

    #[test]
    fn zero_request_cancels_and_stops_buffering() {
        let processor = UnicastProcessor::<i32>::new();
        let ts = TestSubscriber::<i32>::with_request(0);
        processor.subscribe(ts.clone(), &Context::new());
        processor.on_next(1);

        ts.request(0);
        ts.assert_error(Error::is_protocol_violation);
        assert!(processor.is_cancelled());
        assert!(!processor.has_subscriber());

        for i in 0..1_000 {
            processor.on_next(i);
        }
        assert_eq!(processor.backlog(), 0);
    }

    #[test]
    fn fused_zero_request_is_delivered_and_cancels() {
        let processor = UnicastProcessor::<i32>::new();
        let ts = TestSubscriber::<i32>::with_fusion(FusionMode::ASYNC, 0);
        processor.subscribe(ts.clone(), &Context::new());
        assert_eq!(ts.fusion_mode(), FusionMode::ASYNC);

        ts.request(0);
        ts.assert_error(Error::is_protocol_violation);
        processor.on_next(1);
        assert_eq!(processor.backlog(), 0);
    }
}
