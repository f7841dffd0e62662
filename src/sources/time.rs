//! Time-based sources driven by a [`Scheduler`] worker.
//!
//! Both sources ignore backpressure in the sense that time does not wait: a tick
//! that finds no outstanding demand fails the flow with
//! [`Error::MissingBackpressure`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::context::Context;
use crate::core::demand::validate;
use crate::core::{Cancellable, Demand, Downstream, Publisher, Subscriber, Subscription, Upstream};
use crate::error::Error;
use crate::scheduler::{Scheduler, Worker};

/// Emits `0` after a delay, then completes.
pub struct TimerPublisher {
    delay: Duration,
    scheduler: Arc<dyn Scheduler>,
}

impl TimerPublisher {
    pub fn new(delay: Duration, scheduler: Arc<dyn Scheduler>) -> Self {
        Self { delay, scheduler }
    }
}

impl Publisher<u64> for TimerPublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<u64>>, _ctx: &Context) {
        let worker = self.scheduler.create_worker();
        let timer = Arc::new_cyclic(|me| TimerSubscription {
            me: me.clone(),
            downstream: Downstream::new(subscriber.clone()),
            requested: AtomicBool::new(false),
            worker: worker.clone(),
        });
        subscriber.on_subscribe(Upstream::plain(timer.clone()));

        let fire = timer.clone();
        worker.schedule_delayed(Box::new(move || fire.fire()), self.delay);
    }
}

struct TimerSubscription {
    me: Weak<Self>,
    downstream: Downstream<u64>,
    requested: AtomicBool,
    worker: Arc<dyn Worker>,
}

impl TimerSubscription {
    fn fire(&self) {
        if let Some(downstream) = self.downstream.release() {
            if self.requested.load(Ordering::Acquire) {
                downstream.on_next(0);
                downstream.on_complete();
            } else {
                tracing::warn!("timer fired without outstanding demand");
                downstream.on_error(Error::missing_backpressure(
                    "Can't deliver value due to lack of requests",
                ));
            }
        }
        self.worker.cancel();
    }

    fn fail(&self, error: Error) {
        if let Some(downstream) = self.downstream.release() {
            downstream.on_error(error);
        }
        self.worker.cancel();
    }
}

impl Cancellable for TimerSubscription {
    fn cancel(&self) {
        self.downstream.release();
        self.worker.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.worker.is_cancelled()
    }
}

impl Subscription for TimerSubscription {
    fn request(&self, n: u64) {
        match validate(n) {
            Ok(_) => self.requested.store(true, Ordering::Release),
            // signals must not overlap with a firing timer, so the failure runs on
            // the worker as well
            Err(violation) => {
                if let Some(me) = self.me.upgrade() {
                    self.worker.schedule(Box::new(move || me.fail(violation)));
                }
            }
        }
    }
}

/// Emits `0, 1, 2, ...`, one value per period, starting one period after
/// subscription.
pub struct IntervalPublisher {
    initial: Duration,
    period: Duration,
    scheduler: Arc<dyn Scheduler>,
}

impl IntervalPublisher {
    pub fn new(period: Duration, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::with_initial_delay(period, period, scheduler)
    }

    pub fn with_initial_delay(
        initial: Duration,
        period: Duration,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            initial,
            period,
            scheduler,
        }
    }
}

impl Publisher<u64> for IntervalPublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<u64>>, _ctx: &Context) {
        let worker = self.scheduler.create_worker();
        let interval = Arc::new_cyclic(|me| IntervalSubscription {
            me: me.clone(),
            downstream: Downstream::new(subscriber.clone()),
            demand: Demand::new(),
            count: AtomicU64::new(0),
            worker: worker.clone(),
        });
        subscriber.on_subscribe(Upstream::plain(interval.clone()));

        let tick = interval.clone();
        worker.schedule_periodic(Box::new(move || tick.tick()), self.initial, self.period);
    }
}

struct IntervalSubscription {
    me: Weak<Self>,
    downstream: Downstream<u64>,
    demand: Demand,
    count: AtomicU64,
    worker: Arc<dyn Worker>,
}

impl IntervalSubscription {
    fn tick(&self) {
        let Some(downstream) = self.downstream.get() else {
            return;
        };
        let count = self.count.load(Ordering::Relaxed);
        if self.demand.get() != 0 {
            downstream.on_next(count);
            self.count.store(count + 1, Ordering::Relaxed);
            self.demand.produced(1);
        } else {
            tracing::warn!(count, "interval tick without outstanding demand");
            self.fail(Error::missing_backpressure(format!(
                "Can't deliver value {} due to lack of requests",
                count
            )));
        }
    }

    fn fail(&self, error: Error) {
        if let Some(downstream) = self.downstream.release() {
            downstream.on_error(error);
        }
        self.worker.cancel();
    }
}

impl Cancellable for IntervalSubscription {
    fn cancel(&self) {
        self.downstream.release();
        self.worker.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.worker.is_cancelled()
    }
}

impl Subscription for IntervalSubscription {
    fn request(&self, n: u64) {
        match validate(n) {
            Ok(n) => {
                self.demand.add(n);
            }
            Err(violation) => {
                if let Some(me) = self.me.upgrade() {
                    self.worker.schedule(Box::new(move || me.fail(violation)));
                }
            }
        }
    }
}
