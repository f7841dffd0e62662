//! Integration tests for the reactive-streams engine

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use fluxweld::core::{BoundedQueue, CompositeCancellable, Demand, ErrorSlot, HandoffQueue};
use fluxweld::prelude::*;

const WAIT: Duration = Duration::from_secs(5);

fn scheduler() -> Arc<dyn Scheduler> {
    Arc::new(TokioScheduler::current())
}

#[test]
fn test_join_window_sees_rights_opened_during_it() {
    let lefts = UnicastProcessor::<&'static str>::new();
    let rights = UnicastProcessor::<&'static str>::new();
    let close = UnicastProcessor::<()>::new();

    let end = close.clone();
    let joined = TestSubscriber::<(&'static str, Flowable<&'static str>)>::new();
    Flowable::from_arc(lefts.clone())
        .group_join(
            Flowable::from_arc(rights.clone()),
            move |_| Ok(Flowable::from_arc(end.clone())),
            |_| Ok(Flowable::<()>::never()),
            |left, window| Ok((left, window)),
        )
        .subscribe(joined.clone());

    lefts.on_next("L");
    rights.on_next("R1");
    rights.on_next("R2");
    close.on_next(());
    rights.on_next("R3");
    lefts.on_complete();
    rights.on_complete();
    joined.assert_complete();

    let (left, window) = joined.values().remove(0);
    assert_eq!(left, "L");
    let seen = TestSubscriber::<&'static str>::new();
    window.subscribe(seen.clone());
    seen.assert_values(&["R1", "R2"]);
    seen.assert_complete();
}

#[test]
fn test_parallel_reduce_adds_rails() {
    let ts = TestSubscriber::<i32>::new();
    ParallelFlowable::from_rails(vec![Flowable::just(4), Flowable::just(5)])
        .reduce(|a, b| a + b)
        .subscribe(ts.clone());

    ts.assert_values(&[9]);
    ts.assert_complete();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_reduce_any_completion_order() {
    let scheduler = scheduler();
    for _ in 0..20 {
        let rails: Vec<Flowable<i64>> = (0..8)
            .map(|i| Flowable::range(i * 1_000, 1_000).observe_on(scheduler.clone()))
            .collect();
        let ts = TestSubscriber::<i64>::new();
        ParallelFlowable::from_rails(rails)
            .reduce(|a, b| a + b)
            .subscribe(ts.clone());

        assert!(ts.await_terminal(WAIT).await);
        ts.assert_values(&[(0..8_000).sum::<i64>()]);
        ts.assert_complete();
    }
}

#[test]
fn test_zero_request_is_one_violation() {
    let ts = TestSubscriber::<i32>::with_request(0);
    Flowable::from_iter(vec![1, 2, 3]).subscribe(ts.clone());

    ts.request(0);
    ts.request(5);
    ts.assert_values(&[]);
    let errors = ts.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].is_protocol_violation());
    assert_eq!(ts.protocol_violations(), 0);
}

#[test]
fn test_demand_never_underflows() {
    let demand = Demand::new();
    demand.add(3);
    for _ in 0..3 {
        demand.produced(1);
    }
    assert_eq!(demand.get(), 0);
    assert_eq!(demand.produced(1), 0);
}

#[test]
fn test_bounded_queue_capacity_one_concurrent_offers() {
    for _ in 0..100 {
        let queue = Arc::new(BoundedQueue::new(1));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let queue = queue.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    queue.offer(i)
                })
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let rejected = results.into_iter().find_map(|r| r.err()).unwrap();
        assert!(rejected.is_missing_backpressure());
    }
}

#[test]
fn test_exactly_one_terminal_signal_under_contention() {
    for _ in 0..50 {
        let ctx = Context::new();
        let undelivered = Arc::new(AtomicUsize::new(0));
        let counter = undelivered.clone();
        ctx.set_undeliverable_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let slot = Arc::new(ErrorSlot::new(ctx));
        let ts = TestSubscriber::<i32>::new();
        let barrier = Arc::new(Barrier::new(6));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let slot = slot.clone();
                let ts = ts.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    if i % 2 == 0 {
                        slot.add_error(Error::custom(format!("e{i}")));
                    } else {
                        slot.try_terminate_consumer::<i32>(&*ts);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let delivered: usize = ts.errors().iter().map(|e| e.errors().len()).sum();
        assert_eq!(ts.errors().len() + ts.completions(), 1);
        assert_eq!(ts.protocol_violations(), 0);
        assert_eq!(delivered + undelivered.load(Ordering::SeqCst), 3);
    }
}

#[test]
fn test_concurrent_dispose_cancels_children_once() {
    struct Counted(AtomicUsize);

    impl Cancellable for Counted {
        fn cancel(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn is_cancelled(&self) -> bool {
            self.0.load(Ordering::SeqCst) > 0
        }
    }

    let composite = Arc::new(CompositeCancellable::new());
    let children: Vec<_> = (0..16).map(|_| Arc::new(Counted(AtomicUsize::new(0)))).collect();
    for child in &children {
        composite.add(child.clone());
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let composite = composite.clone();
            thread::spawn(move || composite.cancel())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for child in &children {
        assert_eq!(child.0.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_observe_on_preserves_order_across_workers() {
    let ts = TestSubscriber::<i64>::new();
    Flowable::range(0, 10_000)
        .map(|x| x * 2)
        .observe_on_with(scheduler(), 16)
        .filter(|x| x % 4 == 0)
        .subscribe(ts.clone());

    assert!(ts.await_terminal(WAIT).await);
    ts.assert_complete();
    let expected: Vec<i64> = (0..10_000).map(|x| x * 2).filter(|x| x % 4 == 0).collect();
    ts.assert_values(&expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_processor_fed_from_another_thread() {
    let processor = UnicastProcessor::<u32>::new();
    let ts = TestSubscriber::<u32>::new();
    Flowable::from_arc(processor.clone())
        .observe_on(scheduler())
        .subscribe(ts.clone());

    let feeder = processor.clone();
    thread::spawn(move || {
        for i in 0..1_000 {
            feeder.on_next(i);
        }
        feeder.on_complete();
    });

    assert!(ts.await_terminal(WAIT).await);
    ts.assert_complete();
    assert_eq!(ts.values(), (0..1_000).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_stops_interval() {
    let ts = TestSubscriber::<u64>::new();
    Flowable::interval(Duration::from_millis(2), scheduler()).subscribe(ts.clone());

    assert!(ts.await_count(3, WAIT).await);
    ts.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let after_cancel = ts.value_count();
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert_eq!(ts.value_count(), after_cancel);
    ts.assert_not_terminated();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lagging_interval_consumer_gets_missing_backpressure() {
    let ts = TestSubscriber::<u64>::with_request(2);
    Flowable::interval(Duration::from_millis(2), scheduler()).subscribe(ts.clone());

    assert!(ts.await_terminal(WAIT).await);
    ts.assert_values(&[0, 1]);
    ts.assert_error(Error::is_missing_backpressure);
}

#[test]
fn test_errors_after_terminal_reach_the_context_handler() {
    let ctx = Context::new();
    let undelivered = Arc::new(AtomicUsize::new(0));
    let counter = undelivered.clone();
    ctx.set_undeliverable_handler(move |e| {
        assert!(matches!(e, Error::Undeliverable(_)));
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let processor = UnicastProcessor::<i32>::with_context(ctx.clone());
    let ts = TestSubscriber::<i32>::new();
    Flowable::from_arc(processor.clone())
        .map(|x| x + 1)
        .subscribe_with(ts.clone(), &ctx);

    processor.on_next(1);
    processor.on_complete();
    processor.on_error(Error::custom("too late"));

    ts.assert_values(&[2]);
    ts.assert_complete();
    assert_eq!(undelivered.load(Ordering::SeqCst), 1);
}

/// Subscription that only counts how often it was cancelled.
#[derive(Default)]
struct CancelCounter(AtomicUsize);

impl Cancellable for CancelCounter {
    fn cancel(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) > 0
    }
}

impl Subscription for CancelCounter {
    fn request(&self, _n: u64) {}
}

/// A silent source remembering the subscription of every subscriber.
#[derive(Default)]
struct CountedNever {
    subscriptions: parking_lot::Mutex<Vec<Arc<CancelCounter>>>,
}

impl CountedNever {
    fn cancel_counts(&self) -> Vec<usize> {
        self.subscriptions
            .lock()
            .iter()
            .map(|s| s.0.load(Ordering::SeqCst))
            .collect()
    }
}

impl<T> Publisher<T> for CountedNever {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>, _ctx: &Context) {
        let subscription = Arc::new(CancelCounter::default());
        self.subscriptions.lock().push(subscription.clone());
        subscriber.on_subscribe(Upstream::plain(subscription));
    }
}

#[test]
fn test_cancel_during_active_drain_halts_and_disposes_once() {
    for _ in 0..20 {
        let lefts = UnicastProcessor::<u32>::new();
        let rights = Arc::new(CountedNever::default());
        let ends = Arc::new(CountedNever::default());

        let end_source = ends.clone();
        let ts = TestSubscriber::<(u32, Flowable<i32>)>::new();
        Flowable::from_arc(lefts.clone())
            .group_join(
                Flowable::<i32>::from_arc(rights.clone()),
                move |_| Ok(Flowable::<()>::from_arc(end_source.clone())),
                |_| Ok(Flowable::<()>::never()),
                |left, window| Ok((left, window)),
            )
            .subscribe(ts.clone());

        let feeder = {
            let lefts = lefts.clone();
            thread::spawn(move || {
                for i in 0..20_000 {
                    lefts.on_next(i);
                }
            })
        };
        while ts.value_count() < 50 {
            thread::yield_now();
        }
        ts.cancel();
        // at most the window being opened while cancel ran can still get out
        let after_cancel = ts.value_count();
        feeder.join().unwrap();

        assert!(ts.value_count() <= after_cancel + 1);
        ts.assert_not_terminated();
        assert!(lefts.is_cancelled());
        assert_eq!(rights.cancel_counts(), vec![1]);
        let ends = ends.cancel_counts();
        assert!(!ends.is_empty());
        assert!(ends.iter().all(|count| *count == 1), "{ends:?}");
    }
}

#[test]
fn test_join_fed_from_two_threads() {
    for _ in 0..50 {
        let lefts = UnicastProcessor::<u32>::new();
        let rights = UnicastProcessor::<u32>::new();
        let ts = TestSubscriber::<(u32, Flowable<u32>)>::new();
        Flowable::from_arc(lefts.clone())
            .group_join(
                Flowable::from_arc(rights.clone()),
                |_| Ok(Flowable::<()>::never()),
                |_| Ok(Flowable::<()>::never()),
                |left, window| Ok((left, window)),
            )
            .subscribe(ts.clone());

        let barrier = Arc::new(Barrier::new(2));
        let feeders: Vec<_> = [lefts.clone(), rights.clone()]
            .into_iter()
            .zip([20, 50])
            .map(|(input, count)| {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..count {
                        input.on_next(i);
                    }
                    input.on_complete();
                })
            })
            .collect();
        for feeder in feeders {
            feeder.join().unwrap();
        }

        ts.assert_complete();
        let joined = ts.values();
        let mut lefts_seen: Vec<u32> = joined.iter().map(|(left, _)| *left).collect();
        lefts_seen.sort_unstable();
        assert_eq!(lefts_seen, (0..20).collect::<Vec<_>>());

        // windows never close, so each one sees every right exactly once
        for (_, window) in joined {
            let seen = TestSubscriber::<u32>::new();
            window.subscribe(seen.clone());
            seen.assert_complete();
            let mut values = seen.values();
            values.sort_unstable();
            assert_eq!(values, (0..50).collect::<Vec<_>>());
        }
    }
}

#[test]
fn test_delivery_never_exceeds_granted_demand() {
    let processor = UnicastProcessor::<u32>::new();
    let ts = TestSubscriber::<u32>::with_request(0);
    Flowable::from_arc(processor.clone())
        .map(|x| x + 1)
        .subscribe(ts.clone());

    let granted = Arc::new(AtomicUsize::new(0));
    let feeder = {
        let processor = processor.clone();
        thread::spawn(move || {
            for i in 0..10_000 {
                processor.on_next(i);
            }
            processor.on_complete();
        })
    };
    let requester = {
        let ts = ts.clone();
        let granted = granted.clone();
        thread::spawn(move || {
            for _ in 0..100 {
                granted.fetch_add(10, Ordering::SeqCst);
                ts.request(10);
                thread::yield_now();
            }
        })
    };

    while !requester.is_finished() {
        let delivered = ts.value_count();
        assert!(delivered <= granted.load(Ordering::SeqCst));
    }
    requester.join().unwrap();
    feeder.join().unwrap();

    assert_eq!(ts.value_count(), 1_000);
    ts.assert_not_terminated();
    assert_eq!(ts.values(), (1..=1_000).collect::<Vec<_>>());
}
