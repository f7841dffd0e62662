//! Basic usage examples for fluxweld
//!
//! Run with: cargo run --example basic

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use fluxweld::prelude::*;

/// Subscriber printing everything it receives, requesting one item at a time.
struct PrintSubscriber {
    prefix: &'static str,
    upstream: OnceLock<Upstream<String>>,
    done: AtomicBool,
}

impl PrintSubscriber {
    fn new(prefix: &'static str) -> Arc<Self> {
        Arc::new(Self {
            prefix,
            upstream: OnceLock::new(),
            done: AtomicBool::new(false),
        })
    }
}

impl Subscriber<String> for PrintSubscriber {
    fn on_subscribe(&self, subscription: Upstream<String>) {
        let _ = self.upstream.set(subscription.clone());
        subscription.request(1);
    }

    fn on_next(&self, item: String) {
        println!("{}: {}", self.prefix, item);
        if let Some(upstream) = self.upstream.get() {
            upstream.request(1);
        }
    }

    fn on_error(&self, error: Error) {
        println!("{} failed: {}", self.prefix, error);
        self.done.store(true, Ordering::Release);
    }

    fn on_complete(&self) {
        println!("{} done", self.prefix);
        self.done.store(true, Ordering::Release);
    }
}

/// Example 1: Transform and filter
fn transform_filter_example() {
    println!("=== Transform and Filter ===");

    let ts = TestSubscriber::<i64>::new();
    Flowable::range(1, 20)
        .filter(|x| x % 3 == 0)
        .map(|x| x * x)
        .subscribe(ts.clone());

    println!("Squares: {:?}", ts.values());
    println!();
}

/// Example 2: A hand-written subscriber pulling one item at a time
fn custom_subscriber_example() {
    println!("=== Custom Subscriber ===");

    let printer = PrintSubscriber::new("Item");
    Flowable::from_iter(vec!["alpha", "beta", "gamma"])
        .map(str::to_uppercase)
        .subscribe(printer.clone());

    assert!(printer.done.load(Ordering::Acquire));
    println!();
}

/// Example 3: Hopping onto a worker
async fn observe_on_example() {
    println!("=== Observe On ===");

    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::current());
    let ts = TestSubscriber::<i64>::new();
    Flowable::range(0, 1_000)
        .observe_on_with(scheduler, 32)
        .subscribe(ts.clone());

    ts.await_terminal(Duration::from_secs(5)).await;
    println!("Received {} items on a worker", ts.value_count());
    println!();
}

/// Example 4: Windowed join of two hot sources
fn group_join_example() {
    println!("=== Group Join ===");

    let orders = UnicastProcessor::<&'static str>::new();
    let prices = UnicastProcessor::<u32>::new();

    let ts = TestSubscriber::<(&'static str, Flowable<u32>)>::new();
    Flowable::from_arc(orders.clone())
        .group_join(
            Flowable::from_arc(prices.clone()),
            |_| Ok(Flowable::<()>::never()),
            |_| Ok(Flowable::<()>::never()),
            |order, window| Ok((order, window)),
        )
        .subscribe(ts.clone());

    prices.on_next(100);
    orders.on_next("order-1");
    prices.on_next(105);
    orders.on_complete();
    prices.on_complete();

    for (order, window) in ts.values() {
        let seen = TestSubscriber::<u32>::new();
        window.subscribe(seen.clone());
        println!("{} saw prices {:?}", order, seen.values());
    }
    println!();
}

/// Example 5: Parallel reduction
async fn parallel_reduce_example() {
    println!("=== Parallel Reduce ===");

    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::current());
    let rails = (0..4)
        .map(|i| Flowable::range(i * 250 + 1, 250).observe_on(scheduler.clone()))
        .collect();

    let ts = TestSubscriber::<i64>::new();
    ParallelFlowable::from_rails(rails)
        .reduce(|a, b| a + b)
        .subscribe(ts.clone());

    ts.await_terminal(Duration::from_secs(5)).await;
    println!("Sum of 1..=1000: {:?}", ts.values());
    println!();
}

#[tokio::main]
async fn main() {
    transform_filter_example();
    custom_subscriber_example();
    observe_on_example().await;
    group_join_example();
    parallel_reduce_example().await;
}
