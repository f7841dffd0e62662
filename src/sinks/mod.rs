//! Sink implementations for the fluxweld library.
//!
//! [`TestSubscriber`] records every signal it receives and checks the protocol
//! while doing so. It is what the crate's own tests use, and it is handy when
//! testing custom stages.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::core::fusion::mode_to_u8;
use crate::core::{FusionAware, FusionMode, Subscriber, Upstream, UNBOUNDED};
use crate::error::Error;

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    items: usize,
    terminated: bool,
}

/// A subscriber that collects values, errors and completions.
pub struct TestSubscriber<T> {
    initial_request: u64,
    fusion_request: FusionMode,
    fusion_granted: AtomicU8,
    upstream: OnceLock<Upstream<T>>,
    values: Mutex<Vec<T>>,
    errors: Mutex<Vec<Error>>,
    completions: AtomicUsize,
    violations: AtomicUsize,
    cancelled: AtomicBool,
    progress: watch::Sender<Progress>,
}

impl<T: Send + 'static> TestSubscriber<T> {
    /// A subscriber that requests everything upfront.
    pub fn new() -> Arc<Self> {
        Self::with_request(UNBOUNDED)
    }

    /// A subscriber that requests `n` items on subscription (`0`: nothing).
    pub fn with_request(n: u64) -> Arc<Self> {
        Self::with_fusion(FusionMode::NONE, n)
    }

    /// A subscriber that asks its upstream for `mode` fusion.
    pub fn with_fusion(mode: FusionMode, n: u64) -> Arc<Self> {
        let (progress, _) = watch::channel(Progress::default());
        Arc::new(Self {
            initial_request: n,
            fusion_request: mode,
            fusion_granted: AtomicU8::new(0),
            upstream: OnceLock::new(),
            values: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            completions: AtomicUsize::new(0),
            violations: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            progress,
        })
    }

    pub fn request(&self, n: u64) {
        if let Some(upstream) = self.upstream.get() {
            upstream.request(n);
        }
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            if let Some(upstream) = self.upstream.get() {
                upstream.cancel();
            }
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.upstream.get().is_some()
    }

    pub fn value_count(&self) -> usize {
        self.values.lock().len()
    }

    pub fn errors(&self) -> Vec<Error> {
        self.errors.lock().clone()
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.progress.borrow().terminated
    }

    /// Signals that broke the protocol: anything after a terminal signal, or a
    /// second `on_subscribe`.
    pub fn protocol_violations(&self) -> usize {
        self.violations.load(Ordering::Acquire)
    }

    /// The fusion mode granted by the upstream.
    pub fn fusion_mode(&self) -> FusionMode {
        FusionMode::from_bits(self.fusion_granted.load(Ordering::Acquire))
    }

    /// Wait until a terminal signal arrives; `false` on timeout.
    pub async fn await_terminal(&self, timeout: Duration) -> bool {
        let mut rx = self.progress.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|p| p.terminated)).await;
        matches!(waited, Ok(Ok(_)))
    }

    /// Wait until at least `count` values arrived; `false` on timeout.
    pub async fn await_count(&self, count: usize, timeout: Duration) -> bool {
        let mut rx = self.progress.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|p| p.items >= count)).await;
        matches!(waited, Ok(Ok(_)))
    }

    pub fn assert_complete(&self) {
        assert_eq!(self.completions(), 1, "expected exactly one completion");
        self.assert_no_errors();
    }

    pub fn assert_no_errors(&self) {
        let errors = self.errors();
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        assert_eq!(self.protocol_violations(), 0, "protocol violated");
    }

    pub fn assert_not_terminated(&self) {
        assert!(!self.is_terminated(), "unexpected terminal signal");
    }

    /// Assert a single error matching `predicate` and no completion.
    pub fn assert_error<P: Fn(&Error) -> bool>(&self, predicate: P) {
        let errors = self.errors();
        assert_eq!(errors.len(), 1, "expected exactly one error, got {:?}", errors);
        assert!(predicate(&errors[0]), "unexpected error: {}", errors[0]);
        assert_eq!(self.completions(), 0, "completed as well as failed");
        assert_eq!(self.protocol_violations(), 0, "protocol violated");
    }

    fn record(&self, item: T) {
        if self.is_terminated() {
            self.violations.fetch_add(1, Ordering::AcqRel);
        }
        let items = {
            let mut values = self.values.lock();
            values.push(item);
            values.len()
        };
        self.progress.send_modify(|p| p.items = items);
    }

    fn terminate(&self) -> bool {
        let mut first = false;
        self.progress.send_modify(|p| {
            first = !p.terminated;
            p.terminated = true;
        });
        if !first {
            self.violations.fetch_add(1, Ordering::AcqRel);
        }
        first
    }

    fn drain_fused(&self, fused: &Arc<dyn FusionAware<T>>, sync: bool) {
        loop {
            match fused.poll() {
                Ok(Some(item)) => self.record(item),
                Ok(None) => {
                    if sync {
                        self.on_complete();
                    }
                    return;
                }
                Err(error) => {
                    fused.cancel();
                    self.on_error(error);
                    return;
                }
            }
        }
    }
}

impl<T: Send + Clone + 'static> TestSubscriber<T> {
    pub fn values(&self) -> Vec<T> {
        self.values.lock().clone()
    }
}

impl<T: Send + Clone + PartialEq + Debug + 'static> TestSubscriber<T> {
    pub fn assert_values(&self, expected: &[T]) {
        assert_eq!(self.values(), expected);
    }
}

impl<T: Send + 'static> Subscriber<T> for TestSubscriber<T> {
    fn on_subscribe(&self, subscription: Upstream<T>) {
        if self.upstream.set(subscription.clone()).is_err() {
            subscription.cancel();
            self.violations.fetch_add(1, Ordering::AcqRel);
            return;
        }
        if self.cancelled.load(Ordering::Acquire) {
            subscription.cancel();
            return;
        }

        if !self.fusion_request.is_none() {
            if let Some(fused) = subscription.as_fusable() {
                let granted = fused.request_fusion(self.fusion_request);
                self.fusion_granted.store(mode_to_u8(granted), Ordering::Release);
                if granted == FusionMode::SYNC {
                    self.drain_fused(fused, true);
                    return;
                }
            }
        }

        if self.initial_request > 0 {
            subscription.request(self.initial_request);
        }
    }

    fn on_next(&self, item: T) {
        self.record(item);
    }

    fn on_error(&self, error: Error) {
        self.errors.lock().push(error);
        self.terminate();
    }

    fn on_complete(&self) {
        self.completions.fetch_add(1, Ordering::AcqRel);
        self.terminate();
    }

    fn on_available(&self) {
        if let Some(fused) = self.upstream.get().and_then(Upstream::as_fusable) {
            self.drain_fused(fused, false);
        }
    }
}
