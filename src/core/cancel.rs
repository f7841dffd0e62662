//! Cancellation helpers: the set-once upstream holder and the composite container.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::Context;
use crate::core::traits::{Cancellable, Subscription};
use crate::error::ProtocolViolation;

enum SlotState {
    Empty,
    Set(Arc<dyn Subscription>),
    Cancelled,
}

/// Holds the upstream subscription of a subscriber that may be cancelled before,
/// during or after `on_subscribe`.
///
/// A subscription arriving after cancellation is cancelled on the spot; a second
/// subscription is cancelled and reported as a protocol violation.
pub struct SubscriptionSlot {
    state: Mutex<SlotState>,
    cancelled: AtomicBool,
}

impl SubscriptionSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Empty),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Store the upstream. Returns `false` if it was rejected (and cancelled).
    pub fn set_once(&self, subscription: Arc<dyn Subscription>, ctx: &Context) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Empty) {
            *state = SlotState::Set(subscription);
            return true;
        }
        let duplicate = matches!(*state, SlotState::Set(_));
        drop(state);

        subscription.cancel();
        if duplicate {
            ctx.on_undeliverable(ProtocolViolation::DuplicateSubscription.into());
        }
        false
    }

    pub fn request(&self, n: u64) {
        let current = match &*self.state.lock() {
            SlotState::Set(s) => Some(s.clone()),
            _ => None,
        };
        if let Some(subscription) = current {
            subscription.request(n);
        }
    }

    /// Cancel the upstream. Returns `true` for the call that actually cancelled.
    pub fn cancel_once(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let previous = std::mem::replace(&mut *self.state.lock(), SlotState::Cancelled);
        if let SlotState::Set(subscription) = previous {
            subscription.cancel();
        }
        true
    }
}

impl Default for SubscriptionSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellable for SubscriptionSlot {
    fn cancel(&self) {
        self.cancel_once();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Subscription for SubscriptionSlot {
    fn request(&self, n: u64) {
        SubscriptionSlot::request(self, n)
    }
}

/// Subscription of a source that never looks at demand: it only remembers
/// whether it was cancelled.
#[derive(Debug, Default)]
pub struct EmptySubscription {
    cancelled: AtomicBool,
}

impl EmptySubscription {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Cancellable for EmptySubscription {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Subscription for EmptySubscription {
    fn request(&self, _n: u64) {}
}

/// Key of an entry in a [`CompositeCancellable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancelKey(u64);

/// A set of child resources cancelled together, exactly once.
///
/// Adding to and cancelling the set may race freely: a child added after the set
/// was cancelled is cancelled immediately.
pub struct CompositeCancellable {
    children: Mutex<Option<HashMap<CancelKey, Arc<dyn Cancellable>>>>,
    next_key: AtomicU64,
    cancelled: AtomicBool,
}

impl CompositeCancellable {
    pub fn new() -> Self {
        Self {
            children: Mutex::new(Some(HashMap::new())),
            next_key: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Add a child; `None` means the set was already cancelled and so is the child.
    pub fn add(&self, child: Arc<dyn Cancellable>) -> Option<CancelKey> {
        if !self.cancelled.load(Ordering::Acquire) {
            let mut guard = self.children.lock();
            if let Some(children) = guard.as_mut() {
                let key = CancelKey(self.next_key.fetch_add(1, Ordering::Relaxed));
                children.insert(key, child);
                return Some(key);
            }
        }
        child.cancel();
        None
    }

    /// Remove a child and cancel it.
    pub fn remove(&self, key: CancelKey) -> bool {
        match self.delete(key) {
            Some(child) => {
                child.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove a child without cancelling it.
    pub fn delete(&self, key: CancelKey) -> Option<Arc<dyn Cancellable>> {
        self.children.lock().as_mut().and_then(|c| c.remove(&key))
    }

    pub fn len(&self) -> usize {
        self.children.lock().as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CompositeCancellable {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellable for CompositeCancellable {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let children = self.children.lock().take();
        if let Some(children) = children {
            tracing::trace!(children = children.len(), "cancelling composite");
            for child in children.into_values() {
                child.cancel();
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
