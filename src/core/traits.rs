//! Core traits of the push-pull subscription protocol.
//!
//! The protocol follows the Reactive Streams contract: a [`Publisher`] hands each
//! [`Subscriber`] a subscription through `on_subscribe`, the subscriber grants demand
//! with [`Subscription::request`], and the publisher emits at most that many items
//! followed by exactly one terminal signal.
//!
//! Operator capabilities are small traits composed per stage rather than a base
//! class hierarchy:
//!
//! - [`Cancellable`]: anything holding resources that can be released once.
//! - [`FusionAware`]: an upstream willing to share its queue with the consumer.
//! - [`ConditionalEmit`]: a consumer that reports whether an item used up demand.

use std::fmt;
use std::sync::Arc;

use crate::context::Context;
use crate::core::fusion::FusionMode;
use crate::error::Result;
use crate::Error;

/// A resource that can be cancelled; cancelling twice is a no-op.
pub trait Cancellable: Send + Sync {
    fn cancel(&self);

    fn is_cancelled(&self) -> bool;
}

/// The link between one publisher and one subscriber.
pub trait Subscription: Cancellable {
    /// Grant `n` more items. `n == 0` is a protocol violation that terminates the
    /// subscription with an error.
    fn request(&self, n: u64);
}

/// An upstream that lets its consumer poll items directly.
///
/// Once [`request_fusion`](FusionAware::request_fusion) grants a mode other than
/// [`FusionMode::NONE`], the consumer must stop expecting items through `on_next`:
///
/// - `SYNC`: every item is already available. The consumer polls until `None`, which
///   means completion, and never calls `request`.
/// - `ASYNC`: the producer keeps calling [`Subscriber::on_available`] and terminal
///   signals as usual; the consumer polls after each signal and still requests.
pub trait FusionAware<T>: Subscription {
    fn request_fusion(&self, mode: FusionMode) -> FusionMode;

    /// Take the next item. `Ok(None)` means nothing is available right now.
    fn poll(&self) -> Result<Option<T>>;

    fn is_empty(&self) -> bool;

    fn clear(&self);
}

/// A consumer of a sequence of `T`.
///
/// Signals for one subscription never overlap, but they may arrive on different
/// threads, hence `&self` receivers.
pub trait Subscriber<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Upstream<T>);

    fn on_next(&self, item: T);

    fn on_error(&self, error: Error);

    fn on_complete(&self);

    /// Called instead of `on_next` once ASYNC fusion was granted: an item can be
    /// polled from the upstream.
    fn on_available(&self) {}

    /// Expose the conditional-emission capability, if this consumer has one.
    fn as_conditional(&self) -> Option<&dyn ConditionalEmit<T>> {
        None
    }
}

/// A consumer that may reject items without consuming demand (filters).
pub trait ConditionalEmit<T>: Subscriber<T> {
    /// Offer an item; `false` means it was dropped and the producer may emit
    /// another one against the same demand.
    fn try_on_next(&self, item: T) -> bool;
}

/// Emit through the conditional path when the consumer supports it.
pub fn try_emit<T>(subscriber: &dyn Subscriber<T>, item: T) -> bool {
    match subscriber.as_conditional() {
        Some(conditional) => conditional.try_on_next(item),
        None => {
            subscriber.on_next(item);
            true
        }
    }
}

/// A source of a sequence of `T`.
pub trait Publisher<T>: Send + Sync {
    /// Attach `subscriber`. Every stage created by this call shares `ctx`.
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>, ctx: &Context);
}

/// The subscription handed to `on_subscribe`, with or without fusion support.
pub enum Upstream<T> {
    Plain(Arc<dyn Subscription>),
    Fusable(Arc<dyn FusionAware<T>>),
}

impl<T> Upstream<T> {
    pub fn plain<S: Subscription + 'static>(subscription: Arc<S>) -> Self {
        Upstream::Plain(subscription)
    }

    pub fn fusable<S: FusionAware<T> + 'static>(subscription: Arc<S>) -> Self {
        Upstream::Fusable(subscription)
    }

    /// The fusion capability, when the upstream offers one.
    pub fn as_fusable(&self) -> Option<&Arc<dyn FusionAware<T>>> {
        match self {
            Upstream::Plain(_) => None,
            Upstream::Fusable(fusable) => Some(fusable),
        }
    }

    pub fn request(&self, n: u64) {
        match self {
            Upstream::Plain(s) => s.request(n),
            Upstream::Fusable(s) => s.request(n),
        }
    }

    pub fn cancel(&self) {
        match self {
            Upstream::Plain(s) => s.cancel(),
            Upstream::Fusable(s) => s.cancel(),
        }
    }
}

impl<T> Clone for Upstream<T> {
    fn clone(&self) -> Self {
        match self {
            Upstream::Plain(s) => Upstream::Plain(Arc::clone(s)),
            Upstream::Fusable(s) => Upstream::Fusable(Arc::clone(s)),
        }
    }
}

impl<T: 'static> Cancellable for Upstream<T> {
    fn cancel(&self) {
        Upstream::cancel(self)
    }

    fn is_cancelled(&self) -> bool {
        match self {
            Upstream::Plain(s) => s.is_cancelled(),
            Upstream::Fusable(s) => s.is_cancelled(),
        }
    }
}

impl<T: 'static> Subscription for Upstream<T> {
    fn request(&self, n: u64) {
        Upstream::request(self, n)
    }
}

impl<T> fmt::Debug for Upstream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Upstream::Plain(_) => write!(f, "Upstream::Plain(..)"),
            Upstream::Fusable(_) => write!(f, "Upstream::Fusable(..)"),
        }
    }
}
