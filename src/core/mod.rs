//! Core protocol traits and the concurrency substrate every stage is built on.
//!
//! - [`demand`]: atomic saturating demand tracking
//! - [`error_slot`]: terminal error aggregation
//! - [`queue`]: handoff queues
//! - [`drain`]: serialized drain loops
//! - [`fusion`]: fusion negotiation
//! - [`cancel`], [`deferred`]: cancellation and single-value helpers

pub mod cancel;
pub mod deferred;
pub mod demand;
pub mod downstream;
pub mod drain;
pub mod error_slot;
pub mod fusion;
pub mod queue;
pub mod traits;

// Re-export core items
pub use cancel::{CancelKey, CompositeCancellable, EmptySubscription, SubscriptionSlot};
pub use deferred::ScalarDeferred;
pub use downstream::Downstream;
pub use demand::{Demand, UNBOUNDED};
pub use drain::{DrainTicket, Serialized, WorkInProgress};
pub use error_slot::ErrorSlot;
pub use fusion::FusionMode;
pub use queue::{BoundedQueue, HandoffQueue, LinkedQueue};
pub use traits::{
    try_emit, Cancellable, ConditionalEmit, FusionAware, Publisher, Subscriber, Subscription,
    Upstream,
};
