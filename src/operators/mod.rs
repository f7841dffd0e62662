//! Intermediate stages.
//!
//! Each operator is a [`Publisher`](crate::core::Publisher) wrapping its source
//! [`Flowable`](crate::Flowable); subscribing creates the per-subscription stage that
//! sits between the source and the subscriber.

pub mod filter;
pub mod group_join;
pub mod map;
pub mod observe_on;

pub use filter::{FilterPublisher, Predicate};
pub use group_join::{EndFactory, GroupJoinPublisher, ResultSelector};
pub use map::{MapPublisher, Mapper};
pub use observe_on::ObserveOnPublisher;
