//! # Reactive streams with demand-driven backpressure for Rust
//!
//! This crate provides the building blocks of a reactive-streams engine: publishers
//! that emit only what their subscribers requested, lock-free serialized drain loops
//! that let many threads feed one consumer, and operator fusion that lets adjacent
//! stages share a queue instead of handing items over one by one.
//!
//! ## Core Concepts
//!
//! - **Publisher**: Produces items for each subscriber that subscribes to it
//! - **Subscriber**: Receives `on_subscribe`, then items, then exactly one terminal signal
//! - **Subscription**: The link between the two; carries `request(n)` and `cancel()`
//! - **Flowable**: The fluent handle operators are chained on
//! - **Context**: Configuration and the undeliverable-error hook, passed at subscription
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use fluxweld::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::current());
//!     let ts = TestSubscriber::<i64>::new();
//!     Flowable::range(1, 100)
//!         .map(|x| x * 2)
//!         .observe_on(scheduler)
//!         .subscribe(ts.clone());
//!
//!     assert!(ts.await_terminal(std::time::Duration::from_secs(5)).await);
//!     assert_eq!(ts.value_count(), 100);
//! }
//! ```

pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod flowable;
pub mod operators;
pub mod parallel;
pub mod processors;
pub mod scheduler;
pub mod sinks;
pub mod sources;

// Re-export commonly used items
pub mod prelude {
    pub use crate::config::FlowConfig;
    pub use crate::context::Context;
    pub use crate::core::{
        Cancellable, ConditionalEmit, FusionAware, FusionMode, Publisher, Subscriber,
        Subscription, Upstream, UNBOUNDED,
    };
    pub use crate::error::{Error, ProtocolViolation, Result};
    pub use crate::flowable::Flowable;
    pub use crate::parallel::ParallelFlowable;
    pub use crate::processors::UnicastProcessor;
    pub use crate::scheduler::{Scheduler, TokioScheduler, Worker};
    pub use crate::sinks::TestSubscriber;
}

// Re-export main types
pub use context::Context;
pub use error::{Error, Result};
pub use flowable::Flowable;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
