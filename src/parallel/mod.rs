//! Flows split into independent rails.
//!
//! A [`ParallelFlowable`] is a fixed set of rails, each an ordinary [`Flowable`],
//! typically running on its own worker. Rails are joined back into one flow by
//! operators such as [`reduce`](ParallelFlowable::reduce).

pub mod reduce;
mod slot_pair;

use std::sync::Arc;

use crate::error::Result;
use crate::flowable::Flowable;

pub use reduce::{ReducePublisher, Reducer};

/// A fixed number of rails processed independently.
///
/// # Example
///
/// ```rust
/// use fluxweld::prelude::*;
///
/// let ts = TestSubscriber::<i64>::new();
/// ParallelFlowable::from_rails(vec![Flowable::range(1, 50), Flowable::range(51, 50)])
///     .reduce(|a, b| a + b)
///     .subscribe(ts.clone());
///
/// ts.assert_values(&[5050]);
/// ```
pub struct ParallelFlowable<T> {
    rails: Vec<Flowable<T>>,
}

impl<T: Send + 'static> ParallelFlowable<T> {
    pub fn from_rails(rails: Vec<Flowable<T>>) -> Self {
        Self { rails }
    }

    /// Number of rails.
    pub fn parallelism(&self) -> usize {
        self.rails.len()
    }

    /// Reduce all items of all rails into one value, emitted once requested.
    /// Completes empty when no rail produced anything.
    pub fn reduce<F>(self, reducer: F) -> Flowable<T>
    where
        F: Fn(T, T) -> T + Send + Sync + 'static,
    {
        self.try_reduce(move |a, b| Ok(reducer(a, b)))
    }

    /// Like [`reduce`](Self::reduce); an `Err` cancels every rail and fails the flow.
    pub fn try_reduce<F>(self, reducer: F) -> Flowable<T>
    where
        F: Fn(T, T) -> Result<T> + Send + Sync + 'static,
    {
        Flowable::from_publisher(ReducePublisher::new(self.rails, Arc::new(reducer)))
    }
}

impl<T> Clone for ParallelFlowable<T> {
    fn clone(&self) -> Self {
        Self {
            rails: self.rails.clone(),
        }
    }
}
