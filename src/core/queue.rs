//! Handoff queues moving items from producer threads to the drain loop.

use crossbeam_queue::{ArrayQueue, SegQueue};

use crate::error::{Error, Result};

/// FIFO queue between the producing side of a stage and its drain loop.
///
/// Offers may come from any thread; polling is done by whichever thread currently
/// owns the drain loop, so implementations never see two concurrent consumers.
pub trait HandoffQueue<T>: Send + Sync {
    /// Enqueue without blocking. A full bounded queue fails with
    /// [`Error::MissingBackpressure`] and drops the item.
    fn offer(&self, item: T) -> Result<()>;

    fn poll(&self) -> Option<T>;

    fn is_empty(&self) -> bool;

    fn len(&self) -> usize;

    fn clear(&self) {
        while self.poll().is_some() {}
    }
}

/// Fixed-capacity ring queue.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    queue: ArrayQueue<T>,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl<T: Send> HandoffQueue<T> for BoundedQueue<T> {
    fn offer(&self, item: T) -> Result<()> {
        self.queue.push(item).map_err(|_| {
            #[cfg(feature = "metrics")]
            metrics::counter!("fluxweld_queue_overflows_total").increment(1);
            Error::missing_backpressure(format!(
                "queue is full (capacity {})",
                self.queue.capacity()
            ))
        })
    }

    fn poll(&self) -> Option<T> {
        self.queue.pop()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Unbounded queue growing in linked segments.
#[derive(Debug)]
pub struct LinkedQueue<T> {
    queue: SegQueue<T>,
}

impl<T> LinkedQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }
}

impl<T> Default for LinkedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> HandoffQueue<T> for LinkedQueue<T> {
    fn offer(&self, item: T) -> Result<()> {
        self.queue.push(item);
        Ok(())
    }

    fn poll(&self) -> Option<T> {
        self.queue.pop()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn preserves_insertion_order() {
        let queue = LinkedQueue::new();
        for i in 0..5 {
            queue.offer(i).unwrap();
        }
        let drained: Vec<i32> = std::iter::from_fn(|| queue.poll()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn bounded_overflow_is_missing_backpressure() {
        let queue = BoundedQueue::new(2);
        queue.offer(1).unwrap();
        queue.offer(2).unwrap();
        assert!(queue.offer(3).unwrap_err().is_missing_backpressure());

        queue.clear();
        assert_eq!(queue.len(), 0);
        queue.offer(4).unwrap();
        assert_eq!(queue.poll(), Some(4));
    }

    #[test]
    fn concurrent_offers_into_capacity_one() {
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
            let results: Vec<Result<()>> =
                handles.into_iter().map(|h| h.join().unwrap()).collect();

            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
            let failure = results.into_iter().find_map(|r| r.err()).unwrap();
            assert!(failure.is_missing_backpressure());
            assert_eq!(queue.len(), 1);
        }
    }
}
