//! Releasable reference to the consumer of a producer.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::core::traits::Subscriber;

/// The subscriber a producer emits to.
///
/// A subscriber usually keeps its upstream subscription alive, and the upstream keeps
/// its subscriber, so producers drop their side of the link once they are done:
/// whoever [`release`](Self::release)s the reference emits the terminal signal, and
/// emission sites fetch it with [`get`](Self::get) once per drain pass.
///
/// The slot is an atomic pointer swap; neither `get` nor `release` blocks.
pub struct Downstream<T> {
    slot: ArcSwapOption<Arc<dyn Subscriber<T>>>,
}

impl<T> Downstream<T> {
    pub fn new(subscriber: Arc<dyn Subscriber<T>>) -> Self {
        Self {
            slot: ArcSwapOption::from_pointee(subscriber),
        }
    }

    /// A holder whose subscriber arrives later through [`set`](Self::set).
    pub fn empty() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
        }
    }

    pub fn set(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.slot.store(Some(Arc::new(subscriber)));
    }

    pub fn get(&self) -> Option<Arc<dyn Subscriber<T>>> {
        self.slot.load_full().map(|held| Arc::clone(&*held))
    }

    /// Take the subscriber out; only the first caller gets it.
    pub fn release(&self) -> Option<Arc<dyn Subscriber<T>>> {
        self.slot.swap(None).map(|held| Arc::clone(&*held))
    }

    pub fn is_released(&self) -> bool {
        self.slot.load().is_none()
    }
}

impl<T> fmt::Debug for Downstream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Downstream")
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::TestSubscriber;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn release_hands_out_the_subscriber_once() {
        let ts = TestSubscriber::<i32>::new();
        let downstream = Downstream::<i32>::new(ts.clone());
        assert!(downstream.get().is_some());

        assert!(downstream.release().is_some());
        assert!(downstream.release().is_none());
        assert!(downstream.get().is_none());
        assert!(downstream.is_released());
    }

    #[test]
    fn released_subscriber_is_no_longer_kept_alive() {
        let ts = TestSubscriber::<i32>::new();
        let weak = Arc::downgrade(&ts);
        let downstream = Downstream::<i32>::new(ts);

        drop(downstream.release());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn concurrent_release_has_one_winner() {
        for _ in 0..50 {
            let downstream = Arc::new(Downstream::<i32>::new(TestSubscriber::<i32>::new()));
            let barrier = Arc::new(Barrier::new(4));
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let downstream = downstream.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        downstream.get();
                        downstream.release().is_some()
                    })
                })
                .collect();
            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);
        }
    }
}
