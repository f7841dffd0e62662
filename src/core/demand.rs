//! Outstanding-demand tracking.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, ProtocolViolation};

/// Sentinel for "no limit"; once reached, demand is never decremented again.
pub const UNBOUNDED: u64 = u64::MAX;

/// Atomic, saturating counter of items a consumer has requested but not yet received.
///
/// `request` and `produced` may run concurrently on different threads; both are CAS
/// retry loops so their effects commute.
#[derive(Debug, Default)]
pub struct Demand {
    requested: AtomicU64,
}

impl Demand {
    pub const fn new() -> Self {
        Self {
            requested: AtomicU64::new(0),
        }
    }

    pub fn get(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    pub fn is_unbounded(&self) -> bool {
        self.get() == UNBOUNDED
    }

    /// Add `n` to the outstanding demand, saturating at [`UNBOUNDED`].
    ///
    /// Returns the demand before the addition, so `0` tells the caller it moved the
    /// tracker out of the idle state.
    pub fn add(&self, n: u64) -> u64 {
        let mut current = self.requested.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return UNBOUNDED;
            }
            let next = current.saturating_add(n);
            match self.requested.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => return previous,
                Err(actual) => current = actual,
            }
        }
    }

    /// Subtract `n` delivered items, never going below zero.
    ///
    /// Returns the demand after the subtraction.
    pub fn produced(&self, n: u64) -> u64 {
        let mut current = self.requested.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return UNBOUNDED;
            }
            let next = current.saturating_sub(n);
            match self.requested.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Check a `request(n)` amount.
pub fn validate(n: u64) -> Result<u64, Error> {
    if n == 0 {
        tracing::warn!("request(0) is a protocol violation");
        return Err(ProtocolViolation::NonPositiveRequest(n).into());
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn request_then_produce_never_underflows() {
        let demand = Demand::new();
        assert_eq!(demand.add(3), 0);
        for expected in [2, 1, 0] {
            assert_eq!(demand.produced(1), expected);
        }
        assert_eq!(demand.produced(1), 0);
        assert_eq!(demand.get(), 0);
    }

    #[test]
    fn saturates_at_unbounded_and_stays() {
        let demand = Demand::new();
        demand.add(u64::MAX - 1);
        demand.add(5);
        assert!(demand.is_unbounded());
        assert_eq!(demand.produced(1_000), UNBOUNDED);
        assert_eq!(demand.add(1), UNBOUNDED);
    }

    #[test]
    fn zero_request_is_rejected() {
        let err = validate(0).unwrap_err();
        assert!(err.is_protocol_violation());
        assert_eq!(validate(4).unwrap(), 4);
    }

    #[test]
    fn concurrent_request_and_produce_commute() {
        let demand = Arc::new(Demand::new());
        demand.add(40_000);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let demand = demand.clone();
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        if i % 2 == 0 {
                            demand.add(1);
                        } else {
                            demand.produced(1);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(demand.get(), 40_000);
    }
}
