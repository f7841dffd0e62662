//! Lock-free pairing of values reported by concurrently finishing rails.
//!
//! A value is offered into the current [`SlotPair`]. The first two offers to a pair
//! claim its two slots; whoever completes the pair takes both values out, combines
//! them and offers the result again. With `n` rails at most `2n - 1` offers are
//! ever made, so an arena of `n` pairs used front to back is never exhausted and no
//! pair is reused while another thread may still be writing into it.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) struct SlotPair<T> {
    slots: [UnsafeCell<Option<T>>; 2],
    /// Slots handed out so far: 0, 1 or 2 (full).
    claimed: AtomicUsize,
    /// Slots written so far.
    filled: AtomicUsize,
}

// SAFETY: each slot is written by the one thread that claimed it, and read only by
// the thread whose `filled` increment completed the pair (or, for the last lone
// value, after every writer has finished). The atomics order those accesses.
unsafe impl<T: Send> Sync for SlotPair<T> {}

impl<T> SlotPair<T> {
    fn new() -> Self {
        Self {
            slots: [UnsafeCell::new(None), UnsafeCell::new(None)],
            claimed: AtomicUsize::new(0),
            filled: AtomicUsize::new(0),
        }
    }

    fn try_claim(&self) -> Option<usize> {
        let mut claimed = self.claimed.load(Ordering::Acquire);
        loop {
            if claimed >= 2 {
                return None;
            }
            match self.claimed.compare_exchange_weak(
                claimed,
                claimed + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(claimed),
                Err(actual) => claimed = actual,
            }
        }
    }

    /// Write the claimed slot; `true` when this write completed the pair.
    ///
    /// # Safety
    ///
    /// `index` must have been returned by `try_claim` on this pair to the caller.
    unsafe fn fill(&self, index: usize, value: T) -> bool {
        *self.slots[index].get() = Some(value);
        self.filled.fetch_add(1, Ordering::AcqRel) + 1 == 2
    }

    /// # Safety
    ///
    /// Only the caller whose `fill` returned `true` may take the pair.
    unsafe fn take_both(&self) -> Option<(T, T)> {
        let first = (*self.slots[0].get()).take()?;
        let second = (*self.slots[1].get()).take()?;
        Some((first, second))
    }
}

/// Outcome of offering a value to the arena.
pub(crate) enum Offer<T> {
    /// The value sits in a slot waiting for a partner.
    Parked,
    /// The value completed a pair; both values now belong to the caller.
    Paired(T, T),
}

pub(crate) struct PairArena<T> {
    pairs: Box<[SlotPair<T>]>,
    cursor: AtomicUsize,
}

impl<T> PairArena<T> {
    /// An arena for `rails` concurrently reporting rails.
    pub(crate) fn new(rails: usize) -> Self {
        Self {
            pairs: (0..rails.max(1)).map(|_| SlotPair::new()).collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub(crate) fn offer(&self, value: T) -> Offer<T> {
        loop {
            let index = self.cursor.load(Ordering::Acquire);
            let pair = &self.pairs[index];
            let Some(slot) = pair.try_claim() else {
                // full: move on to the next pair, unless someone already did
                let _ = self.cursor.compare_exchange(
                    index,
                    index + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            };
            if slot == 1 {
                let _ = self.cursor.compare_exchange(
                    index,
                    index + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }

            // SAFETY: `slot` was claimed by this call.
            if !unsafe { pair.fill(slot, value) } {
                return Offer::Parked;
            }
            // SAFETY: our write completed the pair, nobody else touches it again.
            return match unsafe { pair.take_both() } {
                Some((first, second)) => Offer::Paired(first, second),
                None => Offer::Parked,
            };
        }
    }

    /// The value left over once every offer has returned.
    ///
    /// # Safety
    ///
    /// No `offer` may be running or start afterwards.
    pub(crate) unsafe fn take_result(&self) -> Option<T> {
        let index = self.cursor.load(Ordering::Acquire);
        let pair = self.pairs.get(index)?;
        if pair.claimed.load(Ordering::Acquire) != 1 {
            return None;
        }
        (*pair.slots[0].get()).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Offer every value, combining pairs until each caller is parked.
    fn report(arena: &PairArena<u64>, mut value: u64) {
        while let Offer::Paired(a, b) = arena.offer(value) {
            value = a + b;
        }
    }

    #[test]
    fn lone_value_is_the_result() {
        let arena = PairArena::new(1);
        assert!(matches!(arena.offer(7), Offer::Parked));
        assert_eq!(unsafe { arena.take_result() }, Some(7));
    }

    #[test]
    fn second_offer_completes_the_pair() {
        let arena = PairArena::new(2);
        assert!(matches!(arena.offer(4), Offer::Parked));
        match arena.offer(5) {
            Offer::Paired(a, b) => {
                assert_eq!(a + b, 9);
                assert!(matches!(arena.offer(a + b), Offer::Parked));
            }
            Offer::Parked => panic!("pair not completed"),
        }
        assert_eq!(unsafe { arena.take_result() }, Some(9));
    }

    #[test]
    fn empty_arena_has_no_result() {
        let arena = PairArena::<u64>::new(3);
        assert_eq!(unsafe { arena.take_result() }, None);
    }

    #[test]
    fn concurrent_reports_reduce_to_the_full_sum() {
        for _ in 0..200 {
            let rails = 8u64;
            let arena = Arc::new(PairArena::new(rails as usize));
            std::thread::scope(|scope| {
                for rail in 1..=rails {
                    let arena = arena.clone();
                    scope.spawn(move || report(&arena, rail));
                }
            });
            assert_eq!(unsafe { arena.take_result() }, Some(rails * (rails + 1) / 2));
        }
    }
}
