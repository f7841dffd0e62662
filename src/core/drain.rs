//! Serialized drain loops.
//!
//! Every stateful stage funnels its work (new items, more demand, terminal signals,
//! cancellation) through a work-in-progress counter. Whoever moves the counter from
//! zero becomes the drainer; everyone else just increments and leaves, and the
//! drainer is guaranteed to notice them: at the end of each pass it subtracts what it
//! has seen, and loops again unless that brings the counter back to zero.
//!
//! A pass that returns [`ControlFlow::Break`] ends the loop without releasing the
//! counter, which parks the stage permanently. Stages do this after their terminal
//! signal or on cancellation.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Explicit work-in-progress counter.
#[derive(Debug, Default)]
pub struct WorkInProgress {
    wip: AtomicUsize,
}

impl WorkInProgress {
    pub const fn new() -> Self {
        Self {
            wip: AtomicUsize::new(0),
        }
    }

    /// Register new work. `true` means the caller became the drainer.
    pub fn enter(&self) -> bool {
        self.wip.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Subtract `missed` and return what other contributors added meanwhile.
    pub fn leave(&self, missed: usize) -> usize {
        self.wip.fetch_sub(missed, Ordering::AcqRel) - missed
    }

    pub fn is_idle(&self) -> bool {
        self.wip.load(Ordering::Acquire) == 0
    }

    /// Register work and, if elected, run `pass` until no contribution is pending.
    pub fn drain<F>(&self, pass: F)
    where
        F: FnMut() -> ControlFlow<()>,
    {
        if self.enter() {
            self.run_entered(pass);
        }
    }

    /// The loop part of [`drain`](Self::drain), for a caller that already won
    /// [`enter`](Self::enter), possibly on another thread.
    pub fn run_entered<F>(&self, mut pass: F)
    where
        F: FnMut() -> ControlFlow<()>,
    {
        let mut missed = 1;
        loop {
            if pass().is_break() {
                return;
            }
            missed = self.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }
}

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

/// Proof that the holder won the drain role of one [`Serialized`] cell.
///
/// Tickets can be moved to another thread, which is how a stage hands its drain to
/// a scheduler worker.
#[must_use = "dropping a ticket parks the drain loop forever"]
pub struct DrainTicket {
    owner: u64,
}

impl fmt::Debug for DrainTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainTicket").field("owner", &self.owner).finish()
    }
}

/// State that only the current drainer may touch, paired with its counter.
///
/// The only way to reach the state is through a pass closure run by the elected
/// drainer, so no lock is needed: the counter is the mutual exclusion.
pub struct Serialized<S> {
    id: u64,
    wip: WorkInProgress,
    state: UnsafeCell<S>,
}

// SAFETY: `state` is only ever accessed by the single thread holding the drain role
// (see `run`), so sharing the cell is sound whenever the state itself may move
// between threads.
unsafe impl<S: Send> Sync for Serialized<S> {}

impl<S> Serialized<S> {
    pub fn new(state: S) -> Self {
        Self {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            wip: WorkInProgress::new(),
            state: UnsafeCell::new(state),
        }
    }

    /// Register work; returns a ticket when the caller must run the loop.
    pub fn enter(&self) -> Option<DrainTicket> {
        self.wip.enter().then_some(DrainTicket { owner: self.id })
    }

    /// Register work and drain inline if elected.
    pub fn drain<F>(&self, pass: F)
    where
        F: FnMut(&mut S) -> ControlFlow<()>,
    {
        if let Some(ticket) = self.enter() {
            self.run(ticket, pass);
        }
    }

    /// Run the drain loop with a ticket obtained from [`enter`](Self::enter).
    ///
    /// # Panics
    ///
    /// When the ticket belongs to another cell.
    pub fn run<F>(&self, ticket: DrainTicket, mut pass: F)
    where
        F: FnMut(&mut S) -> ControlFlow<()>,
    {
        assert_eq!(ticket.owner, self.id, "drain ticket used on a foreign drain loop");
        let mut missed = 1;
        loop {
            // SAFETY: the ticket proves the 0 -> 1 transition of `wip` was won for
            // this cell, and `wip` stays non-zero until the `leave` below, so no other
            // thread can be inside this loop. Re-entrant `drain` calls from `pass`
            // only increment the counter.
            let state = unsafe { &mut *self.state.get() };
            if pass(state).is_break() {
                return;
            }
            missed = self.wip.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.state.get_mut()
    }

    pub fn into_inner(self) -> S {
        self.state.into_inner()
    }
}

impl<S> fmt::Debug for Serialized<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serialized")
            .field("id", &self.id)
            .field("idle", &self.wip.is_idle())
            .finish()
    }
}
