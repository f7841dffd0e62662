//! Single-value emission that waits for both the value and the request.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::Context;
use crate::core::downstream::Downstream;
use crate::core::traits::Subscriber;
use crate::error::Error;

const NO_REQUEST_NO_VALUE: u8 = 0;
const NO_REQUEST_HAS_VALUE: u8 = 1;
const HAS_REQUEST_NO_VALUE: u8 = 2;
const HAS_REQUEST_HAS_VALUE: u8 = 3;
const TERMINATED: u8 = 4;

/// Delivers at most one value followed by completion, once it has been both
/// produced and requested, whichever happens last.
///
/// The value slot is touched once per subscription, so a plain lock guards it; the
/// consumer reference is dropped with the terminal signal.
pub struct ScalarDeferred<T> {
    state: AtomicU8,
    value: Mutex<Option<T>>,
    downstream: Downstream<T>,
    ctx: Context,
}

impl<T> ScalarDeferred<T> {
    pub fn new(downstream: Arc<dyn Subscriber<T>>, ctx: Context) -> Self {
        Self {
            state: AtomicU8::new(NO_REQUEST_NO_VALUE),
            value: Mutex::new(None),
            downstream: Downstream::new(downstream),
            ctx,
        }
    }

    /// Record the value; emits immediately if a request is already pending.
    /// Only the first value counts.
    pub fn complete(&self, value: T) {
        {
            let mut slot = self.value.lock();
            let state = self.state.load(Ordering::Acquire);
            if slot.is_some() || (state != NO_REQUEST_NO_VALUE && state != HAS_REQUEST_NO_VALUE)
            {
                return;
            }
            *slot = Some(value);
        }
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let next = match state {
                NO_REQUEST_NO_VALUE => NO_REQUEST_HAS_VALUE,
                HAS_REQUEST_NO_VALUE => HAS_REQUEST_HAS_VALUE,
                _ => {
                    // terminated while the value was being stored
                    self.value.lock().take();
                    return;
                }
            };
            match self
                .state
                .compare_exchange(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) if next == HAS_REQUEST_HAS_VALUE => return self.emit(),
                Ok(_) => return,
                Err(actual) => state = actual,
            }
        }
    }

    /// Complete without a value.
    pub fn complete_empty(&self) {
        let mut state = self.state.load(Ordering::Acquire);
        while state == NO_REQUEST_NO_VALUE || state == HAS_REQUEST_NO_VALUE {
            match self
                .state
                .compare_exchange(state, TERMINATED, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if let Some(downstream) = self.downstream.release() {
                        downstream.on_complete();
                    }
                    return;
                }
                Err(actual) => state = actual,
            }
        }
    }

    /// Register a (validated) request; emits if the value is already there.
    pub fn request(&self) {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let next = match state {
                NO_REQUEST_NO_VALUE => HAS_REQUEST_NO_VALUE,
                NO_REQUEST_HAS_VALUE => HAS_REQUEST_HAS_VALUE,
                _ => return,
            };
            match self
                .state
                .compare_exchange(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) if next == HAS_REQUEST_HAS_VALUE => return self.emit(),
                Ok(_) => return,
                Err(actual) => state = actual,
            }
        }
    }

    /// Terminate with an error unless a terminal signal is already under way.
    /// Returns whether the error was delivered.
    pub fn error(&self, error: Error) -> bool {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            if state == HAS_REQUEST_HAS_VALUE || state == TERMINATED {
                self.ctx.on_undeliverable(error);
                return false;
            }
            match self
                .state
                .compare_exchange(state, TERMINATED, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.value.lock().take();
                    match self.downstream.release() {
                        Some(downstream) => downstream.on_error(error),
                        None => self.ctx.on_undeliverable(error),
                    }
                    return true;
                }
                Err(actual) => state = actual,
            }
        }
    }

    pub fn cancel(&self) {
        self.state.store(TERMINATED, Ordering::Release);
        self.value.lock().take();
        self.downstream.release();
    }

    pub fn is_terminated(&self) -> bool {
        self.state.load(Ordering::Acquire) == TERMINATED
    }

    fn emit(&self) {
        let value = self.value.lock().take();
        let Some(value) = value else {
            return;
        };
        if let Some(downstream) = self.downstream.release() {
            downstream.on_next(value);
            if self.state.load(Ordering::Acquire) != TERMINATED {
                downstream.on_complete();
            }
        }
    }
}
