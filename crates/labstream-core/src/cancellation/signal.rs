//! A cancellable condition: a value guarded by a mutex plus a condvar.

use crate::cancellation::registry::{lock_or_recover, Cancellable};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

/// How a [`WaitSlot::wait_until`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The predicate became true.
    Ready,
    /// The deadline passed first.
    TimedOut,
    /// The slot was cancelled first.
    Cancelled,
}

struct SlotState<T> {
    value: T,
    cancelled: bool,
}

/// Shared state that threads can wait on until it satisfies a predicate.
///
/// Cancelling the slot wakes every waiter; once cancelled, waits return
/// [`WaitOutcome::Cancelled`] unless the predicate already holds.
pub struct WaitSlot<T> {
    state: Mutex<SlotState<T>>,
    changed: Condvar,
}

impl<T> WaitSlot<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(SlotState {
                value,
                cancelled: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Mutates the value and wakes every waiter.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut lock_or_recover(&self.state, "wait slot").value);
        self.changed.notify_all();
        result
    }

    /// Reads the value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&lock_or_recover(&self.state, "wait slot").value)
    }

    pub fn is_cancelled(&self) -> bool {
        lock_or_recover(&self.state, "wait slot").cancelled
    }

    /// Clears a previous cancellation so the slot can be waited on again.
    pub fn reset(&self) {
        lock_or_recover(&self.state, "wait slot").cancelled = false;
    }

    /// Blocks until `ready` holds, `deadline` passes or the slot is cancelled.
    ///
    /// `None` waits without a deadline.
    pub fn wait_until(&self, deadline: Option<Instant>, mut ready: impl FnMut(&T) -> bool) -> WaitOutcome {
        let mut guard = lock_or_recover(&self.state, "wait slot");
        loop {
            if ready(&guard.value) {
                return WaitOutcome::Ready;
            }
            if guard.cancelled {
                return WaitOutcome::Cancelled;
            }
            match deadline {
                None => {
                    guard = self
                        .changed
                        .wait(guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    guard = self
                        .changed
                        .wait_timeout(guard, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0);
                }
            }
        }
    }
}

impl<T: Clone> WaitSlot<T> {
    pub fn get(&self) -> T {
        self.with(T::clone)
    }
}

impl<T: Send> Cancellable for WaitSlot<T> {
    fn cancel(&self) {
        lock_or_recover(&self.state, "wait slot").cancelled = true;
        self.changed.notify_all();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
