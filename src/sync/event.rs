//! Manual-reset event for OS-level blocking on cancellation.
//!
//! Spin loops are the crate's default waiting strategy; [`ResetEvent`] is
//! the escape hatch for callers that want a true blocking wait (the analog
//! of a kernel waitable handle). A cancellation source creates one lazily
//! and sets it when cancellation is requested.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A manually reset, waitable boolean event.
///
/// Once [`set`](ResetEvent::set), the event stays signaled — releasing all
/// current and future waiters — until [`reset`](ResetEvent::reset).
#[derive(Debug, Default)]
pub struct ResetEvent {
    signaled: Mutex<bool>,
    wakeup: Condvar,
}

impl ResetEvent {
    /// Creates an event, optionally born signaled.
    #[must_use]
    pub fn new(signaled: bool) -> Self {
        Self {
            signaled: Mutex::new(signaled),
            wakeup: Condvar::new(),
        }
    }

    /// Whether the event is currently signaled.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.lock_state()
    }

    /// Signals the event, waking every waiter.
    pub fn set(&self) {
        let mut signaled = self.lock_state();
        if !*signaled {
            *signaled = true;
            self.wakeup.notify_all();
        }
    }

    /// Returns the event to the unsignaled state.
    pub fn reset(&self) {
        *self.lock_state() = false;
    }

    /// Blocks the calling thread until the event is signaled.
    pub fn wait(&self) {
        let mut signaled = self.lock_state();
        while !*signaled {
            signaled = match self.wakeup.wait(signaled) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Blocks until the event is signaled or `timeout` elapses.
    ///
    /// Returns whether the event was signaled. Spurious wakeups re-derive
    /// the remaining wait from the original deadline.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut signaled = self.lock_state();
        loop {
            if *signaled {
                return true;
            }
            let remaining = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) if !remaining.is_zero() => remaining,
                    _ => return false,
                },
                // Deadline beyond Instant range: effectively unbounded.
                None => Duration::from_secs(3600),
            };
            signaled = match self.wakeup.wait_timeout(signaled, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, bool> {
        match self.signaled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
