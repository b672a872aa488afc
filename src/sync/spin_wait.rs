//! Adaptive spin-wait with escalating backoff.
//!
//! [`SpinWait`] is the backoff engine used by every busy-wait loop in this
//! crate: a short CPU-bound spin first, then OS yields, then 1 ms sleeps, so
//! a waiter converges toward releasing its core instead of starving other
//! runnable work.
//!
//! # Escalation
//!
//! Each call to [`SpinWait::spin_once`] advances an internal counter:
//!
//! - Below [`YIELD_THRESHOLD`] on a multicore machine: a spin-loop-hint
//!   burst whose length doubles with the counter, capped at a small maximum.
//! - At or above the threshold (or always, on a single logical core, where
//!   spinning cannot make progress): yield to the scheduler, escalating to a
//!   1 ms sleep every [`SLEEP_EVERY`]th post-threshold spin.

use core::hint;
use std::num::NonZeroUsize;
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

/// Spin count at which `spin_once` stops burning cycles and starts yielding.
pub const YIELD_THRESHOLD: u32 = 10;

/// Every `SLEEP_EVERY`th spin past the yield threshold sleeps for 1 ms
/// instead of yielding, so long waits release the core outright.
const SLEEP_EVERY: u32 = 20;

/// Cap on the exponent of the spin-hint burst (`1 << MAX_SPIN_SHIFT` hints).
const MAX_SPIN_SHIFT: u32 = 7;

fn logical_cores() -> usize {
    static CORES: OnceLock<usize> = OnceLock::new();
    *CORES.get_or_init(|| thread::available_parallelism().map_or(1, NonZeroUsize::get))
}

/// Issues `iterations` CPU wait hints without touching shared memory.
#[inline]
fn cpu_relax(iterations: u32) {
    for _ in 0..iterations {
        hint::spin_loop();
    }
}

/// Adaptive backoff counter for spin loops.
///
/// Cheap to construct; create one per wait, call [`spin_once`] each time the
/// awaited condition is still false, and [`reset`] if the wait starts over.
///
/// [`spin_once`]: SpinWait::spin_once
/// [`reset`]: SpinWait::reset
#[derive(Debug, Default)]
pub struct SpinWait {
    count: u32,
}

impl SpinWait {
    /// Creates a fresh spinner.
    #[must_use]
    pub const fn new() -> Self {
        Self { count: 0 }
    }

    /// Number of times [`spin_once`](SpinWait::spin_once) has been called
    /// since construction or the last [`reset`](SpinWait::reset).
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// True when the next [`spin_once`](SpinWait::spin_once) call will give
    /// up the CPU (yield or sleep) rather than busy-spin.
    ///
    /// Callers amortize deadline checks on this: reading the clock on every
    /// spin would dominate the short-spin phase.
    #[must_use]
    pub fn next_spin_will_yield(&self) -> bool {
        self.count >= YIELD_THRESHOLD || logical_cores() == 1
    }

    /// Performs one unit of waiting and escalates the backoff state.
    pub fn spin_once(&mut self) {
        if self.next_spin_will_yield() {
            let post = self.count.saturating_sub(YIELD_THRESHOLD);
            if post % SLEEP_EVERY == SLEEP_EVERY - 1 {
                thread::sleep(Duration::from_millis(1));
            } else {
                thread::yield_now();
            }
        } else {
            cpu_relax(1 << self.count.min(MAX_SPIN_SHIFT));
        }
        self.count = self.count.saturating_add(1);
    }

    /// Rewinds the backoff state to a fresh spinner.
    pub fn reset(&mut self) {
        self.count = 0;
    }
}

/// Spins until `condition` returns true or `timeout` elapses.
///
/// `timeout` of `None` waits indefinitely. `Some(Duration::ZERO)` polls the
/// condition exactly once. Returns whether the condition became true.
///
/// The deadline is only consulted when the spinner is about to yield, so the
/// hot phase of the wait stays free of clock reads.
pub fn spin_until(mut condition: impl FnMut() -> bool, timeout: Option<Duration>) -> bool {
    if condition() {
        return true;
    }
    let deadline = match timeout {
        // Unrepresentably distant deadlines degrade to an unbounded wait.
        Some(t) => match Instant::now().checked_add(t) {
            Some(deadline) => {
                if t.is_zero() {
                    return false;
                }
                Some(deadline)
            }
            None => None,
        },
        None => None,
    };

    let mut spinner = SpinWait::new();
    loop {
        if condition() {
            return true;
        }
        if let Some(deadline) = deadline {
            if spinner.next_spin_will_yield() && Instant::now() >= deadline {
                return false;
            }
        }
        spinner.spin_once();
    }
}
