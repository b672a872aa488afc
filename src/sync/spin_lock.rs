//! Word-sized mutual exclusion for short critical sections.
//!
//! [`SpinLock`] packs its entire state into one atomic `u32`:
//!
//! - **Tracked mode** (default): the word holds the owning thread's id
//!   (0 = free). Re-entry from the owner and release by a non-owner are
//!   reported as [`LockError`]s instead of deadlocking or corrupting state.
//! - **Anonymous mode** ([`SpinLock::new_untracked`]): the high bit marks
//!   tracking as disabled, bit 0 is the held flag, and the bits between
//!   them count waiters. The waiter count scales how long a newly arrived
//!   waiter busy-spins before yielding, which keeps hand-off roughly
//!   arrival-ordered under contention.
//!
//! Contention falls back to [`SpinWait`]'s escalating backoff. Locks here
//! are leaf-level only: never acquire a second `SpinLock` while holding one.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use super::spin_wait::SpinWait;
use super::thread_id;

/// High bit: owner tracking disabled for this lock.
const TRACKING_DISABLED: u32 = 0x8000_0000;
/// Anonymous mode, bit 0: lock is held.
const ANONYMOUS_HELD: u32 = 1;
/// Anonymous mode, bits 1..31: waiter count (stored shifted left by one).
const WAITERS_MASK: u32 = TRACKING_DISABLED - 2;
/// One waiter, in the representation of the waiter bit-field.
const WAITER_UNIT: u32 = 2;
/// Busy-spin iterations granted per queue position before yielding.
const SPINS_PER_WAITER: u32 = 100;

/// Misuse of an owner-tracked [`SpinLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The calling thread already holds the lock; recursive acquisition is
    /// not supported.
    Recursion,
    /// The calling thread tried to release a lock it does not hold.
    NotOwner,
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recursion => write!(f, "spin lock acquired recursively"),
            Self::NotOwner => write!(f, "spin lock released by a non-owning thread"),
        }
    }
}

impl std::error::Error for LockError {}

/// A spin-based mutual exclusion primitive.
///
/// Suitable only for critical sections that are O(1) and never block; every
/// waiter burns CPU in proportion to the hold time. The lock is not
/// re-entrant.
#[derive(Debug)]
pub struct SpinLock {
    word: AtomicU32,
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLock {
    /// Creates a lock that records the owning thread's id.
    ///
    /// Tracked locks detect recursive acquisition and foreign release,
    /// trading a thread-id read on the fast path for the diagnostics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
        }
    }

    /// Creates a lock that only tracks held/free plus a waiter count.
    #[must_use]
    pub const fn new_untracked() -> Self {
        Self {
            word: AtomicU32::new(TRACKING_DISABLED),
        }
    }

    /// Whether this lock records its owner's thread id.
    #[must_use]
    pub fn owner_tracking_enabled(&self) -> bool {
        self.word.load(Ordering::Relaxed) & TRACKING_DISABLED == 0
    }

    /// Whether the lock is currently held by any thread.
    #[must_use]
    pub fn is_held(&self) -> bool {
        let observed = self.word.load(Ordering::Relaxed);
        if observed & TRACKING_DISABLED == 0 {
            observed != 0
        } else {
            observed & ANONYMOUS_HELD != 0
        }
    }

    /// Whether the calling thread holds the lock.
    ///
    /// `None` for untracked locks, which cannot answer the question.
    #[must_use]
    pub fn is_held_by_current_thread(&self) -> Option<bool> {
        let observed = self.word.load(Ordering::Relaxed);
        if observed & TRACKING_DISABLED == 0 {
            Some(observed == thread_id::current())
        } else {
            None
        }
    }

    /// Number of threads currently spinning for an untracked lock.
    ///
    /// `None` for tracked locks, which do not count waiters.
    #[must_use]
    pub fn waiters(&self) -> Option<u32> {
        let observed = self.word.load(Ordering::Relaxed);
        if observed & TRACKING_DISABLED == 0 {
            None
        } else {
            Some((observed & WAITERS_MASK) / WAITER_UNIT)
        }
    }

    /// Acquires the lock, spinning until it is available.
    ///
    /// # Errors
    ///
    /// [`LockError::Recursion`] if this is a tracked lock and the calling
    /// thread already holds it.
    pub fn enter(&self) -> Result<(), LockError> {
        if self.try_acquire_fast() {
            return Ok(());
        }
        if self.owner_tracking_enabled() {
            // Unbounded wait: the slow path only returns false on deadline.
            self.enter_slow_tracked(None).map(|_| ())
        } else {
            self.enter_slow_anonymous(None);
            Ok(())
        }
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// Returns whether the lock was acquired.
    ///
    /// # Errors
    ///
    /// [`LockError::Recursion`] if this is a tracked lock and the calling
    /// thread already holds it.
    pub fn try_enter(&self) -> Result<bool, LockError> {
        let observed = self.word.load(Ordering::Relaxed);
        if observed & TRACKING_DISABLED == 0 && observed == thread_id::current() {
            return Err(LockError::Recursion);
        }
        Ok(self.try_acquire_fast())
    }

    /// Attempts to acquire the lock, spinning for at most `timeout`.
    ///
    /// Returns whether the lock was acquired. A zero timeout behaves like
    /// [`try_enter`](Self::try_enter). A waiter that times out withdraws its
    /// contribution to the waiter count before returning.
    ///
    /// # Errors
    ///
    /// [`LockError::Recursion`] if this is a tracked lock and the calling
    /// thread already holds it.
    pub fn try_enter_for(&self, timeout: Duration) -> Result<bool, LockError> {
        if timeout.is_zero() {
            return self.try_enter();
        }
        if self.try_acquire_fast() {
            return Ok(true);
        }
        let deadline = Instant::now().checked_add(timeout);
        if self.owner_tracking_enabled() {
            self.enter_slow_tracked(deadline)
        } else {
            Ok(self.enter_slow_anonymous(deadline))
        }
    }

    /// Releases the lock, publishing the release with a full fence so that
    /// spinning waiters observe it promptly.
    ///
    /// # Errors
    ///
    /// [`LockError::NotOwner`] if this is a tracked lock and the calling
    /// thread does not hold it.
    pub fn exit(&self) -> Result<(), LockError> {
        self.release_inner(true)
    }

    /// Releases the lock with release ordering only.
    ///
    /// Cheaper than [`exit`](Self::exit); the release may take marginally
    /// longer to become visible to spinning waiters.
    ///
    /// # Errors
    ///
    /// [`LockError::NotOwner`] if this is a tracked lock and the calling
    /// thread does not hold it.
    pub fn exit_unfenced(&self) -> Result<(), LockError> {
        self.release_inner(false)
    }

    /// Infallible acquire for crate-internal untracked locks.
    ///
    /// Callers must construct the lock with [`new_untracked`]; untracked
    /// acquisition has no error paths.
    ///
    /// [`new_untracked`]: Self::new_untracked
    pub(crate) fn acquire(&self) {
        debug_assert!(!self.owner_tracking_enabled());
        if !self.try_acquire_fast() {
            self.enter_slow_anonymous(None);
        }
    }

    /// Infallible release paired with [`acquire`](Self::acquire).
    pub(crate) fn release(&self) {
        debug_assert!(!self.owner_tracking_enabled());
        self.word.fetch_and(!ANONYMOUS_HELD, Ordering::Release);
    }

    fn try_acquire_fast(&self) -> bool {
        let observed = self.word.load(Ordering::Relaxed);
        if observed & TRACKING_DISABLED == 0 {
            observed == 0
                && self
                    .word
                    .compare_exchange(0, thread_id::current(), Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
        } else {
            observed & ANONYMOUS_HELD == 0
                && self
                    .word
                    .compare_exchange(
                        observed,
                        observed | ANONYMOUS_HELD,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
        }
    }

    fn enter_slow_tracked(&self, deadline: Option<Instant>) -> Result<bool, LockError> {
        let me = thread_id::current();
        let mut spinner = SpinWait::new();
        loop {
            let observed = self.word.load(Ordering::Relaxed);
            if observed == me {
                return Err(LockError::Recursion);
            }
            if observed == 0
                && self
                    .word
                    .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return Ok(true);
            }
            if let Some(deadline) = deadline {
                if spinner.next_spin_will_yield() && Instant::now() >= deadline {
                    return Ok(false);
                }
            }
            spinner.spin_once();
        }
    }

    fn enter_slow_anonymous(&self, deadline: Option<Instant>) -> bool {
        // Join the waiter queue unless the count is saturated; the observed
        // depth buys a proportional busy-spin budget before yielding.
        let mut registered = false;
        let mut turn = 0;
        let mut observed = self.word.load(Ordering::Relaxed);
        while observed & WAITERS_MASK != WAITERS_MASK {
            match self.word.compare_exchange_weak(
                observed,
                observed + WAITER_UNIT,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    registered = true;
                    turn = (observed & WAITERS_MASK) / WAITER_UNIT + 1;
                    break;
                }
                Err(current) => observed = current,
            }
        }

        let mut budget = turn.saturating_mul(SPINS_PER_WAITER);
        let mut spinner = SpinWait::new();
        loop {
            let observed = self.word.load(Ordering::Relaxed);
            if observed & ANONYMOUS_HELD == 0 {
                let acquired = if registered {
                    (observed | ANONYMOUS_HELD) - WAITER_UNIT
                } else {
                    observed | ANONYMOUS_HELD
                };
                if self
                    .word
                    .compare_exchange(observed, acquired, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return true;
                }
                // Lost the race for a free lock; retry without backoff.
                continue;
            }
            if budget > 0 {
                budget -= 1;
                core::hint::spin_loop();
                continue;
            }
            if let Some(deadline) = deadline {
                if spinner.next_spin_will_yield() && Instant::now() >= deadline {
                    if registered {
                        self.word.fetch_sub(WAITER_UNIT, Ordering::Relaxed);
                    }
                    return false;
                }
            }
            spinner.spin_once();
        }
    }

    fn release_inner(&self, fence: bool) -> Result<(), LockError> {
        let observed = self.word.load(Ordering::Relaxed);
        if observed & TRACKING_DISABLED == 0 {
            if observed != thread_id::current() {
                return Err(LockError::NotOwner);
            }
            if fence {
                self.word.swap(0, Ordering::SeqCst);
            } else {
                self.word.store(0, Ordering::Release);
            }
        } else if fence {
            self.word.fetch_and(!ANONYMOUS_HELD, Ordering::SeqCst);
        } else {
            self.word.fetch_and(!ANONYMOUS_HELD, Ordering::Release);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, RwLock};
    use std::thread;

    #[test]
    fn uncontended_enter_exit() {
        let lock = SpinLock::new();
        assert!(!lock.is_held());
        lock.enter().expect("enter failed");
        assert!(lock.is_held());
        assert_eq!(lock.is_held_by_current_thread(), Some(true));
        lock.exit().expect("exit failed");
        assert!(!lock.is_held());
    }

    #[test]
    fn reentry_reports_recursion() {
        let lock = SpinLock::new();
        lock.enter().expect("enter failed");
        assert_eq!(lock.try_enter(), Err(LockError::Recursion));
        assert_eq!(lock.enter(), Err(LockError::Recursion));
        lock.exit().expect("exit failed");
    }

    #[test]
    fn foreign_release_reports_not_owner() {
        let lock = Arc::new(SpinLock::new());
        lock.enter().expect("enter failed");
        let lock2 = Arc::clone(&lock);
        let result = thread::spawn(move || lock2.exit()).join().expect("thread panicked");
        assert_eq!(result, Err(LockError::NotOwner));
        lock.exit().expect("exit failed");
    }

    #[test]
    fn try_enter_fails_fast_when_held() {
        let lock = Arc::new(SpinLock::new_untracked());
        lock.enter().expect("enter failed");
        let lock2 = Arc::clone(&lock);
        let acquired = thread::spawn(move || lock2.try_enter())
            .join()
            .expect("thread panicked")
            .expect("try_enter errored");
        assert!(!acquired);
        lock.exit().expect("exit failed");
    }

    #[test]
    fn try_enter_for_times_out_and_restores_waiter_count() {
        let lock = Arc::new(SpinLock::new_untracked());
        lock.enter().expect("enter failed");
        let lock2 = Arc::clone(&lock);
        let acquired = thread::spawn(move || lock2.try_enter_for(Duration::from_millis(30)))
            .join()
            .expect("thread panicked")
            .expect("try_enter_for errored");
        assert!(!acquired);
        assert_eq!(lock.waiters(), Some(0));
        lock.exit().expect("exit failed");
        lock.enter().expect("reacquire failed");
        lock.exit().expect("exit failed");
    }

    #[test]
    fn untracked_lock_has_no_owner_answer() {
        let lock = SpinLock::new_untracked();
        assert!(lock.is_held_by_current_thread().is_none());
        assert!(!lock.owner_tracking_enabled());
    }

    // Mutual exclusion: the shared counter is only touched while holding the
    // lock, so the final value exposes any torn critical section.
    #[test]
    fn contended_increments_are_exclusive() {
        const THREADS: usize = 4;
        const ITERS: usize = 5_000;

        for tracked in [true, false] {
            let lock = Arc::new(if tracked {
                SpinLock::new()
            } else {
                SpinLock::new_untracked()
            });
            let counter = Arc::new(RwLock::new(0u64));

            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let lock = Arc::clone(&lock);
                    let counter = Arc::clone(&counter);
                    thread::spawn(move || {
                        for _ in 0..ITERS {
                            lock.enter().expect("enter failed");
                            {
                                let mut guard = counter.write().expect("cell poisoned");
                                *guard += 1;
                            }
                            lock.exit().expect("exit failed");
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().expect("worker panicked");
            }

            assert_eq!(*counter.read().expect("cell poisoned"), (THREADS * ITERS) as u64);
            assert!(!lock.is_held());
        }
    }
}
