//! Spin-based synchronization primitives.
//!
//! Everything in this module waits by burning CPU with escalating backoff
//! rather than parking on an OS primitive, which is the right trade for the
//! O(1) critical sections the cancellation engine needs:
//!
//! - [`SpinWait`]: adaptive backoff counter (spin, then yield, then sleep)
//!   plus the [`spin_until`] predicate helper
//! - [`SpinLock`]: mutual exclusion from a single atomic word, with
//!   optional owner tracking for recursion/discipline diagnostics
//! - [`ResetEvent`]: the one true-blocking primitive, for callers that want
//!   an OS-level wait on cancellation
//!
//! # Discipline
//!
//! Spin locks here are leaf-level: critical sections must be O(1), must not
//! block, and must never take a second spin lock.

mod event;
mod spin_lock;
mod spin_wait;
pub(crate) mod thread_id;

pub use event::ResetEvent;
pub use spin_lock::{LockError, SpinLock};
pub use spin_wait::{spin_until, SpinWait, YIELD_THRESHOLD};
