//! Process-unique thread identifiers.
//!
//! [`SpinLock`](super::SpinLock) owner tracking needs a compact integer
//! identity for the current thread. `std::thread::ThreadId` is opaque, so
//! ids are handed out from a global counter and cached in a thread-local on
//! first use.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};

/// Ids live in `1..=ID_SPACE`, keeping the high bit clear so an id can never
/// collide with the lock word's tracking-disabled flag.
const ID_SPACE: u32 = 0x7FFF_FFFE;

static NEXT_ID: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static CACHED_ID: Cell<u32> = const { Cell::new(0) };
}

/// Returns the calling thread's id. Always non-zero.
///
/// The id is assigned on first call and stable for the thread's lifetime.
/// The counter wraps within `1..=ID_SPACE`; reuse after ~2^31 thread
/// creations is accepted, as in the runtimes this mirrors.
pub fn current() -> u32 {
    CACHED_ID.with(|cell| {
        let cached = cell.get();
        if cached != 0 {
            return cached;
        }
        let id = (NEXT_ID.fetch_add(1, Ordering::Relaxed) % ID_SPACE) + 1;
        cell.set(id);
        id
    })
}
