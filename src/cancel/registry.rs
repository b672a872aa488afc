//! Per-source callback bookkeeping.
//!
//! A [`CallbackRegistry`] is a slab of [`CallbackNode`]s threaded into two
//! intrusive index-based lists: the live list (doubly linked, LIFO — the
//! head is the most recent registration) and the free list (singly linked
//! through `next`). All list mutation happens under an embedded untracked
//! [`SpinLock`] with O(1) critical sections; the id of the callback the
//! drainer is currently invoking is published in a lock-free atomic so a
//! concurrent deregistration can detect and wait out an in-flight
//! execution.
//!
//! # Id discipline
//!
//! Ids are handed out from a per-registry monotonic counter starting at 1;
//! id 0 is reserved and marks an inert node. A node's id is zeroed — under
//! the lock — before the node reaches the free list, so a stale
//! [`Registration`](super::Registration) handle can never collapse a later
//! registration that happens to reuse the same slot.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::sync::{SpinLock, SpinWait};
use crate::sync::thread_id;

use super::callback::{AmbientContext, Callback};

/// A single registered callback's storage.
#[derive(Debug)]
struct CallbackNode {
    /// Active registration id; 0 = inert (free or being drained).
    id: u64,
    callback: Option<Callback>,
    context: Option<AmbientContext>,
    prev: Option<u32>,
    next: Option<u32>,
}

impl CallbackNode {
    const fn vacant() -> Self {
        Self {
            id: 0,
            callback: None,
            context: None,
            prev: None,
            next: None,
        }
    }
}

/// Slab storage plus the two intrusive lists.
#[derive(Debug, Default)]
struct NodeSlab {
    nodes: Vec<CallbackNode>,
    /// Head of the live list; most recent registration first.
    head: Option<u32>,
    /// Head of the free list, linked through `next`.
    free_head: Option<u32>,
    /// Next registration id; starts at 1, never reused.
    next_id: u64,
}

impl NodeSlab {
    const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            head: None,
            free_head: None,
            next_id: 1,
        }
    }

    fn allot_slot(&mut self) -> u32 {
        if let Some(slot) = self.free_head {
            self.free_head = self.nodes[slot as usize].next;
            slot
        } else {
            let slot = self.nodes.len() as u32;
            self.nodes.push(CallbackNode::vacant());
            slot
        }
    }

    /// Unlinks `slot` from the live list. The node's links are left stale;
    /// callers retire or recycle it immediately.
    fn unlink(&mut self, slot: u32) {
        let (prev, next) = {
            let node = &self.nodes[slot as usize];
            (node.prev, node.next)
        };
        match prev {
            Some(prev) => self.nodes[prev as usize].next = next,
            None => self.head = next,
        }
        if let Some(next) = next {
            self.nodes[next as usize].prev = prev;
        }
    }

    /// Zeroes the node's id and pushes it on the free list.
    ///
    /// The id must be cleared before the slot becomes reusable; that is the
    /// whole defense against stale-handle collisions.
    fn retire(&mut self, slot: u32) -> (Option<Callback>, Option<AmbientContext>) {
        let free_head = self.free_head;
        let node = &mut self.nodes[slot as usize];
        node.id = 0;
        let callback = node.callback.take();
        let context = node.context.take();
        node.prev = None;
        node.next = free_head;
        self.free_head = Some(slot);
        (callback, context)
    }
}

/// Concurrency-safe membership list of callbacks for one cancellation
/// source.
#[derive(Debug)]
pub(crate) struct CallbackRegistry {
    /// Guards every mutation of `slab`.
    lock: SpinLock,
    /// Interior-mutability cell; only touched while `lock` is held.
    slab: Mutex<NodeSlab>,
    /// Id currently being invoked by the drainer, 0 otherwise. Read
    /// lock-free by [`wait_for_callback`](Self::wait_for_callback).
    executing: AtomicU64,
    /// Thread id of the drainer while a drain is in progress, 0 otherwise.
    drainer: AtomicU32,
}

impl CallbackRegistry {
    pub(crate) fn new() -> Self {
        Self {
            lock: SpinLock::new_untracked(),
            slab: Mutex::new(NodeSlab::new()),
            executing: AtomicU64::new(0),
            drainer: AtomicU32::new(0),
        }
    }

    /// Inserts a callback at the head of the live list.
    ///
    /// Returns the registration id and slot for the [`Registration`] handle.
    ///
    /// [`Registration`]: super::Registration
    pub(crate) fn insert(
        &self,
        callback: Callback,
        context: Option<AmbientContext>,
    ) -> (u64, u32) {
        self.with_slab(|slab| {
            let id = slab.next_id;
            slab.next_id += 1;
            let slot = slab.allot_slot();
            let head = slab.head;
            {
                let node = &mut slab.nodes[slot as usize];
                node.id = id;
                node.callback = Some(callback);
                node.context = context;
                node.prev = None;
                node.next = head;
            }
            if let Some(head) = head {
                slab.nodes[head as usize].prev = Some(slot);
            }
            slab.head = Some(slot);
            (id, slot)
        })
    }

    /// Removes the registration `(id, slot)` if it is still live, handing
    /// its callback back to the caller.
    ///
    /// `None` means the registration already fired, was already removed, or
    /// the slot was recycled for a later registration.
    pub(crate) fn take(
        &self,
        id: u64,
        slot: u32,
    ) -> Option<(Callback, Option<AmbientContext>)> {
        self.with_slab(|slab| {
            let node = slab.nodes.get(slot as usize)?;
            if node.id != id {
                return None;
            }
            slab.unlink(slot);
            let (callback, context) = slab.retire(slot);
            callback.map(|callback| (callback, context))
        })
    }

    /// Detaches the head (most recent) live node for the drain loop.
    ///
    /// The node's id is published as executing before the lock is released,
    /// so a racing [`take`](Self::take) that misses the node can tell the
    /// difference between "already done" and "running right now".
    pub(crate) fn pop_for_drain(
        &self,
    ) -> Option<(u64, Callback, Option<AmbientContext>)> {
        self.with_slab(|slab| {
            let slot = slab.head?;
            let id = slab.nodes[slot as usize].id;
            slab.unlink(slot);
            let (callback, context) = slab.retire(slot);
            self.executing.store(id, Ordering::SeqCst);
            callback.map(|callback| (id, callback, context))
        })
    }

    /// Clears the executing marker once the drainer finishes invoking.
    pub(crate) fn finish_execution(&self) {
        self.executing.store(0, Ordering::SeqCst);
    }

    /// Moves every live node to the free list without invoking anything.
    pub(crate) fn retire_all(&self) {
        self.with_slab(|slab| {
            while let Some(slot) = slab.head {
                slab.unlink(slot);
                slab.retire(slot);
            }
        });
    }

    /// Number of live registrations. O(n); test and diagnostic use only.
    #[cfg(test)]
    pub(crate) fn live_len(&self) -> usize {
        self.with_slab(|slab| {
            let mut len = 0;
            let mut cursor = slab.head;
            while let Some(slot) = cursor {
                len += 1;
                cursor = slab.nodes[slot as usize].next;
            }
            len
        })
    }

    pub(crate) fn set_drainer(&self, thread: u32) {
        self.drainer.store(thread, Ordering::SeqCst);
    }

    pub(crate) fn clear_drainer(&self) {
        self.drainer.store(0, Ordering::SeqCst);
    }

    /// Spins until callback `id` is no longer executing.
    ///
    /// No-op when called from the drainer itself: a callback disposing its
    /// own registration must not wait for its own completion.
    pub(crate) fn wait_for_callback(&self, id: u64) {
        if self.drainer.load(Ordering::SeqCst) == thread_id::current() {
            return;
        }
        let mut spinner = SpinWait::new();
        while self.executing.load(Ordering::SeqCst) == id {
            spinner.spin_once();
        }
    }

    /// Runs `f` on the slab with the spin lock held.
    fn with_slab<R>(&self, f: impl FnOnce(&mut NodeSlab) -> R) -> R {
        self.lock.acquire();
        let result = f(&mut self.lock_slab());
        self.lock.release();
        result
    }

    /// The `Mutex` is the safe interior-mutability cell for the slab; it is
    /// uncontended by construction because every caller holds the spin lock.
    fn lock_slab(&self) -> MutexGuard<'_, NodeSlab> {
        match self.slab.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
