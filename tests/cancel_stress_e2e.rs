//! Multithreaded stress for the cancellation engine.
//!
//! These tests drive real OS threads against one source and check the
//! exactly-once guarantees under racing registration, deregistration, and
//! cancellation. Counts are exact: a lost or doubled callback fails the
//! run.

mod common;

use common::*;
use quell::{CancelSource, SpinLock};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, RwLock};
use std::thread;
use std::time::Duration;

const REGISTER_THREADS: usize = 8;
const CALLBACKS_PER_THREAD: usize = 125;

// 8 threads register 1000 callbacks while a 9th cancels: every callback
// runs exactly once, whether the drainer claimed it or the registering
// thread resolved the race by invoking synchronously.
#[test]
fn concurrent_registration_against_cancel_is_exactly_once() {
    init_test_logging();
    for _round in 0..8 {
        let source = Arc::new(CancelSource::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(REGISTER_THREADS + 1));

        let mut workers = Vec::new();
        for _ in 0..REGISTER_THREADS {
            let source = Arc::clone(&source);
            let hits = Arc::clone(&hits);
            let barrier = Arc::clone(&barrier);
            workers.push(thread::spawn(move || {
                let token = source.token();
                barrier.wait();
                for _ in 0..CALLBACKS_PER_THREAD {
                    let hits = Arc::clone(&hits);
                    token.register(move || {
                        hits.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }));
        }

        let canceller = {
            let source = Arc::clone(&source);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                source.cancel()
            })
        };

        for worker in workers {
            worker.join().expect("register worker panicked");
        }
        canceller
            .join()
            .expect("canceller panicked")
            .expect("cancel failed");

        assert_eq!(
            hits.load(Ordering::SeqCst),
            REGISTER_THREADS * CALLBACKS_PER_THREAD,
            "every registered callback must run exactly once"
        );
    }
}

// Each worker registers and immediately deregisters in a loop while the
// canceller fires mid-stream. For every registration, exactly one of two
// things happened: the deregistration won (callback never ran) or the
// callback ran (deregistration reported not-found).
#[test]
fn deregistration_races_cancel_without_loss_or_double_fire() {
    init_test_logging();
    const SLOTS: usize = 400;

    let source = Arc::new(CancelSource::new());
    let fates: Arc<Vec<AtomicU8>> = Arc::new((0..SLOTS).map(|_| AtomicU8::new(0)).collect());
    let barrier = Arc::new(Barrier::new(5));

    let mut workers = Vec::new();
    for worker_index in 0..4 {
        let source = Arc::clone(&source);
        let fates = Arc::clone(&fates);
        let barrier = Arc::clone(&barrier);
        workers.push(thread::spawn(move || {
            let token = source.token();
            barrier.wait();
            for i in (worker_index..SLOTS).step_by(4) {
                let sink = Arc::clone(&fates);
                let mut registration = token.register(move || {
                    sink[i].fetch_add(1, Ordering::SeqCst);
                });
                if registration.deregister() {
                    // Removed before it could fire; it must never fire.
                    fates[i].fetch_add(10, Ordering::SeqCst);
                }
            }
        }));
    }

    let canceller = {
        let source = Arc::clone(&source);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            thread::sleep(Duration::from_micros(200));
            source.cancel()
        })
    };

    for worker in workers {
        worker.join().expect("worker panicked");
    }
    canceller
        .join()
        .expect("canceller panicked")
        .expect("cancel failed");

    for (i, fate) in fates.iter().enumerate() {
        let fate = fate.load(Ordering::SeqCst);
        assert!(
            fate == 1 || fate == 10,
            "slot {i}: expected exactly-once (1) or removed-unfired (10), got {fate}"
        );
    }
}

#[test]
fn many_cancellers_one_drain() {
    init_test_logging();
    let source = Arc::new(CancelSource::new());
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..64 {
        let hits = Arc::clone(&hits);
        source.token().register(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }

    let barrier = Arc::new(Barrier::new(8));
    let cancellers: Vec<_> = (0..8)
        .map(|_| {
            let source = Arc::clone(&source);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let result = source.cancel();
                // Losers return Ok immediately; is_cancelled is already
                // visible to them.
                assert!(source.is_cancelled());
                result
            })
        })
        .collect();

    for canceller in cancellers {
        canceller
            .join()
            .expect("canceller panicked")
            .expect("cancel failed");
    }
    assert_eq!(hits.load(Ordering::SeqCst), 64);
}

// SpinLock under heavy contention, tracked and untracked: the RwLock cell
// is only ever touched while holding the spin lock, so lost updates or torn
// sections would show up as a short count.
#[test]
fn spin_lock_excludes_under_contention() {
    init_test_logging();
    const THREADS: usize = 8;
    const ITERS: usize = 2_000;

    for tracked in [true, false] {
        let lock = Arc::new(if tracked {
            SpinLock::new()
        } else {
            SpinLock::new_untracked()
        });
        let cell = Arc::new(RwLock::new(0_u64));
        let barrier = Arc::new(Barrier::new(THREADS));

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let cell = Arc::clone(&cell);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..ITERS {
                        lock.enter().expect("enter failed");
                        {
                            let mut value = cell.write().expect("cell poisoned");
                            *value += 1;
                        }
                        lock.exit().expect("exit failed");
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker panicked");
        }

        assert_eq!(*cell.read().expect("cell poisoned"), (THREADS * ITERS) as u64);
    }
}
