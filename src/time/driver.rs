//! One-shot deadline timer backing deferred cancellation.
//!
//! [`OneShotTimer`] is the crate's delay-scheduling collaborator: one named
//! thread per timer sleeps on a condition variable until the armed deadline
//! passes, then fires its trigger. The deadline can be re-armed (resetting
//! the countdown), disarmed (if it has not started firing), and shut down;
//! all three are cheap signals to the thread, never thread churn.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct TimerState {
    /// Armed deadline; `None` while idle.
    deadline: Option<Instant>,
    /// True while the trigger runs; blocks disarming.
    firing: bool,
    /// Terminal; the thread exits at the next wakeup.
    shutdown: bool,
}

#[derive(Debug)]
struct TimerShared {
    state: Mutex<TimerState>,
    signal: Condvar,
}

impl TimerShared {
    fn lock_state(&self) -> MutexGuard<'_, TimerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A re-armable single-deadline timer with its own waiter thread.
pub(crate) struct OneShotTimer {
    shared: Arc<TimerShared>,
}

impl OneShotTimer {
    /// Starts the timer thread, initially idle.
    ///
    /// `trigger` runs on the timer thread each time an armed deadline
    /// expires (a timer re-armed after firing fires again).
    pub(crate) fn spawn(name: &str, trigger: impl Fn() + Send + 'static) -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                deadline: None,
                firing: false,
                shutdown: false,
            }),
            signal: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || Self::run(&thread_shared, &trigger))
            .expect("failed to spawn timer thread");
        Self { shared }
    }

    fn run(shared: &TimerShared, trigger: &(impl Fn() + Send + 'static)) {
        let mut state = shared.lock_state();
        loop {
            if state.shutdown {
                return;
            }
            match state.deadline {
                None => {
                    state = match shared.signal.wait(state) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        // Claim the expiry: once `firing` is set, disarm
                        // refuses and reset cannot pretend the deadline
                        // never fired.
                        state.deadline = None;
                        state.firing = true;
                        drop(state);
                        trigger();
                        state = shared.lock_state();
                        state.firing = false;
                    } else {
                        state = match shared.signal.wait_timeout(state, deadline - now) {
                            Ok((guard, _)) => guard,
                            Err(poisoned) => poisoned.into_inner().0,
                        };
                    }
                }
            }
        }
    }

    /// Arms (or re-arms) the deadline `delay` from now.
    pub(crate) fn arm(&self, delay: Duration) {
        let mut state = self.shared.lock_state();
        // Unrepresentably distant deadlines stay idle; nothing would ever
        // observe the difference.
        state.deadline = Instant::now().checked_add(delay);
        drop(state);
        self.shared.signal.notify_one();
    }

    /// Clears any armed deadline before it fires.
    ///
    /// Returns false when the trigger is running or has already claimed the
    /// deadline concurrently — the caller cannot assume the trigger never
    /// ran.
    pub(crate) fn try_disarm(&self) -> bool {
        let mut state = self.shared.lock_state();
        if state.firing {
            return false;
        }
        state.deadline = None;
        true
    }

    /// Stops the timer thread. An in-flight trigger finishes on its own.
    pub(crate) fn shutdown(&self) {
        let mut state = self.shared.lock_state();
        state.shutdown = true;
        state.deadline = None;
        drop(state);
        self.shared.signal.notify_one();
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for OneShotTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock_state();
        f.debug_struct("OneShotTimer")
            .field("armed", &state.deadline.is_some())
            .field("firing", &state.firing)
            .field("shutdown", &state.shutdown)
            .finish()
    }
}
