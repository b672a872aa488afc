//! Cancellation sources: the state machine, the drain loop, deferred
//! cancellation, and source linking.
//!
//! A [`CancelSource`] owns the right to cancel. Its shared core moves
//! through three states, one way only:
//!
//! ```text
//! NOT_CANCELLED ──cas──▶ NOTIFYING ──▶ NOTIFY_COMPLETE
//! ```
//!
//! Exactly one thread wins the compare-and-swap out of `NOT_CANCELLED` and
//! becomes the drainer: it disarms the timer, signals the wait handle, and
//! executes every registered callback in reverse registration order. Every
//! other concurrent canceller returns immediately, having observed
//! cancellation become requested.
//!
//! Races between cancelling, registering, and dropping the source are
//! resolved to tolerated outcomes, not errors; the per-operation rules are
//! documented on the methods below.

use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{AggregatePanics, CancelError, Disposed, NoParentTokens};
use crate::sync::thread_id;
use crate::sync::ResetEvent;
use crate::time::OneShotTimer;

use super::callback::{AmbientContext, Callback};
use super::registry::CallbackRegistry;
use super::token::{CancelToken, Registration};

/// No cancellation requested yet.
const NOT_CANCELLED: u8 = 0;
/// One thread won the transition and owns the drain.
const NOTIFYING: u8 = 1;
/// The drain finished.
const NOTIFY_COMPLETE: u8 = 2;

/// Shared interior of a [`CancelSource`], also referenced by every
/// [`CancelToken`] minted from it.
pub(crate) struct SourceCore {
    state: AtomicU8,
    disposed: AtomicBool,
    /// Lazily created; taken (left `None`) when draining begins or the
    /// source is dropped, releasing the callback storage early.
    registry: Mutex<Option<Arc<CallbackRegistry>>>,
    /// Deferred-cancellation timer, owned exclusively by this core.
    timer: Mutex<Option<OneShotTimer>>,
    /// Lazily created waitable event mirroring cancellation state.
    event: Mutex<Option<Arc<ResetEvent>>>,
}

impl fmt::Debug for SourceCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceCore")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SourceCore {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(NOT_CANCELLED),
            disposed: AtomicBool::new(false),
            registry: Mutex::new(None),
            timer: Mutex::new(None),
            event: Mutex::new(None),
        }
    }

    /// A core born in the completed state, for pre-cancelled tokens.
    pub(crate) fn new_cancelled() -> Self {
        let core = Self::new();
        core.state.store(NOTIFY_COMPLETE, Ordering::SeqCst);
        core
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) != NOT_CANCELLED
    }

    /// Registers a callback, resolving every race with cancellation so the
    /// callback runs exactly once (or provably not at all):
    ///
    /// - already cancelled: invoked synchronously, inert handle returned;
    /// - already disposed: accepted as a no-op, inert handle returned;
    /// - cancellation begins concurrently: whoever can still pull the node
    ///   out of the list owns the execution — if we can, we invoke here; if
    ///   the drainer already claimed it, the live handle lets the caller
    ///   wait for completion.
    pub(crate) fn register(
        core: &Arc<Self>,
        callback: Callback,
        context: Option<AmbientContext>,
    ) -> Registration {
        if core.is_cancelled() {
            run_callback(callback, context, &CancelToken::from_core(Arc::clone(core)));
            return Registration::inert();
        }
        if core.disposed.load(Ordering::SeqCst) {
            return Registration::inert();
        }
        let registry = {
            let mut slot = core.lock_registry();
            match slot.as_ref() {
                Some(registry) => Arc::clone(registry),
                None => {
                    let registry = Arc::new(CallbackRegistry::new());
                    *slot = Some(Arc::clone(&registry));
                    registry
                }
            }
        };
        let (id, index) = registry.insert(callback, context);
        if core.is_cancelled() {
            if let Some((callback, context)) = registry.take(id, index) {
                run_callback(callback, context, &CancelToken::from_core(Arc::clone(core)));
                return Registration::inert();
            }
            // The drainer claimed the node between insert and take.
        }
        Registration::live(registry, id, index)
    }

    /// Requests cancellation; the winning caller drains.
    ///
    /// With `fail_fast`, the first callback panic is resumed immediately
    /// and the not-yet-run callbacks of this pass are abandoned. Otherwise
    /// every callback runs and the panics are aggregated.
    pub(crate) fn request_cancel(
        core: &Arc<Self>,
        fail_fast: bool,
    ) -> Result<(), CancelError> {
        if core.disposed.load(Ordering::SeqCst) {
            return Err(Disposed.into());
        }
        if core
            .state
            .compare_exchange(NOT_CANCELLED, NOTIFYING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Lost the race: cancellation is already requested and the
            // winner owns the drain.
            return Ok(());
        }
        tracing::debug!("cancellation requested");

        if let Some(timer) = core.lock_timer().take() {
            timer.shutdown();
        }
        let event = core.lock_event().clone();
        if let Some(event) = event {
            event.set();
        }

        let registry = core.lock_registry().take();
        let mut panics = Vec::new();
        if let Some(registry) = registry {
            registry.set_drainer(thread_id::current());
            let token = CancelToken::from_core(Arc::clone(core));
            let mut executed = 0_usize;
            while let Some((_id, callback, context)) = registry.pop_for_drain() {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    run_callback(callback, context, &token);
                }));
                registry.finish_execution();
                executed += 1;
                if let Err(payload) = outcome {
                    if fail_fast {
                        registry.clear_drainer();
                        resume_unwind(payload);
                    }
                    panics.push(payload);
                }
            }
            registry.clear_drainer();
            tracing::trace!(executed, panicked = panics.len(), "cancellation drain complete");
        }

        core.state.store(NOTIFY_COMPLETE, Ordering::SeqCst);
        if panics.is_empty() {
            Ok(())
        } else {
            Err(AggregatePanics::new(panics).into())
        }
    }

    /// (Re)schedules cancellation after `delay`.
    ///
    /// A zero delay transitions synchronously before returning. Calls after
    /// cancellation are no-ops. A call racing disposal may leave a timer
    /// thread winding down; it finds a disposed core and does nothing.
    pub(crate) fn cancel_after(core: &Arc<Self>, delay: Duration) -> Result<(), CancelError> {
        if core.disposed.load(Ordering::SeqCst) {
            return Err(Disposed.into());
        }
        if core.is_cancelled() {
            return Ok(());
        }
        if delay.is_zero() {
            return Self::request_cancel(core, false);
        }
        let mut timer = core.lock_timer();
        if timer.is_none() {
            let weak = Arc::downgrade(core);
            *timer = Some(OneShotTimer::spawn("quell-cancel-timer", move || {
                if let Some(core) = weak.upgrade() {
                    Self::timer_fired(&core);
                }
            }));
        }
        if let Some(timer) = timer.as_ref() {
            timer.arm(delay);
        }
        tracing::trace!(?delay, "deferred cancellation armed");
        Ok(())
    }

    fn timer_fired(core: &Arc<Self>) {
        match Self::request_cancel(core, false) {
            // Raced disposal: the deadline expired into a source that no
            // longer wants it.
            Ok(()) | Err(CancelError::Disposed(_)) => {}
            Err(CancelError::CallbackPanics(panics)) => {
                // The timer thread has no caller to hand these to.
                tracing::error!(
                    count = panics.len(),
                    "cancellation callbacks panicked during timer-driven cancel"
                );
            }
        }
    }

    /// Returns the source to the never-cancelled state if nothing has
    /// committed it: still `NOT_CANCELLED`, and any armed timer could be
    /// disarmed before firing. All registrations are discarded unfired.
    pub(crate) fn try_reset(&self) -> bool {
        if self.disposed.load(Ordering::SeqCst) {
            return false;
        }
        if self.state.load(Ordering::SeqCst) != NOT_CANCELLED {
            return false;
        }
        let timer_quiet = match self.lock_timer().as_ref() {
            Some(timer) => timer.try_disarm(),
            None => true,
        };
        if !timer_quiet || self.state.load(Ordering::SeqCst) != NOT_CANCELLED {
            return false;
        }
        let registry = self.lock_registry().as_ref().map(Arc::clone);
        if let Some(registry) = registry {
            registry.retire_all();
        }
        true
    }

    /// Lazily creates the waitable event. Born set when cancellation has
    /// already been requested; the publish/re-check below closes the race
    /// with a concurrent drain that read the event slot before we filled it.
    pub(crate) fn wait_handle(&self) -> Arc<ResetEvent> {
        {
            let slot = self.lock_event();
            if let Some(event) = slot.as_ref() {
                return Arc::clone(event);
            }
        }
        let event = Arc::new(ResetEvent::new(false));
        {
            let mut slot = self.lock_event();
            if let Some(existing) = slot.as_ref() {
                // Another thread published first; use theirs.
                return Arc::clone(existing);
            }
            *slot = Some(Arc::clone(&event));
        }
        if self.is_cancelled() {
            event.set();
        }
        event
    }

    /// Idempotent teardown, driven by [`CancelSource`]'s `Drop`.
    ///
    /// Outstanding registrations are tolerated: their handles quietly find
    /// nothing to deregister. An in-flight drain keeps its own `Arc`s to
    /// everything it touches, so clearing the references here is safe; the
    /// event reference is left for the drainer when it is mid-signal.
    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(timer) = self.lock_timer().take() {
            timer.shutdown();
        }
        *self.lock_registry() = None;
        if self.state.load(Ordering::SeqCst) != NOTIFYING {
            *self.lock_event() = None;
        }
        tracing::trace!("cancellation source disposed");
    }

    fn linked_parent_cancelled(core: &Arc<Self>) {
        match Self::request_cancel(core, false) {
            Ok(()) => {}
            // Child dropped before the parent cancelled: nothing to do.
            Err(CancelError::Disposed(_)) => {}
            // Surface child callback panics to the parent's drain, which
            // aggregates them like any other callback failure.
            Err(CancelError::CallbackPanics(panics)) => std::panic::panic_any(panics),
        }
    }

    fn lock_registry(&self) -> MutexGuard<'_, Option<Arc<CallbackRegistry>>> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<OneShotTimer>> {
        match self.timer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_event(&self) -> MutexGuard<'_, Option<Arc<ResetEvent>>> {
        match self.event.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Invokes a callback, inside its captured context when one was supplied.
fn run_callback(callback: Callback, context: Option<AmbientContext>, token: &CancelToken) {
    match context {
        None => callback.invoke(token.clone()),
        Some(context) => {
            let mut pending = Some((callback, token.clone()));
            context.run(&mut || {
                if let Some((callback, token)) = pending.take() {
                    callback.invoke(token);
                }
            });
        }
    }
}

/// Owner and controller of one cancellation.
///
/// Mint observer handles with [`token`](CancelSource::token); request
/// cancellation with [`cancel`](CancelSource::cancel) or defer it with
/// [`cancel_after`](CancelSource::cancel_after). Dropping the source
/// disposes it: the timer stops, the callback list is released, and later
/// registrations through outstanding tokens become accepted no-ops. Tokens
/// stay safe to use after the source is gone; they simply observe whatever
/// state was frozen.
///
/// # Example
///
/// ```
/// use quell::CancelSource;
///
/// let source = CancelSource::new();
/// let token = source.token();
///
/// let seen = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
/// let observed = std::sync::Arc::clone(&seen);
/// token.register(move || observed.store(true, std::sync::atomic::Ordering::SeqCst));
///
/// source.cancel().expect("no callback panicked");
/// assert!(token.is_cancelled());
/// assert!(seen.load(std::sync::atomic::Ordering::SeqCst));
/// ```
#[derive(Debug)]
pub struct CancelSource {
    core: Arc<SourceCore>,
    /// Registrations this source holds on parent tokens (linked sources).
    parent_links: Vec<Registration>,
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSource {
    /// Creates a source in the never-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Arc::new(SourceCore::new()),
            parent_links: Vec::new(),
        }
    }

    /// Creates a source that cancels itself after `delay`.
    ///
    /// `Duration::ZERO` yields a source that is already cancelled when the
    /// constructor returns.
    #[must_use]
    pub fn with_timeout(delay: Duration) -> Self {
        let source = Self::new();
        // Fresh source: nothing registered to panic, nothing disposed.
        let _ = SourceCore::cancel_after(&source.core, delay);
        source
    }

    /// Creates a source cancelled whenever any of `parents` is cancelled.
    ///
    /// The child subscribes to every cancelable parent; a parent that is
    /// already cancelled cancels the child before this returns. Dropping
    /// the child unsubscribes from all parents.
    ///
    /// # Errors
    ///
    /// [`NoParentTokens`] when `parents` is empty.
    pub fn linked(parents: &[CancelToken]) -> Result<Self, NoParentTokens> {
        if parents.is_empty() {
            return Err(NoParentTokens);
        }
        let core = Arc::new(SourceCore::new());
        let mut parent_links = Vec::with_capacity(parents.len());
        for parent in parents {
            if !parent.can_be_cancelled() {
                continue;
            }
            let child = Arc::clone(&core);
            parent_links.push(parent.register(move || {
                SourceCore::linked_parent_cancelled(&child);
            }));
        }
        tracing::trace!(parents = parents.len(), "linked cancellation source created");
        Ok(Self { core, parent_links })
    }

    /// A token observing this source.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken::from_core(Arc::clone(&self.core))
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.core.is_cancelled()
    }

    /// Requests cancellation and, if this call wins the transition, drains
    /// every registered callback in reverse registration order.
    ///
    /// Once this returns `Ok`, every non-panicking callback has run.
    /// Concurrent callers that lose the transition return `Ok` immediately
    /// without waiting for the drain.
    ///
    /// # Errors
    ///
    /// [`CancelError::CallbackPanics`] when callbacks panicked; the drain
    /// still ran to completion and the payloads are all there.
    pub fn cancel(&self) -> Result<(), CancelError> {
        SourceCore::request_cancel(&self.core, false)
    }

    /// Like [`cancel`](Self::cancel), but resumes the first callback panic
    /// immediately. Callbacks that had not yet run stay unran forever —
    /// preserved, documented behavior of the fail-fast mode.
    pub fn cancel_fail_fast(&self) {
        // Errors cannot reach here: panics resume above, and an owned
        // source cannot race its own disposal.
        let _ = SourceCore::request_cancel(&self.core, true);
    }

    /// (Re)schedules cancellation after `delay`, resetting any countdown
    /// already in flight. Zero means cancel synchronously, now.
    ///
    /// # Errors
    ///
    /// [`CancelError::CallbackPanics`] when a zero delay drained panicking
    /// callbacks on this thread.
    pub fn cancel_after(&self, delay: Duration) -> Result<(), CancelError> {
        SourceCore::cancel_after(&self.core, delay)
    }

    /// Recycles the source for reuse instead of allocating a new one.
    ///
    /// Succeeds — discarding every registration unfired — only if the
    /// source was never cancelled and no armed timer could still fire.
    pub fn try_reset(&self) -> bool {
        self.core.try_reset()
    }

    /// An OS-blocking event that becomes (and stays) set on cancellation.
    #[must_use]
    pub fn wait_handle(&self) -> Arc<ResetEvent> {
        self.core.wait_handle()
    }
}

impl Drop for CancelSource {
    fn drop(&mut self) {
        for link in &mut self.parent_links {
            // Waiting out an in-flight parent drain keeps the child core's
            // teardown ordered after any linked cancellation touching it.
            link.deregister_and_wait();
        }
        self.core.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cancel_transitions_once() {
        let source = CancelSource::new();
        assert!(!source.is_cancelled());
        source.cancel().expect("cancel failed");
        assert!(source.is_cancelled());
        // Second cancel is a quiet no-op.
        source.cancel().expect("second cancel failed");
    }

    #[test]
    fn register_after_cancel_runs_synchronously() {
        let source = CancelSource::new();
        source.cancel().expect("cancel failed");

        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&hits);
        let mut registration = source
            .token()
            .register(move || {
                observed.fetch_add(1, Ordering::SeqCst);
            });
        assert_eq!(hits.load(Ordering::SeqCst), 1, "must run before register returns");
        assert!(!registration.deregister(), "handle must be inert");
    }

    #[test]
    fn callbacks_run_in_reverse_registration_order() {
        let source = CancelSource::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            source.token().register(move || {
                order.lock().expect("order poisoned").push(name);
            });
        }
        source.cancel().expect("cancel failed");
        assert_eq!(*order.lock().expect("order poisoned"), ["c", "b", "a"]);
    }

    #[test]
    fn aggregate_mode_runs_everything_and_collects_panics() {
        let source = CancelSource::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for i in 0..4 {
            let hits = Arc::clone(&hits);
            source.token().register(move || {
                hits.fetch_add(1, Ordering::SeqCst);
                if i % 2 == 0 {
                    panic!("callback {i} failed");
                }
            });
        }
        let err = source.cancel().expect_err("panics must surface");
        match err {
            CancelError::CallbackPanics(panics) => {
                assert_eq!(panics.len(), 2);
                assert_eq!(panics.messages(), ["callback 2 failed", "callback 0 failed"]);
            }
            CancelError::Disposed(_) => panic!("wrong error kind"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 4, "every callback still ran");
    }

    #[test]
    fn timer_fired_tolerates_disposed_core() {
        let core = Arc::new(SourceCore::new());
        core.dispose();
        SourceCore::timer_fired(&core);
        assert!(!core.is_cancelled());
    }

    #[test]
    fn dispose_is_idempotent() {
        let core = Arc::new(SourceCore::new());
        core.dispose();
        core.dispose();
    }
}
