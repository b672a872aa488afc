//! Observer handles: tokens and registration handles.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::error::Cancelled;
use crate::sync::ResetEvent;

use super::callback::{AmbientContext, Callback};
use super::registry::CallbackRegistry;
use super::source::SourceCore;

/// Shared core behind every [`CancelToken::already_cancelled`] token.
fn cancelled_core() -> &'static Arc<SourceCore> {
    static CORE: OnceLock<Arc<SourceCore>> = OnceLock::new();
    CORE.get_or_init(|| Arc::new(SourceCore::new_cancelled()))
}

/// Shared never-set event handed out by sourceless tokens.
fn never_event() -> &'static Arc<ResetEvent> {
    static EVENT: OnceLock<Arc<ResetEvent>> = OnceLock::new();
    EVENT.get_or_init(|| Arc::new(ResetEvent::new(false)))
}

/// A lightweight, copyable view of one cancellation source — or of none.
///
/// Tokens only observe: they can read cancellation state, register
/// callbacks, and wait, but never request cancellation or dispose the
/// source. A sourceless token ([`CancelToken::never`]) is permanently
/// uncancelable and is what APIs should accept when cancellation is
/// optional.
///
/// Cloning is cheap (an `Arc` bump at most). Two tokens compare equal iff
/// they observe the same source instance; all sourceless tokens are equal
/// to each other.
#[derive(Clone, Default)]
pub struct CancelToken {
    core: Option<Arc<SourceCore>>,
}

impl CancelToken {
    /// The canonical token that can never be cancelled.
    #[must_use]
    pub const fn never() -> Self {
        Self { core: None }
    }

    /// A token that was born cancelled.
    ///
    /// All such tokens share one static pre-cancelled source, mirroring how
    /// they compare equal in the runtime this reimplements.
    #[must_use]
    pub fn already_cancelled() -> Self {
        Self {
            core: Some(Arc::clone(cancelled_core())),
        }
    }

    pub(crate) fn from_core(core: Arc<SourceCore>) -> Self {
        Self { core: Some(core) }
    }

    /// Whether cancellation has been requested on the observed source.
    ///
    /// Always false for a sourceless token.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.core.as_ref().is_some_and(|core| core.is_cancelled())
    }

    /// Whether this token could ever observe a cancellation.
    #[must_use]
    pub fn can_be_cancelled(&self) -> bool {
        self.core.is_some()
    }

    /// Returns [`Cancelled`] iff cancellation has been requested.
    ///
    /// The cooperative-cancellation checkpoint: call it at loop heads and
    /// before expensive work, and let `?` unwind the operation.
    ///
    /// # Errors
    ///
    /// [`Cancelled`], carrying this token, once cancellation is requested.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled::new(self.clone()))
        } else {
            Ok(())
        }
    }

    /// Registers `callback` to run when cancellation is requested.
    ///
    /// Callbacks run LIFO — the most recently registered fires first — on
    /// the cancelling thread. Registering on an already-cancelled token
    /// invokes `callback` synchronously before this returns. On a
    /// sourceless or disposed token the callback is dropped and an inert
    /// handle is returned.
    ///
    /// Dropping the returned [`Registration`] does **not** unregister;
    /// membership lasts until the callback fires or
    /// [`Registration::deregister`] removes it.
    pub fn register(&self, callback: impl FnOnce() + Send + 'static) -> Registration {
        self.register_callback(Callback::Bare(Box::new(callback)), None)
    }

    /// Like [`register`](Self::register), but the callback receives a token
    /// for the cancelling source at invoke time.
    pub fn register_with_token(
        &self,
        callback: impl FnOnce(CancelToken) + Send + 'static,
    ) -> Registration {
        self.register_callback(Callback::WithToken(Box::new(callback)), None)
    }

    /// Like [`register`](Self::register), with the callback funneled
    /// through a host-supplied [`AmbientContext`] when it executes.
    ///
    /// Plain [`register`](Self::register) deliberately skips context
    /// capture; this overload is the opt-in.
    pub fn register_with_context(
        &self,
        callback: impl FnOnce() + Send + 'static,
        context: AmbientContext,
    ) -> Registration {
        self.register_callback(Callback::Bare(Box::new(callback)), Some(context))
    }

    fn register_callback(
        &self,
        callback: Callback,
        context: Option<AmbientContext>,
    ) -> Registration {
        match self.core.as_ref() {
            Some(core) => SourceCore::register(core, callback, context),
            None => Registration::inert(),
        }
    }

    /// An OS-blocking event that becomes set when cancellation is
    /// requested. For a sourceless token this is a shared event that never
    /// becomes set.
    #[must_use]
    pub fn wait_handle(&self) -> Arc<ResetEvent> {
        match self.core.as_ref() {
            Some(core) => core.wait_handle(),
            None => Arc::clone(never_event()),
        }
    }

    /// Blocks until cancellation is requested.
    ///
    /// On a sourceless token this blocks forever; check
    /// [`can_be_cancelled`](Self::can_be_cancelled) first when in doubt.
    pub fn wait(&self) {
        self.wait_handle().wait();
    }

    /// Blocks until cancellation is requested or `timeout` elapses.
    ///
    /// Returns whether cancellation was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_handle().wait_timeout(timeout)
    }
}

impl PartialEq for CancelToken {
    fn eq(&self, other: &Self) -> bool {
        match (self.core.as_ref(), other.core.as_ref()) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Eq for CancelToken {}

impl Hash for CancelToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.core.as_ref() {
            Some(core) => (Arc::as_ptr(core) as usize).hash(state),
            None => 0_usize.hash(state),
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.core.as_ref() {
            Some(core) => f
                .debug_struct("CancelToken")
                .field("source", &Arc::as_ptr(core))
                .field("cancelled", &core.is_cancelled())
                .finish(),
            None => f.write_str("CancelToken(never)"),
        }
    }
}

/// One callback's membership in a source's notification list.
///
/// The handle is inert once consumed by [`deregister`] or when it never
/// referred to a live registration (sourceless token, already-cancelled
/// token, disposed source). Dropping the handle leaves the registration in
/// place.
///
/// [`deregister`]: Registration::deregister
#[derive(Debug)]
pub struct Registration {
    inner: Option<RegistrationInner>,
}

#[derive(Debug)]
struct RegistrationInner {
    registry: Arc<CallbackRegistry>,
    id: u64,
    index: u32,
}

impl Registration {
    pub(crate) fn inert() -> Self {
        Self { inner: None }
    }

    pub(crate) fn live(registry: Arc<CallbackRegistry>, id: u64, index: u32) -> Self {
        Self {
            inner: Some(RegistrationInner {
                registry,
                id,
                index,
            }),
        }
    }

    /// Whether this handle still refers to a registration it could remove.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.inner.is_some()
    }

    /// Removes the callback if it has not fired and was not already
    /// removed. Returns whether this call removed it.
    ///
    /// Idempotent: the first call consumes the handle, later calls report
    /// not-found. A callback that is executing right now on another thread
    /// is not waited for; use
    /// [`deregister_and_wait`](Self::deregister_and_wait) for that.
    pub fn deregister(&mut self) -> bool {
        match self.inner.take() {
            Some(inner) => inner.registry.take(inner.id, inner.index).is_some(),
            None => false,
        }
    }

    /// Removes the callback, and if it is mid-execution on another thread,
    /// spins until that execution completes before returning.
    ///
    /// Called from inside the callback itself (self-deregistration on the
    /// draining thread), the wait is skipped — waiting for yourself would
    /// never end. After this returns, the callback is neither running nor
    /// able to run.
    pub fn deregister_and_wait(&mut self) {
        if let Some(inner) = self.inner.take() {
            if inner.registry.take(inner.id, inner.index).is_none() {
                inner.registry.wait_for_callback(inner.id);
            }
        }
    }
}
