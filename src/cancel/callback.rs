//! Callback representation and the opaque ambient-context capability.

use std::fmt;
use std::sync::Arc;

use super::token::CancelToken;

/// A registered cancellation callback.
///
/// Tagged by signature instead of downcasting a common delegate type: the
/// drain loop matches once and calls directly. Explicit state arguments are
/// not modeled — closures capture their state — so the only distinction
/// that survives is whether the callback wants the observing token handed
/// to it at invoke time.
pub(crate) enum Callback {
    /// Plain callback.
    Bare(Box<dyn FnOnce() + Send>),
    /// Callback invoked with a token for the cancelling source.
    WithToken(Box<dyn FnOnce(CancelToken) + Send>),
}

impl Callback {
    /// Runs the callback exactly once, consuming it.
    pub(crate) fn invoke(self, token: CancelToken) {
        match self {
            Self::Bare(f) => f(),
            Self::WithToken(f) => f(token),
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bare(_) => f.write_str("Callback::Bare"),
            Self::WithToken(_) => f.write_str("Callback::WithToken"),
        }
    }
}

/// Opaque ambient-context capability supplied by the host.
///
/// The host captures whatever ambient state it cares about and wraps a
/// runner that restores it around an arbitrary body. A callback registered
/// with a context is funneled through that runner when it executes; the
/// crate never inspects what the runner restores.
///
/// # Example
///
/// ```
/// use quell::AmbientContext;
///
/// // A runner that brackets the callback with host bookkeeping.
/// let ctx = AmbientContext::new(|body| {
///     // restore captured state here
///     body();
///     // tear it down here
/// });
/// ```
#[derive(Clone)]
pub struct AmbientContext {
    runner: Arc<dyn Fn(&mut dyn FnMut()) + Send + Sync>,
}

impl AmbientContext {
    /// Wraps a host-supplied restore-and-run capability.
    pub fn new(runner: impl Fn(&mut dyn FnMut()) + Send + Sync + 'static) -> Self {
        Self {
            runner: Arc::new(runner),
        }
    }

    /// Runs `body` inside the captured context.
    pub(crate) fn run(&self, body: &mut dyn FnMut()) {
        (self.runner)(body);
    }
}

impl fmt::Debug for AmbientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AmbientContext")
    }
}
