//! Error types for the cancellation engine.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Cancellation itself is a control-flow signal ([`Cancelled`]), never a
//!   defect
//! - Panics inside registered callbacks are isolated with `catch_unwind`
//!   and surfaced together ([`AggregatePanics`]), never silently dropped
//! - Expected concurrent interleavings (drop racing register, a timer
//!   firing into a disposed source) resolve to tolerated outcomes, not
//!   errors; [`Disposed`] only appears where a disposed core is genuinely
//!   reachable

use std::any::Any;
use std::fmt;

use crate::cancel::CancelToken;

/// Control-flow signal returned by [`CancelToken::checkpoint`] once
/// cancellation has been requested.
///
/// Carries the observing token so an error chain can identify which
/// cancellation tripped.
#[derive(Debug, Clone, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled {
    token: CancelToken,
}

impl Cancelled {
    pub(crate) fn new(token: CancelToken) -> Self {
        Self { token }
    }

    /// The token whose cancellation produced this signal.
    #[must_use]
    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

/// The cancellation source backing an operation has already been disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cancellation source has been disposed")]
pub struct Disposed;

/// [`CancelSource::linked`](crate::CancelSource::linked) was called with an
/// empty token slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no parent tokens supplied")]
pub struct NoParentTokens;

/// One or more registered callbacks panicked while a cancellation drain ran
/// to completion.
///
/// Payloads are collected in execution (most-recently-registered-first)
/// order. Nothing is dropped: every payload a drain pass caught is here.
pub struct AggregatePanics {
    payloads: Vec<Box<dyn Any + Send>>,
}

impl AggregatePanics {
    pub(crate) fn new(payloads: Vec<Box<dyn Any + Send>>) -> Self {
        debug_assert!(!payloads.is_empty());
        Self { payloads }
    }

    /// Number of callbacks that panicked during the drain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    /// Always false: an empty aggregate is never constructed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// The raw panic payloads, in execution order.
    #[must_use]
    pub fn payloads(&self) -> &[Box<dyn Any + Send>] {
        &self.payloads
    }

    /// Consumes the aggregate, yielding the raw payloads for re-raising.
    #[must_use]
    pub fn into_payloads(self) -> Vec<Box<dyn Any + Send>> {
        self.payloads
    }

    /// Best-effort string rendering of each payload (the common `panic!`
    /// message forms), with a placeholder for opaque payloads.
    #[must_use]
    pub fn messages(&self) -> Vec<&str> {
        self.payloads
            .iter()
            .map(|payload| {
                if let Some(message) = payload.downcast_ref::<&'static str>() {
                    *message
                } else if let Some(message) = payload.downcast_ref::<String>() {
                    message.as_str()
                } else {
                    "<non-string panic payload>"
                }
            })
            .collect()
    }
}

impl fmt::Debug for AggregatePanics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatePanics")
            .field("count", &self.payloads.len())
            .field("messages", &self.messages())
            .finish()
    }
}

impl fmt::Display for AggregatePanics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cancellation callback(s) panicked", self.payloads.len())
    }
}

impl std::error::Error for AggregatePanics {}

/// Failure modes of driving a source to the cancelled state.
#[derive(Debug, thiserror::Error)]
pub enum CancelError {
    /// The source was disposed before the cancellation could be requested.
    #[error(transparent)]
    Disposed(#[from] Disposed),
    /// The drain completed, but callbacks panicked along the way.
    #[error(transparent)]
    CallbackPanics(#[from] AggregatePanics),
}
