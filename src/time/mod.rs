//! Deferred-cancellation timing.
//!
//! Internal module: the only consumer is the cancellation source, which
//! owns at most one [`OneShotTimer`] for its `cancel_after` deadline.

mod driver;

pub(crate) use driver::OneShotTimer;
