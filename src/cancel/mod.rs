//! Cooperative cancellation: sources, tokens, registrations.
//!
//! Cancellation is a protocol, not a flag: a [`CancelSource`] owns a
//! one-way state machine, [`CancelToken`]s observe it, and registered
//! callbacks are drained exactly once, in reverse registration order, by
//! the single thread that wins the cancellation transition. Concurrent
//! registration, deregistration, cancellation, and source teardown resolve
//! to well-defined outcomes rather than errors.
//!
//! # Pieces
//!
//! - [`CancelSource`]: owner; cancel now, after a delay, or when any
//!   linked parent cancels
//! - [`CancelToken`]: cheap copyable observer; checkpointing, callback
//!   registration, OS-level waiting
//! - [`Registration`]: one callback's membership, removable early
//! - [`AmbientContext`]: opaque host capability restored around callbacks
//!   that ask for it

mod callback;
mod registry;
mod source;
mod token;

pub use callback::AmbientContext;
pub use source::CancelSource;
pub use token::{CancelToken, Registration};
