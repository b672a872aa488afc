//! Quell: cancel-correct cooperative cancellation primitives.
//!
//! # Overview
//!
//! Quell provides the cancellation machinery of a modern runtime library as
//! a standalone crate: a [`CancelSource`] that owns a one-way cancellation
//! state machine and drives callback execution, cheap copyable
//! [`CancelToken`] observers, per-callback [`Registration`] handles, and
//! the spin primitives the engine is built on ([`SpinWait`], [`SpinLock`],
//! [`ResetEvent`]).
//!
//! Cancellation here is a protocol, not a silent flag flip:
//!
//! - **Exactly one drainer**: of all concurrent cancellers, exactly one
//!   thread wins the state transition and executes callbacks; the rest
//!   return immediately having observed cancellation become requested.
//! - **LIFO notification**: the most recently registered callback fires
//!   first, so nested work observes cancellation before the work that
//!   spawned it.
//! - **Exactly-once callbacks**: registrations racing cancellation are
//!   resolved — never dropped, never doubled — and deregistration can wait
//!   out an in-flight execution.
//! - **No silent failures**: callback panics are caught, aggregated, and
//!   surfaced together; nothing disappears.
//!
//! # Example
//!
//! ```
//! use quell::CancelSource;
//! use std::time::Duration;
//!
//! let source = CancelSource::new();
//! let token = source.token();
//!
//! token.register(|| println!("cancelled!"));
//!
//! // A worker polls its checkpoint...
//! assert!(token.checkpoint().is_ok());
//!
//! // ...until the owner cancels (here: after a deadline).
//! source.cancel_after(Duration::ZERO).expect("no callback panicked");
//! assert!(token.checkpoint().is_err());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

pub mod cancel;
pub mod error;
pub mod sync;
mod time;

pub use cancel::{AmbientContext, CancelSource, CancelToken, Registration};
pub use error::{AggregatePanics, CancelError, Cancelled, Disposed, NoParentTokens};
pub use sync::{spin_until, LockError, ResetEvent, SpinLock, SpinWait};
