#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

/// Environment variable overriding the number of property-test cases.
const PROPTEST_CASES_ENV: &str = "QUELL_PROPTEST_CASES";

/// Initializes tracing output for tests, once per process.
///
/// Controlled by `RUST_LOG`; defaults to `info`. Safe to call from every
/// test.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Number of cases for property tests, overridable via
/// `QUELL_PROPTEST_CASES` for slower CI tiers.
pub fn proptest_cases(default_cases: u32) -> u32 {
    std::env::var(PROPTEST_CASES_ENV)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default_cases)
}
