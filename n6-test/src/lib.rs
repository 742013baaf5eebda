//! Helpers for testing the aggregator.
//!
//! In every test that should show logs, call [`setup`]. All console output is then captured by
//! the test runner and logs emitted with [`n6_log`] show up for test failures or when run with
//! `--nocapture`.
//!
//! # Example
//!
//! ```no_run
//! #[test]
//! fn my_test() {
//!     n6_test::setup();
//!
//!     n6_log::debug!("hello, world!");
//! }
//! ```

#![warn(missing_docs)]

/// Setup the test environment.
///
///  - Initializes logs: The logger captures logs from the n6 crates and mutes all other logs.
pub fn setup() {
    n6_log::init_test!();
}
