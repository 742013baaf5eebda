//! The n6 aggregator.
//!
//! Reads events as JSON lines from standard input and writes the published events to standard
//! output, one `<routing key>\t<json body>` line each. See [`n6_aggregator`] for how events are
//! aggregated.
//!
//! ```text
//! n6 run --config /etc/n6/aggregator
//! ```
//!
//! The exit status is `0` when the aggregator stopped gracefully or asks to be restarted, and `1`
//! on any error. A supervisor is expected to start it again in both cases.

mod cli;
mod cliapp;
mod setup;

use std::process;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            n6_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
