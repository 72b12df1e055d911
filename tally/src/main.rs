//! <p align="center">
//!   <strong>tally</strong>: application events as statsd metrics.
//! </p>
//!
//! Tally maps named application events to statsd metrics. Every configured client owns a set of
//! metric rules per event and reports to one or more statsd servers.
//!
//! # Crates
//!
//! - [`tally-config`]: Configuration file, servers and clients.
//! - [`tally-dispatch`]: Metric rules, name templates and the dispatch engine.
//! - [`tally-log`]: Logging facade and setup.
//! - [`tally-protocol`]: Events, values and path-based field access.
//! - [`tally-statsd`]: Statsd transport built on cadence.
//!
//! [`tally-config`]: ../tally_config/index.html
//! [`tally-dispatch`]: ../tally_dispatch/index.html
//! [`tally-log`]: ../tally_log/index.html
//! [`tally-protocol`]: ../tally_protocol/index.html
//! [`tally-statsd`]: ../tally_statsd/index.html

mod cli;
mod cliapp;
mod console;
mod setup;

use std::process;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(exit_code) => exit_code,
        Err(err) => {
            tally_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
