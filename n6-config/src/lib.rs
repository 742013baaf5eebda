//! Configuration for the n6 aggregator CLI.
//!
//! The configuration is read from a `config.yml` file inside a config folder. It has one section
//! per concern:
//!
//! ```yaml
//! logging:
//!   level: info
//!   format: auto
//! metrics:
//!   statsd: 127.0.0.1:8125
//!   prefix: n6
//! aggregator:
//!   dbpath: /var/lib/n6/aggregator/aggregator_db.pk
//!   time_tolerance: 600
//!   time_tolerance_per_source:
//!     abuse-ch.feodotracker: 0
//!   finished_groups_count_triggering_restart: 10000000
//!   tick_interval: 3600
//!   legacy_cleanup: false
//! ```
//!
//! All sections and fields except for `aggregator.dbpath` are optional. Relative paths are
//! resolved against the config folder.

#![warn(missing_docs)]

mod config;

pub use self::config::*;
