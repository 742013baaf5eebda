//! Aggregation of high-frequency events.
//!
//! Some sources report the same observation over and over. The aggregator collapses such
//! repetitions: events of one source sharing the same `_group` key form a group. The first event
//! of a group is published right away. Every further event only increments the group's counter.
//! Once a group finishes, a single `suppressed` event with the number of aggregated events and
//! the time range they cover is published.
//!
//! # Groups
//!
//! Every source keeps a watermark, the latest event time it has seen. A group finishes when its
//! latest event is [`AGGREGATE_WAIT`] behind the watermark of its source, or when the watermark
//! moves on to the next day. Finished groups wait in a buffer for late events until they fall
//! behind the time tolerance of the source. Sources that stay silent for
//! [`SOURCE_INACTIVITY_TIMEOUT`] have all of their groups flushed by a periodic sweep.
//!
//! Events older than the watermark minus the time tolerance are rejected, unless they fall into
//! the range of an open group.
//!
//! # State
//!
//! The state survives restarts in two files: an index file with the groups of every source, and
//! a payload storage holding the first event of every group. See [`AggregatorDataManager`] for how
//! both are replaced without risking a torn state.
//!
//! # Example
//!
//! ```no_run
//! use n6_aggregator::{Aggregator, AggregatorConfig, AggregatorDataManager, StdioTransport};
//!
//! # async fn run() -> Result<(), n6_aggregator::AggregatorError> {
//! let config = AggregatorConfig {
//!     dbpath: "/var/lib/n6/aggregator_db.pk".into(),
//!     ..Default::default()
//! };
//!
//! let manager = AggregatorDataManager::start(config)?;
//! let _outcome = Aggregator::new(manager, StdioTransport::stdio())
//!     .run(std::future::pending())
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod atomic;
mod cleanup;
mod config;
mod data;
mod error;
mod event;
mod group;
mod index;
mod manager;
mod payload;
mod service;
mod source;
mod statsd;
mod transport;

pub use self::cleanup::*;
pub use self::config::*;
pub use self::data::*;
pub use self::error::*;
pub use self::event::*;
pub use self::group::*;
pub use self::manager::*;
pub use self::payload::{PayloadHandle, PayloadSink, PayloadStorage, STORAGE_HEADER_LEN};
pub use self::service::*;
pub use self::source::*;
pub use self::transport::*;
