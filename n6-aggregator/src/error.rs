use std::io;
use std::path::PathBuf;

use chrono::NaiveDateTime;

use crate::transport::TransportError;

/// An event could not be aggregated.
///
/// These errors concern a single input message. The message is rejected and the aggregator
/// carries on with the next one.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    /// The event is older than the watermark of its source and belongs to no open group.
    #[error("event of source {source_id} at {time} belongs to the past (source time is {watermark})")]
    EventInPast {
        /// Id of the source the event was produced by.
        source_id: String,
        /// Time of the event.
        time: NaiveDateTime,
        /// Current time of the source.
        watermark: NaiveDateTime,
    },

    /// A required field of the event is missing or is not a string.
    #[error("event is missing the {0:?} field")]
    MissingField(&'static str),

    /// The event time cannot be parsed.
    #[error("invalid event time {0:?}")]
    InvalidTime(String),

    /// The event source is not of the form `provider.channel`.
    #[error("invalid event source {0:?}")]
    InvalidSource(String),

    /// The message body is not a JSON object.
    #[error("message body is not a valid event")]
    InvalidJson(#[source] serde_json::Error),
}

/// An error of the aggregator.
#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    /// A single event could not be processed.
    #[error(transparent)]
    Processing(#[from] ProcessingError),

    /// The persisted state contradicts itself and cannot be used.
    #[error("aggregator state is inconsistent: {0}")]
    StateIntegrity(String),

    /// A state file could not be read or written.
    #[error("could not access {}", path.display())]
    Persistence {
        /// The file that failed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The index file could not be decoded.
    #[error("could not decode the index file {}", path.display())]
    Decoding {
        /// The index file.
        path: PathBuf,
        /// The underlying decoding error.
        #[source]
        source: rmp_serde::decode::Error,
    },

    /// The aggregation state could not be encoded.
    #[error("could not encode the aggregation state")]
    Encoding(#[source] rmp_serde::encode::Error),

    /// An event payload could not be serialized.
    #[error("could not serialize an event payload")]
    Serialization(#[source] serde_json::Error),

    /// The message transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl AggregatorError {
    pub(crate) fn integrity(message: impl Into<String>) -> Self {
        Self::StateIntegrity(message.into())
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }
}
