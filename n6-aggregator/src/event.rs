//! Event payloads and their fields.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Timelike};
use serde_json::Value;

use crate::error::ProcessingError;

/// An event payload: a JSON object with at least `source`, `_group` and `time`.
pub type Event = serde_json::Map<String, Value>;

/// Field holding the id of the source which produced an event.
pub const SOURCE_FIELD: &str = "source";
/// Field holding the aggregation key of an event.
pub const GROUP_FIELD: &str = "_group";
/// Field holding the time of an event.
pub const TIME_FIELD: &str = "time";
/// Field holding the kind of a published event.
pub const TYPE_FIELD: &str = "type";

/// Output format of event times without sub-second precision.
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Output format of event times with a microsecond fraction.
const TIME_FORMAT_MICROS: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Kind of an event published by the aggregator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    /// The first event of a new group, published as-is.
    Event,
    /// The summary of a finished group of more than one event.
    Suppressed,
}

impl EventKind {
    /// Returns the name of the kind, used for the `type` field and routing keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Suppressed => "suppressed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses a message body into an event.
pub fn decode_event(body: &[u8]) -> Result<Event, ProcessingError> {
    serde_json::from_slice(body).map_err(ProcessingError::InvalidJson)
}

fn string_field<'a>(event: &'a Event, field: &'static str) -> Result<&'a str, ProcessingError> {
    event
        .get(field)
        .and_then(Value::as_str)
        .ok_or(ProcessingError::MissingField(field))
}

/// Returns the aggregation key of the event.
pub fn event_group(event: &Event) -> Result<&str, ProcessingError> {
    string_field(event, GROUP_FIELD)
}

/// Returns the source id of the event, validated to be of the form `provider.channel`.
pub fn event_source(event: &Event) -> Result<&str, ProcessingError> {
    let source = string_field(event, SOURCE_FIELD)?;
    match source.split_once('.') {
        Some((provider, channel))
            if !provider.is_empty() && !channel.is_empty() && !channel.contains('.') =>
        {
            Ok(source)
        }
        _ => Err(ProcessingError::InvalidSource(source.to_owned())),
    }
}

/// Returns the time of the event.
pub fn event_time(event: &Event) -> Result<NaiveDateTime, ProcessingError> {
    let value = string_field(event, TIME_FIELD)?;
    parse_time(value).ok_or_else(|| ProcessingError::InvalidTime(value.to_owned()))
}

/// Parses an event time.
///
/// Accepts `YYYY-MM-DD HH:MM:SS` with a space or `T` separator, an optional fraction and an
/// optional `Z` or UTC offset. Zoned times are converted to UTC. The result is truncated to
/// microseconds.
pub fn parse_time(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();

    let parsed = ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%.f%:z"]
        .iter()
        .find_map(|format| DateTime::parse_from_str(value, format).ok())
        .map(|time| time.naive_utc())
        .or_else(|| {
            let value = value.strip_suffix('Z').unwrap_or(value);
            ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        })?;

    parsed.with_nanosecond(parsed.nanosecond() / 1_000 * 1_000)
}

/// Formats an event time, appending microseconds only if there are any.
pub fn format_time(time: NaiveDateTime) -> String {
    if time.nanosecond() / 1_000 == 0 {
        time.format(TIME_FORMAT).to_string()
    } else {
        time.format(TIME_FORMAT_MICROS).to_string()
    }
}

/// Returns the routing key for publishing an event of the given kind and source.
pub fn routing_key(kind: EventKind, source: &str) -> String {
    format!("{kind}.aggregated.{source}")
}
