use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AggregatorError;
use crate::event::{self, Event};
use crate::payload::{PayloadHandle, PayloadSink, PayloadStorage, encode_payload};

/// Field of a suppressed event holding the number of aggregated events.
pub const COUNT_FIELD: &str = "count";
/// Field of a suppressed event holding the time of the last aggregated event.
pub const UNTIL_FIELD: &str = "until";
/// Field of a suppressed event holding the time of the first aggregated event.
pub const FIRST_TIME_FIELD: &str = "_first_time";

/// A group of events sharing the same `_group` key within one source.
///
/// The group keeps the payload of its first event in the [`PayloadStorage`] and counts the
/// events that were suppressed since.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(into = "GroupRepr", try_from = "GroupRepr")]
pub struct HiFreqEventData {
    first: NaiveDateTime,
    until: NaiveDateTime,
    count: u64,
    handle: PayloadHandle,
}

impl HiFreqEventData {
    /// Opens a group with `event` as its first member, storing its payload.
    pub fn new(event: &Event, sink: &mut PayloadSink<'_>) -> Result<Self, AggregatorError> {
        let time = event::event_time(event)?;
        let handle = sink.save(&encode_payload(event)?)?;

        Ok(Self {
            first: time,
            until: time,
            count: 1,
            handle,
        })
    }

    /// Time of the first event.
    pub fn first(&self) -> NaiveDateTime {
        self.first
    }

    /// Time of the latest event.
    pub fn until(&self) -> NaiveDateTime {
        self.until
    }

    /// Number of events in the group.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Location of the first event's payload.
    pub fn handle(&self) -> PayloadHandle {
        self.handle
    }

    /// Counts another event at `time`, moving `until` forward if needed.
    pub(crate) fn add(&mut self, time: NaiveDateTime) {
        self.count += 1;
        self.until = self.until.max(time);
    }

    /// Counts another event without touching `until`.
    pub(crate) fn increment(&mut self) {
        self.count += 1;
    }

    pub(crate) fn handle_mut(&mut self) -> &mut PayloadHandle {
        &mut self.handle
    }

    /// Builds the suppressed event: the stored payload extended with `count`, `until` and
    /// `_first_time`.
    pub fn to_dict(&self, storage: &PayloadStorage) -> Result<Event, AggregatorError> {
        let mut payload = storage.load_event(self.handle)?;
        payload.insert(COUNT_FIELD.to_owned(), Value::from(self.count));
        payload.insert(
            UNTIL_FIELD.to_owned(),
            Value::from(event::format_time(self.until)),
        );
        payload.insert(
            FIRST_TIME_FIELD.to_owned(),
            Value::from(event::format_time(self.first)),
        );
        Ok(payload)
    }
}

/// Compact representation in the index file: times as microseconds since the epoch.
#[derive(Serialize, Deserialize)]
struct GroupRepr(i64, i64, PayloadHandle, u64);

impl From<HiFreqEventData> for GroupRepr {
    fn from(group: HiFreqEventData) -> Self {
        Self(
            group.first.and_utc().timestamp_micros(),
            group.until.and_utc().timestamp_micros(),
            group.handle,
            group.count,
        )
    }
}

impl TryFrom<GroupRepr> for HiFreqEventData {
    type Error = &'static str;

    fn try_from(GroupRepr(first, until, handle, count): GroupRepr) -> Result<Self, Self::Error> {
        let time = |micros| {
            DateTime::from_timestamp_micros(micros)
                .map(|time| time.naive_utc())
                .ok_or("group time out of range")
        };

        Ok(Self {
            first: time(first)?,
            until: time(until)?,
            count,
            handle,
        })
    }
}

impl HiFreqEventData {
    /// Restores a group from times in microseconds since the epoch.
    pub(crate) fn from_micros(
        first: i64,
        until: i64,
        handle: PayloadHandle,
        count: u64,
    ) -> Result<Self, AggregatorError> {
        Self::try_from(GroupRepr(first, until, handle, count)).map_err(AggregatorError::integrity)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;

    use super::*;

    pub fn event(value: Value) -> Event {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_new_group() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = PayloadStorage::open(dir.path().join("db.payload-storage")).unwrap();
        let mut handles = Vec::new();

        let payload = event(json!({
            "source": "abuse-ch.feodotracker",
            "_group": "group1",
            "time": "2017-06-01 10:00:00",
            "id": "c4ca4238a0b923820dcc509a6f75849b",
        }));

        let mut sink = PayloadSink::new(&mut storage, &mut handles);
        let mut group = HiFreqEventData::new(&payload, &mut sink).unwrap();
        assert_eq!(group.count(), 1);
        assert_eq!(group.first(), group.until());
        assert_eq!(handles, [group.handle()]);

        group.add(event::parse_time("2017-06-01 11:00:00").unwrap());
        group.add(event::parse_time("2017-06-01 10:30:00").unwrap());
        group.increment();

        insta::assert_json_snapshot!(group.to_dict(&storage).unwrap(), @r###"
        {
          "_first_time": "2017-06-01 10:00:00",
          "_group": "group1",
          "count": 4,
          "id": "c4ca4238a0b923820dcc509a6f75849b",
          "source": "abuse-ch.feodotracker",
          "time": "2017-06-01 10:00:00",
          "until": "2017-06-01 11:00:00"
        }
        "###);
    }

    #[test]
    fn test_new_group_without_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = PayloadStorage::open(dir.path().join("db.payload-storage")).unwrap();
        let mut handles = Vec::new();

        let mut sink = PayloadSink::new(&mut storage, &mut handles);
        let result = HiFreqEventData::new(&event(json!({"_group": "g"})), &mut sink);

        assert!(matches!(result, Err(AggregatorError::Processing(_))));
        assert!(handles.is_empty());
    }

    #[test]
    fn test_microsecond_representation() {
        let group = HiFreqEventData {
            first: event::parse_time("2017-06-01 10:00:00.000001").unwrap(),
            until: event::parse_time("2017-06-01 10:00:01").unwrap(),
            count: 7,
            handle: PayloadHandle::new(16, 42),
        };

        let bytes = rmp_serde::to_vec(&group).unwrap();
        let restored: HiFreqEventData = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(restored, group);
    }
}
