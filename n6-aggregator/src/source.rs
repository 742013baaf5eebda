use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{AggregatorError, ProcessingError};
use crate::event::{self, Event};
use crate::group::HiFreqEventData;
use crate::payload::{PayloadHandle, PayloadSink, PayloadStorage};

/// Time a group stays open after its latest event.
pub const AGGREGATE_WAIT: Duration = Duration::from_secs(12 * 60 * 60);

/// Time without events after which all groups of a source are flushed.
pub const SOURCE_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// A group that finished aggregating.
///
/// `None` stands for a group of a single event, which was already published and is dropped
/// silently. Otherwise the suppressed event summarizing the group.
pub type Suppressed = Option<Event>;

pub(crate) fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Returns `true` if `time + offset` lies strictly before `bound`.
fn is_before(time: NaiveDateTime, offset: TimeDelta, bound: NaiveDateTime) -> bool {
    time.checked_add_signed(offset)
        .is_some_and(|shifted| shifted < bound)
}

/// Aggregation state of a single source.
///
/// Groups are kept in the order in which they were last touched, so that the groups due to be
/// finished are found at the front.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceData {
    time: Option<NaiveDateTime>,
    last_active: DateTime<Utc>,
    groups: IndexMap<String, HiFreqEventData>,
    buffer: IndexMap<String, HiFreqEventData>,
    time_tolerance: Duration,
}

impl SourceData {
    /// Creates the state of a source that has seen no events yet.
    pub fn new(time_tolerance: Duration, now: DateTime<Utc>) -> Self {
        Self {
            time: None,
            last_active: now,
            groups: IndexMap::new(),
            buffer: IndexMap::new(),
            time_tolerance,
        }
    }

    pub(crate) fn from_parts(
        time: Option<NaiveDateTime>,
        last_active: DateTime<Utc>,
        groups: IndexMap<String, HiFreqEventData>,
        buffer: IndexMap<String, HiFreqEventData>,
        time_tolerance: Duration,
    ) -> Self {
        Self {
            time,
            last_active,
            groups,
            buffer,
            time_tolerance,
        }
    }

    /// The latest event time seen by this source.
    pub fn time(&self) -> Option<NaiveDateTime> {
        self.time
    }

    /// The wall-clock time of the latest accepted event or flush.
    pub fn last_active(&self) -> DateTime<Utc> {
        self.last_active
    }

    /// Groups that are still aggregating events, least recently touched first.
    pub fn groups(&self) -> &IndexMap<String, HiFreqEventData> {
        &self.groups
    }

    /// Groups that stopped aggregating and wait for late events within the time tolerance.
    pub fn buffer(&self) -> &IndexMap<String, HiFreqEventData> {
        &self.buffer
    }

    /// Grace window for late events.
    pub fn time_tolerance(&self) -> Duration {
        self.time_tolerance
    }

    pub(crate) fn set_time_tolerance(&mut self, time_tolerance: Duration) {
        self.time_tolerance = time_tolerance;
    }

    pub(crate) fn handles(&self) -> impl Iterator<Item = PayloadHandle> + '_ {
        self.groups
            .values()
            .chain(self.buffer.values())
            .map(HiFreqEventData::handle)
    }

    pub(crate) fn handles_mut(&mut self) -> impl Iterator<Item = &mut PayloadHandle> + '_ {
        self.groups
            .values_mut()
            .chain(self.buffer.values_mut())
            .map(HiFreqEventData::handle_mut)
    }

    /// Sets the source time to `time` if it is later, and marks the source active.
    fn advance(&mut self, time: NaiveDateTime, now: DateTime<Utc>) {
        if self.time.is_none_or(|current| current < time) {
            self.time = Some(time);
        }
        self.last_active = now;
    }

    /// Moves a group from the open groups into the buffer.
    fn retire(&mut self, key: &str) {
        if let Some((key, group)) = self.groups.shift_remove_entry(key) {
            self.buffer.insert(key, group);
        }
    }

    /// Accounts a new event of this source.
    ///
    /// Returns `true` if the event opened a new group and has to be published, `false` if it was
    /// suppressed into an existing group.
    pub fn process_event(
        &mut self,
        event: &Event,
        sink: &mut PayloadSink<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool, AggregatorError> {
        let key = event::event_group(event)?;
        let event_time = event::event_time(event)?;
        let time = *self.time.get_or_insert(event_time);

        if is_before(event_time, delta(self.time_tolerance), time) {
            return match self.groups.get_mut(key) {
                Some(group) if group.first() <= event_time => {
                    // Behind the watermark, so the source stays as it is.
                    group.add(event_time);
                    Ok(false)
                }
                _ => Err(ProcessingError::EventInPast {
                    source_id: event::event_source(event)
                        .map(str::to_owned)
                        .unwrap_or_default(),
                    time: event_time,
                    watermark: time,
                }
                .into()),
            };
        }

        let Some(group) = self.groups.get(key) else {
            if event_time < time
                && let Some(buffered) = self.buffer.get_mut(key)
            {
                buffered.increment();
                return Ok(false);
            }

            let group = HiFreqEventData::new(event, sink)?;
            self.groups.insert(key.to_owned(), group);
            self.advance(event_time, now);
            return Ok(true);
        };

        if is_before(group.until(), delta(AGGREGATE_WAIT), event_time)
            || event_time.date() > time.date()
        {
            let group = HiFreqEventData::new(event, sink)?;
            self.retire(key);
            self.groups.insert(key.to_owned(), group);
            self.advance(event_time, now);
            return Ok(true);
        }

        if let Some((key, mut group)) = self.groups.shift_remove_entry(key) {
            group.add(event_time);
            self.groups.insert(key, group);
        }
        self.advance(event_time, now);
        Ok(false)
    }

    /// Finishes groups that went stale relative to the source time.
    ///
    /// Groups whose latest event is at least [`AGGREGATE_WAIT`] behind the source time, or that
    /// belong to an earlier day, move to the buffer. Buffered groups older than the time
    /// tolerance are then removed and returned in buffer order.
    pub fn generate_suppressed_events(
        &mut self,
        storage: &PayloadStorage,
    ) -> Result<Vec<Suppressed>, AggregatorError> {
        let Some(time) = self.time else {
            return Ok(Vec::new());
        };

        let cutoff = time.checked_sub_signed(delta(AGGREGATE_WAIT));
        let mut cutoff_check_complete = false;
        let mut retired = Vec::new();

        for (key, group) in &self.groups {
            let expired = cutoff.is_some_and(|cutoff| group.until() <= cutoff);
            if !expired {
                cutoff_check_complete = true;
            }
            if cutoff_check_complete && group.until().date() == time.date() {
                break;
            }
            if expired || group.until().date() < time.date() {
                retired.push(key.clone());
            }
        }

        for key in retired {
            self.retire(&key);
        }

        let mut suppressed = Vec::new();
        let buffer = std::mem::take(&mut self.buffer);
        for (key, group) in buffer {
            if is_before(group.until(), delta(self.time_tolerance), time) {
                suppressed.push(finish(&group, storage)?);
            } else {
                self.buffer.insert(key, group);
            }
        }

        Ok(suppressed)
    }

    /// Finishes all groups of a source that went silent.
    ///
    /// Buffered groups come first, then the open groups, each in their order.
    pub fn generate_suppressed_events_after_inactive(
        &mut self,
        storage: &PayloadStorage,
        now: DateTime<Utc>,
    ) -> Result<Vec<Suppressed>, AggregatorError> {
        let buffer = std::mem::take(&mut self.buffer);
        let groups = std::mem::take(&mut self.groups);

        let suppressed = buffer
            .values()
            .chain(groups.values())
            .map(|group| finish(group, storage))
            .collect::<Result<_, _>>()?;

        self.last_active = now;
        Ok(suppressed)
    }
}

fn finish(group: &HiFreqEventData, storage: &PayloadStorage) -> Result<Suppressed, AggregatorError> {
    if group.count() > 1 {
        group.to_dict(storage).map(Some)
    } else {
        Ok(None)
    }
}
