use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AggregatorError;
use crate::event::{self, Event};
use crate::payload::{PayloadHandle, PayloadSink, PayloadStorage};
use crate::source::{SOURCE_INACTIVITY_TIMEOUT, SourceData, Suppressed, delta};

/// The complete aggregation state: all sources and the handle list of the payload storage.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AggregatorData {
    sources: BTreeMap<String, SourceData>,
    payload_handles: Vec<PayloadHandle>,
    storage_generation: u64,
}

impl AggregatorData {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(
        sources: BTreeMap<String, SourceData>,
        payload_handles: Vec<PayloadHandle>,
        storage_generation: u64,
    ) -> Self {
        Self {
            sources,
            payload_handles,
            storage_generation,
        }
    }

    /// All sources by their id.
    pub fn sources(&self) -> &BTreeMap<String, SourceData> {
        &self.sources
    }

    /// Returns the state of the given source.
    pub fn source(&self, source_id: &str) -> Option<&SourceData> {
        self.sources.get(source_id)
    }

    /// Handles of all records in the payload storage, in the order they were written.
    pub fn payload_handles(&self) -> &[PayloadHandle] {
        &self.payload_handles
    }

    pub(crate) fn payload_handles_mut(&mut self) -> &mut Vec<PayloadHandle> {
        &mut self.payload_handles
    }

    pub(crate) fn set_payload_handles(&mut self, handles: Vec<PayloadHandle>) {
        self.payload_handles = handles;
    }

    /// Generation of the payload storage this state refers to.
    pub fn storage_generation(&self) -> u64 {
        self.storage_generation
    }

    pub(crate) fn set_storage_generation(&mut self, generation: u64) {
        self.storage_generation = generation;
    }

    pub(crate) fn sources_mut(&mut self) -> impl Iterator<Item = (&String, &mut SourceData)> {
        self.sources.iter_mut()
    }

    /// Handles referenced by any group or buffered group.
    pub(crate) fn live_handles(&self) -> impl Iterator<Item = PayloadHandle> + '_ {
        self.sources.values().flat_map(SourceData::handles)
    }

    /// Points every group at the new location of its payload.
    pub(crate) fn relocate_payloads(
        &mut self,
        relocated: &HashMap<PayloadHandle, PayloadHandle>,
    ) -> Result<(), AggregatorError> {
        for handle in self.sources.values_mut().flat_map(SourceData::handles_mut) {
            let moved = *relocated.get(handle).ok_or_else(|| {
                AggregatorError::integrity(format!(
                    "payload at offset {} was not relocated",
                    handle.offset()
                ))
            })?;
            *handle = moved;
        }

        Ok(())
    }

    /// Accounts a new event, creating the state of its source on first sight.
    ///
    /// `time_tolerance` applies only if the source is new. Returns `true` if the event has to be
    /// published.
    pub fn process_new_message(
        &mut self,
        event: &Event,
        time_tolerance: Duration,
        storage: &mut PayloadStorage,
        now: DateTime<Utc>,
    ) -> Result<bool, AggregatorError> {
        let source_id = event::event_source(event)?;
        event::event_group(event)?;
        event::event_time(event)?;

        let Self {
            sources,
            payload_handles,
            ..
        } = self;

        let source = sources
            .entry(source_id.to_owned())
            .or_insert_with(|| SourceData::new(time_tolerance, now));

        source.process_event(event, &mut PayloadSink::new(storage, payload_handles), now)
    }

    /// Finishes stale groups of the source the event belongs to.
    pub fn generate_suppressed_events_for_source(
        &mut self,
        event: &Event,
        storage: &PayloadStorage,
    ) -> Result<Vec<Suppressed>, AggregatorError> {
        let source_id = event::event_source(event)?;

        match self.sources.get_mut(source_id) {
            Some(source) => source.generate_suppressed_events(storage),
            None => Ok(Vec::new()),
        }
    }

    /// Finishes all groups of sources without activity for [`SOURCE_INACTIVITY_TIMEOUT`].
    pub fn generate_suppressed_events_after_timeout(
        &mut self,
        storage: &PayloadStorage,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, Suppressed)>, AggregatorError> {
        let timeout = delta(SOURCE_INACTIVITY_TIMEOUT);
        let mut suppressed = Vec::new();

        for (source_id, source) in &mut self.sources {
            let inactive = source
                .last_active()
                .checked_add_signed(timeout)
                .is_some_and(|deadline| deadline < now);

            if inactive {
                n6_log::debug!(source = source_id.as_str(), "flushing inactive source");
                for event in source.generate_suppressed_events_after_inactive(storage, now)? {
                    suppressed.push((source_id.clone(), event));
                }
            }
        }

        Ok(suppressed)
    }

    /// Summarizes the state for operators.
    pub fn summary(&self) -> StateSummary {
        let sources = self
            .sources
            .iter()
            .map(|(source_id, source)| {
                let summary = SourceSummary {
                    time: source.time().map(event::format_time),
                    last_active: source.last_active(),
                    groups: source.groups().len(),
                    buffered: source.buffer().len(),
                    time_tolerance: source.time_tolerance().as_secs(),
                };
                (source_id.clone(), summary)
            })
            .collect();

        StateSummary {
            sources,
            payloads: self.payload_handles.len(),
            live_payloads: self.live_handles().count(),
            payload_bytes: self.payload_handles.last().map_or(0, PayloadHandle::end),
        }
    }
}

/// Overview of an [`AggregatorData`].
#[derive(Debug, Serialize)]
pub struct StateSummary {
    /// Overview of every source.
    pub sources: BTreeMap<String, SourceSummary>,
    /// Number of records in the payload storage.
    pub payloads: usize,
    /// Number of records still referenced by a group.
    pub live_payloads: usize,
    /// Size of the payload storage in bytes.
    pub payload_bytes: u64,
}

/// Overview of a single source.
#[derive(Debug, Serialize)]
pub struct SourceSummary {
    /// Latest event time.
    pub time: Option<String>,
    /// Time of the latest activity.
    pub last_active: DateTime<Utc>,
    /// Number of open groups.
    pub groups: usize,
    /// Number of buffered groups.
    pub buffered: usize,
    /// Time tolerance in seconds.
    pub time_tolerance: u64,
}
