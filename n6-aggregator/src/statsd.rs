use n6_statsd::{CounterMetric, GaugeMetric, TimerMetric};

/// Counter metrics of the aggregator.
pub enum AggregatorCounters {
    /// Incremented for every message received from the transport.
    MessagesReceived,
    /// Incremented for every message that was rejected.
    ///
    /// This metric is tagged with:
    ///  - `reason`: The kind of processing error.
    MessagesRejected,
    /// Incremented for every event that opened a new group.
    GroupsOpened,
    /// Incremented for every event that was counted into an existing group.
    EventsSuppressed,
    /// Incremented for every group that finished aggregating.
    GroupsFinished,
    /// Incremented for every published event.
    ///
    /// This metric is tagged with:
    ///  - `kind`: Either `event` or `suppressed`.
    EventsPublished,
}

impl CounterMetric for AggregatorCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::MessagesReceived => "aggregator.messages.received",
            Self::MessagesRejected => "aggregator.messages.rejected",
            Self::GroupsOpened => "aggregator.groups.opened",
            Self::EventsSuppressed => "aggregator.events.suppressed",
            Self::GroupsFinished => "aggregator.groups.finished",
            Self::EventsPublished => "aggregator.events.published",
        }
    }
}

/// Gauge metrics of the aggregator state.
pub enum AggregatorGauges {
    /// Number of known sources.
    Sources,
    /// Number of groups still aggregating events.
    OpenGroups,
    /// Number of groups waiting for late events.
    BufferedGroups,
    /// Number of records in the payload storage, including unreferenced ones.
    Payloads,
    /// Size of the payload storage in bytes.
    StorageBytes,
}

impl GaugeMetric for AggregatorGauges {
    fn name(&self) -> &'static str {
        match self {
            Self::Sources => "aggregator.sources",
            Self::OpenGroups => "aggregator.groups.open",
            Self::BufferedGroups => "aggregator.groups.buffered",
            Self::Payloads => "aggregator.payloads",
            Self::StorageBytes => "aggregator.storage.bytes",
        }
    }
}

/// Timer metrics of the aggregator.
pub enum AggregatorTimers {
    /// Time spent compacting the payload storage and replacing both state files.
    Shrink,
    /// Time spent writing the index file.
    WriteIndex,
    /// Time spent in the periodic inactivity sweep.
    Tick,
}

impl TimerMetric for AggregatorTimers {
    fn name(&self) -> &'static str {
        match self {
            Self::Shrink => "aggregator.shrink",
            Self::WriteIndex => "aggregator.write_index",
            Self::Tick => "aggregator.tick",
        }
    }
}
