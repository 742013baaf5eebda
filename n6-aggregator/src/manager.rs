use std::fs;
use std::io::{self, Write};
use std::time::Instant;

use chrono::{DateTime, Utc};
use n6_log::LogError;
use n6_statsd::metric;

use crate::atomic::{self, AtomicFile, SigintGuard};
use crate::config::AggregatorConfig;
use crate::data::{AggregatorData, StateSummary};
use crate::error::AggregatorError;
use crate::event::{self, Event};
use crate::index::{self, DecodedIndex};
use crate::payload::PayloadStorage;
use crate::source::Suppressed;
use crate::statsd::{AggregatorCounters, AggregatorGauges, AggregatorTimers};

/// Owner of the aggregation state and its two files.
///
/// The state consists of the index file at the configured `dbpath` and the payload storage next
/// to it. Both are only ever replaced atomically. When both have to be replaced, the index file
/// goes first; a failure between the two renames leaves a pair that needs manual recovery and is
/// reported as [`AggregatorError::StateIntegrity`]. The index file records the generation of its
/// payload storage, so restoring such a pair fails as well.
#[derive(Debug)]
pub struct AggregatorDataManager {
    config: AggregatorConfig,
    storage: PayloadStorage,
    data: AggregatorData,
}

impl AggregatorDataManager {
    /// Opens the payload storage, creating it if needed, with an empty state.
    ///
    /// Call [`restore_state`](Self::restore_state) to load the persisted state.
    pub fn open(config: AggregatorConfig) -> Result<Self, AggregatorError> {
        let storage = PayloadStorage::open(config.storage_path())?;
        Ok(Self {
            config,
            storage,
            data: AggregatorData::new(),
        })
    }

    /// Opens the persisted state and brings it into shape for processing.
    ///
    /// Combines [`open`](Self::open), [`restore_state`](Self::restore_state) and
    /// [`maintain_state`](Self::maintain_state).
    pub fn start(config: AggregatorConfig) -> Result<Self, AggregatorError> {
        let mut manager = Self::open(config)?;
        let shall_shrink = manager.restore_state()?;
        manager.maintain_state(shall_shrink)?;
        Ok(manager)
    }

    /// The current aggregation state.
    pub fn data(&self) -> &AggregatorData {
        &self.data
    }

    /// The payload storage.
    pub fn storage(&self) -> &PayloadStorage {
        &self.storage
    }

    /// The configuration of the aggregator.
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Loads the state from the index file.
    ///
    /// A missing index file yields an empty state and clears the payload storage. Legacy index
    /// files are migrated. The payload storage must be of the generation recorded in the index.
    /// Bytes in the storage beyond the last known record are left over from an interrupted write
    /// and are cut off.
    ///
    /// Returns `true` if the payload storage should be compacted, either because the state was
    /// migrated or because it contains records no group refers to.
    pub fn restore_state(&mut self) -> Result<bool, AggregatorError> {
        let index_path = self.config.index_path().to_owned();

        let bytes = match fs::read(&index_path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                n6_log::info!(
                    path = %index_path.display(),
                    "no aggregator state found, starting with an empty state",
                );
                self.data = AggregatorData::new();
                let generation = self.data.storage_generation();
                self.storage
                    .clear(generation, self.data.payload_handles_mut())?;
                return Ok(false);
            }
            Err(error) => {
                n6_log::error!(
                    error = &error as &dyn std::error::Error,
                    path = %index_path.display(),
                    "failed to read the aggregator state",
                );
                return Err(AggregatorError::persistence(index_path, error));
            }
        };

        let (mut data, migrated) = match index::decode_index(&bytes, &index_path) {
            Ok(DecodedIndex::Current(data)) => (data, false),
            Ok(DecodedIndex::Legacy(legacy)) => {
                n6_log::info!("migrating aggregator state from the legacy format");
                (legacy.migrate(&mut self.storage)?, true)
            }
            Err(error) => {
                n6_log::error!(
                    path = %index_path.display(),
                    "failed to restore the aggregator state: {}",
                    LogError(&error),
                );
                return Err(error);
            }
        };

        self.check_storage(&data).inspect_err(|error| {
            n6_log::error!(
                index = %index_path.display(),
                storage = %self.storage.path().display(),
                "payload storage does not match the aggregator state: {}",
                LogError(error),
            );
        })?;

        for (source_id, source) in data.sources_mut() {
            source.set_time_tolerance(self.config.time_tolerance_for(source_id));
        }

        let live = data.live_handles().count();
        let unreferenced = data.payload_handles().len().saturating_sub(live);
        n6_log::info!(
            sources = data.sources().len(),
            payloads = data.payload_handles().len(),
            unreferenced,
            "restored aggregator state",
        );

        self.data = data;
        self.report_gauges();
        Ok(migrated || unreferenced > 0)
    }

    /// Verifies that the payload storage belongs to `data` and that its handles cover the
    /// storage without gaps.
    fn check_storage(&mut self, data: &AggregatorData) -> Result<(), AggregatorError> {
        let expected = data.storage_generation();
        match self.storage.generation() {
            Some(generation) if generation == expected => {}
            Some(generation) => {
                return Err(AggregatorError::integrity(format!(
                    "payload storage {} has generation {generation} but the index file refers \
                     to generation {expected}",
                    self.storage.path().display(),
                )));
            }
            None => {
                return Err(AggregatorError::integrity(format!(
                    "payload storage {} has no valid header",
                    self.storage.path().display(),
                )));
            }
        }

        let mut end = 0;
        for handle in data.payload_handles() {
            if handle.offset() != end || handle.size() == 0 {
                return Err(AggregatorError::integrity(format!(
                    "payload handle at offset {} does not follow its predecessor ending at {end}",
                    handle.offset(),
                )));
            }
            end = handle.try_end()?;
        }

        let len = self.storage.len();
        if len < end {
            return Err(AggregatorError::integrity(format!(
                "payload storage {} has {len} bytes but the state refers to {end} bytes",
                self.storage.path().display(),
            )));
        }

        if len > end {
            n6_log::warn!(
                path = %self.storage.path().display(),
                expected = end,
                actual = len,
                "discarding trailing bytes of the payload storage",
            );
            self.storage.truncate(end)?;
        }

        Ok(())
    }

    /// Persists the state and optionally compacts the payload storage.
    ///
    /// Without compaction, only the index file is replaced. With compaction, the live payloads
    /// are copied into a storage file of the next generation and both files are replaced, index
    /// file first. The renames are not interrupted by `SIGINT`. The in-memory state switches to
    /// the compacted storage only once both files are in place.
    pub fn maintain_state(&mut self, shall_shrink: bool) -> Result<(), AggregatorError> {
        if !shall_shrink {
            self.write_index()?;
            return self.storage.reopen();
        }

        let started = Instant::now();
        let before = self.storage.len();

        let mut storage_file = AtomicFile::new(&self.config.storage_path())?;
        let mut index_file = AtomicFile::new(self.config.index_path())?;

        let mut compacted = self.data.clone();
        let written = self.storage.shrink(&mut storage_file, &mut compacted)?;
        let encoded = index::encode_index(&compacted)?;
        index_file
            .write_all(&encoded)
            .map_err(|e| AggregatorError::persistence(index_file.target(), e))?;

        storage_file.sync()?;
        index_file.sync()?;

        {
            let _guard = SigintGuard::new();

            let index_path = index_file.target().to_owned();
            index_file.commit()?;

            let storage_path = storage_file.target().to_owned();
            if let Err(error) = storage_file.commit() {
                n6_log::error!(
                    index = %index_path.display(),
                    storage = %storage_path.display(),
                    "index file was replaced but the payload storage was not, \
                     manual recovery is required: {}",
                    LogError(&error),
                );
                return Err(AggregatorError::integrity(format!(
                    "index file {} was replaced but payload storage {} was not: {error}",
                    index_path.display(),
                    storage_path.display(),
                )));
            }
        }

        self.data = compacted;
        self.storage.reopen()?;
        if self.storage.len() != written
            || self.storage.generation() != Some(self.data.storage_generation())
        {
            return Err(AggregatorError::integrity(format!(
                "compacted payload storage {} has {} bytes instead of {written}",
                self.storage.path().display(),
                self.storage.len(),
            )));
        }

        n6_log::info!(before, after = written, "compacted payload storage");
        metric!(timer(AggregatorTimers::Shrink) = started.elapsed());
        self.report_gauges();
        Ok(())
    }

    /// Persists the state before shutting down.
    ///
    /// The payload storage is closed and only the index file is replaced.
    pub fn store_state(&mut self) -> Result<(), AggregatorError> {
        self.storage.close();
        self.write_index()?;
        n6_log::info!("stored aggregator state");
        Ok(())
    }

    fn write_index(&self) -> Result<(), AggregatorError> {
        let started = Instant::now();
        let encoded = index::encode_index(&self.data)?;
        atomic::write_atomically(self.config.index_path(), &encoded).inspect_err(|error| {
            n6_log::error!("failed to write the index file: {}", LogError(error));
        })?;
        metric!(timer(AggregatorTimers::WriteIndex) = started.elapsed());
        Ok(())
    }

    /// Accounts a new event. Returns `true` if the event has to be published.
    pub fn process_new_message(
        &mut self,
        event: &Event,
        now: DateTime<Utc>,
    ) -> Result<bool, AggregatorError> {
        let source_id = event::event_source(event)?;
        let time_tolerance = self.config.time_tolerance_for(source_id);
        let is_new = self
            .data
            .process_new_message(event, time_tolerance, &mut self.storage, now)?;

        if is_new {
            metric!(counter(AggregatorCounters::GroupsOpened) += 1);
        } else {
            metric!(counter(AggregatorCounters::EventsSuppressed) += 1);
        }

        Ok(is_new)
    }

    /// Finishes stale groups of the event's source.
    pub fn generate_suppressed_events_for_source(
        &mut self,
        event: &Event,
    ) -> Result<Vec<Suppressed>, AggregatorError> {
        self.data
            .generate_suppressed_events_for_source(event, &self.storage)
    }

    /// Finishes all groups of inactive sources.
    pub fn generate_suppressed_events_after_timeout(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, Suppressed)>, AggregatorError> {
        let suppressed = self
            .data
            .generate_suppressed_events_after_timeout(&self.storage, now)?;
        self.report_gauges();
        Ok(suppressed)
    }

    /// Summarizes the current state.
    pub fn summary(&self) -> StateSummary {
        self.data.summary()
    }

    /// Reports the size of the state.
    pub fn report_gauges(&self) {
        let data = &self.data;
        let (groups, buffered) = data.sources().values().fold((0, 0), |(g, b), source| {
            (g + source.groups().len(), b + source.buffer().len())
        });

        metric!(gauge(AggregatorGauges::Sources) = data.sources().len() as u64);
        metric!(gauge(AggregatorGauges::OpenGroups) = groups as u64);
        metric!(gauge(AggregatorGauges::BufferedGroups) = buffered as u64);
        metric!(gauge(AggregatorGauges::Payloads) = data.payload_handles().len() as u64);
        metric!(gauge(AggregatorGauges::StorageBytes) = self.storage.len());
    }
}

/// Reads the state without modifying any file.
///
/// Legacy index files are not supported, since migrating them writes to the payload storage.
pub fn inspect_state(config: &AggregatorConfig) -> Result<StateSummary, AggregatorError> {
    let path = config.index_path();
    let bytes = fs::read(path).map_err(|e| AggregatorError::persistence(path, e))?;

    match index::decode_index(&bytes, path)? {
        DecodedIndex::Current(data) => Ok(data.summary()),
        DecodedIndex::Legacy(_) => Err(AggregatorError::integrity(format!(
            "index file {} is in the legacy format, start the aggregator once to migrate it",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::json;

    use super::*;
    use crate::group::tests::event;
    use crate::index::tests::legacy_index;
    use crate::payload::{PayloadHandle, STORAGE_HEADER_LEN};

    fn config(dir: &Path) -> AggregatorConfig {
        AggregatorConfig {
            dbpath: dir.join("aggregator_db.pk"),
            ..Default::default()
        }
    }

    fn now() -> DateTime<Utc> {
        "2017-06-02T00:00:00Z".parse().unwrap()
    }

    fn process(manager: &mut AggregatorDataManager, group: &str, time: &str) -> bool {
        let event = event(json!({
            "source": "abuse-ch.feodotracker",
            "_group": group,
            "time": time,
        }));
        manager.process_new_message(&event, now()).unwrap()
    }

    #[test]
    fn test_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        fs::write(config.storage_path(), b"leftover").unwrap();

        let mut manager = AggregatorDataManager::open(config.clone()).unwrap();
        assert!(!manager.restore_state().unwrap());
        assert!(manager.storage().is_empty());

        manager.maintain_state(false).unwrap();
        assert!(config.index_path().exists());
    }

    #[test]
    fn test_store_and_restore() {
        n6_test::setup();
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let mut manager = AggregatorDataManager::start(config.clone()).unwrap();
        assert!(process(&mut manager, "g1", "2017-06-01 10:00:00"));
        assert!(!process(&mut manager, "g1", "2017-06-01 10:05:00"));
        assert!(process(&mut manager, "g2", "2017-06-01 10:06:00"));
        manager.store_state().unwrap();

        let mut restored = AggregatorDataManager::open(config).unwrap();
        assert!(!restored.restore_state().unwrap());

        let source = restored.data().source("abuse-ch.feodotracker").unwrap();
        assert_eq!(source.groups()["g1"].count(), 2);
        assert_eq!(
            restored.data().payload_handles(),
            manager.data().payload_handles()
        );

        let suppressed = source.groups()["g1"].to_dict(restored.storage()).unwrap();
        assert_eq!(suppressed["_group"], "g1");
    }

    #[test]
    fn test_restore_applies_configured_tolerance() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());

        let mut manager = AggregatorDataManager::start(config.clone()).unwrap();
        process(&mut manager, "g1", "2017-06-01 10:00:00");
        manager.store_state().unwrap();

        config
            .time_tolerance_per_source
            .insert("abuse-ch.feodotracker".to_owned(), 5);
        let mut restored = AggregatorDataManager::open(config).unwrap();
        restored.restore_state().unwrap();

        let source = restored.data().source("abuse-ch.feodotracker").unwrap();
        assert_eq!(source.time_tolerance().as_secs(), 5);
    }

    #[test]
    fn test_restore_requests_shrink_for_unreferenced_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let mut manager = AggregatorDataManager::start(config.clone()).unwrap();
        process(&mut manager, "g1", "2017-06-01 10:00:00");
        process(&mut manager, "g2", "2017-06-01 23:00:00");
        let trigger = event(json!({"source": "abuse-ch.feodotracker"}));
        let suppressed = manager
            .generate_suppressed_events_for_source(&trigger)
            .unwrap();
        assert_eq!(suppressed.len(), 1);
        manager.store_state().unwrap();

        let mut restored = AggregatorDataManager::open(config.clone()).unwrap();
        assert!(restored.restore_state().unwrap());

        let live = restored.data().payload_handles()[1];
        restored.maintain_state(true).unwrap();

        let handles = restored.data().payload_handles();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].offset(), 0);
        assert_eq!(handles[0].size(), live.size());
        assert_eq!(
            fs::metadata(config.storage_path()).unwrap().len(),
            STORAGE_HEADER_LEN + live.size()
        );
        assert_eq!(restored.data().storage_generation(), 1);

        // The compacted pair restores cleanly.
        let mut again = AggregatorDataManager::open(config).unwrap();
        assert!(!again.restore_state().unwrap());
        let source = again.data().source("abuse-ch.feodotracker").unwrap();
        let payload = source.groups()["g2"].to_dict(again.storage()).unwrap();
        assert_eq!(payload["time"], "2017-06-01 23:00:00");
    }

    #[test]
    fn test_restore_truncates_trailing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let mut manager = AggregatorDataManager::start(config.clone()).unwrap();
        process(&mut manager, "g1", "2017-06-01 10:00:00");
        let end = manager.storage().len();
        manager.store_state().unwrap();

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(config.storage_path())
            .unwrap();
        file.write_all(b"P{\"partial\":").unwrap();
        drop(file);

        let mut restored = AggregatorDataManager::open(config).unwrap();
        restored.restore_state().unwrap();
        assert_eq!(restored.storage().len(), end);
    }

    #[test]
    fn test_restore_short_storage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let mut manager = AggregatorDataManager::start(config.clone()).unwrap();
        process(&mut manager, "g1", "2017-06-01 10:00:00");
        manager.store_state().unwrap();

        fs::write(config.storage_path(), b"P").unwrap();

        let mut restored = AggregatorDataManager::open(config).unwrap();
        assert!(matches!(
            restored.restore_state(),
            Err(AggregatorError::StateIntegrity(_))
        ));
    }

    #[test]
    fn test_restore_foreign_generation_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let mut manager = AggregatorDataManager::start(config.clone()).unwrap();
        process(&mut manager, "g1", "2017-06-01 10:00:00");
        manager.store_state().unwrap();

        let mut other = PayloadStorage::open(config.storage_path()).unwrap();
        let mut handles = Vec::new();
        other.clear(3, &mut handles).unwrap();
        for _ in 0..2 {
            let record = crate::payload::encode_payload(&event(json!({"a": 1}))).unwrap();
            other.save(&record, &mut handles).unwrap();
        }
        drop(other);

        let mut restored = AggregatorDataManager::open(config.clone()).unwrap();
        assert!(matches!(
            restored.restore_state(),
            Err(AggregatorError::StateIntegrity(_))
        ));

        // Nothing was cut off.
        assert_eq!(restored.storage().len(), handles[1].end());
    }

    #[test]
    fn test_restore_overflowing_handle_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let handles = vec![
            PayloadHandle::new(0, u64::MAX),
            PayloadHandle::new(u64::MAX, 1),
        ];
        let data = AggregatorData::from_parts(Default::default(), handles, 0);
        fs::write(config.index_path(), index::encode_index(&data).unwrap()).unwrap();

        let mut manager = AggregatorDataManager::open(config).unwrap();
        assert!(matches!(
            manager.restore_state(),
            Err(AggregatorError::StateIntegrity(_))
        ));
    }

    #[test]
    fn test_failed_index_replacement_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let mut manager = AggregatorDataManager::start(config.clone()).unwrap();
        process(&mut manager, "g1", "2017-06-01 10:00:00");
        process(&mut manager, "g2", "2017-06-01 23:00:00");
        let trigger = event(json!({"source": "abuse-ch.feodotracker"}));
        manager
            .generate_suppressed_events_for_source(&trigger)
            .unwrap();
        let handles = manager.data().payload_handles().to_vec();
        let storage_before = fs::read(config.storage_path()).unwrap();

        // Occupy the index path so that it cannot be replaced.
        fs::remove_file(config.index_path()).unwrap();
        fs::create_dir(config.index_path()).unwrap();
        fs::write(config.index_path().join("blocker"), b"").unwrap();

        assert!(matches!(
            manager.maintain_state(true),
            Err(AggregatorError::Persistence { .. })
        ));

        // The old storage is untouched and the state still points into it.
        assert_eq!(fs::read(config.storage_path()).unwrap(), storage_before);
        assert_eq!(manager.data().payload_handles(), handles);
        assert_eq!(manager.data().storage_generation(), 0);

        let source = manager.data().source("abuse-ch.feodotracker").unwrap();
        let payload = source.groups()["g2"].to_dict(manager.storage()).unwrap();
        assert_eq!(payload["_group"], "g2");
    }

    #[test]
    fn test_restore_corrupted_index_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        fs::write(config.index_path(), b"N6AGGIDX\x02\xc1").unwrap();

        let mut manager = AggregatorDataManager::open(config).unwrap();
        assert!(matches!(
            manager.restore_state(),
            Err(AggregatorError::Decoding { .. })
        ));
    }

    #[test]
    fn test_restore_legacy_index() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        fs::write(config.index_path(), legacy_index()).unwrap();

        let mut manager = AggregatorDataManager::open(config.clone()).unwrap();
        assert!(manager.restore_state().unwrap());
        manager.maintain_state(true).unwrap();

        let index = fs::read(config.index_path()).unwrap();
        assert!(index.starts_with(b"N6AGGIDX\x02"));

        let summary = inspect_state(&config).unwrap();
        assert_eq!(summary.payloads, 2);
        assert_eq!(summary.live_payloads, 2);
        assert_eq!(summary.sources["abuse-ch.feodotracker"].groups, 1);
        assert_eq!(summary.sources["abuse-ch.feodotracker"].buffered, 1);
    }

    #[test]
    fn test_store_closes_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let mut manager = AggregatorDataManager::start(config).unwrap();
        manager.store_state().unwrap();

        let event = event(json!({
            "source": "abuse-ch.feodotracker",
            "_group": "g1",
            "time": "2017-06-01 10:00:00",
        }));
        assert!(matches!(
            manager.process_new_message(&event, now()),
            Err(AggregatorError::StateIntegrity(_))
        ));
    }

    #[test]
    fn test_maintain_reports_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut manager = AggregatorDataManager::open(config).unwrap();

        let captures = n6_statsd::with_capturing_test_client(|| {
            manager.report_gauges();
        });

        assert_eq!(
            captures,
            [
                "aggregator.sources:0|g",
                "aggregator.groups.open:0|g",
                "aggregator.groups.buffered:0|g",
                "aggregator.payloads:0|g",
                "aggregator.storage.bytes:0|g",
            ]
        );
    }
}
