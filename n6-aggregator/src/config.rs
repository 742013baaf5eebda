use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Extension of the payload storage file, which lives next to the index file.
const PAYLOAD_STORAGE_EXTENSION: &str = "payload-storage";

/// Default for [`AggregatorConfig::finished_groups_count_triggering_restart`].
pub const DEFAULT_RESTART_THRESHOLD: i64 = 10_000_000;

/// Parameters of the aggregator.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Path of the index file holding the aggregation state.
    ///
    /// The payload storage is kept next to it, with the extension replaced by
    /// `payload-storage`.
    pub dbpath: PathBuf,

    /// Grace window for out-of-order events in seconds.
    ///
    /// Defaults to `600` seconds.
    pub time_tolerance: u64,

    /// Overrides of [`time_tolerance`](Self::time_tolerance) by source id.
    pub time_tolerance_per_source: BTreeMap<String, u64>,

    /// Number of finished groups after which the aggregator stops to be restarted.
    ///
    /// Restarting compacts the payload storage. Zero or a negative value disables the restarts.
    /// Defaults to `10_000_000`.
    pub finished_groups_count_triggering_restart: i64,

    /// Interval of the inactivity sweep in seconds.
    ///
    /// Defaults to `3600` seconds.
    pub tick_interval: u64,

    /// Re-normalizes legacy-shaped fields of published events.
    ///
    /// Defaults to `false`.
    pub legacy_cleanup: bool,
}

impl AggregatorConfig {
    /// Returns the time tolerance applying to the given source.
    pub fn time_tolerance_for(&self, source: &str) -> Duration {
        let secs = self
            .time_tolerance_per_source
            .get(source)
            .copied()
            .unwrap_or(self.time_tolerance);

        Duration::from_secs(secs)
    }

    /// Returns the restart threshold, or `None` if restarts are disabled.
    pub fn restart_threshold(&self) -> Option<u64> {
        u64::try_from(self.finished_groups_count_triggering_restart)
            .ok()
            .filter(|threshold| *threshold > 0)
    }

    /// Returns the interval of the inactivity sweep.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval.max(1))
    }

    /// Returns the path of the index file.
    pub fn index_path(&self) -> &Path {
        &self.dbpath
    }

    /// Returns the path of the payload storage file.
    pub fn storage_path(&self) -> PathBuf {
        self.dbpath.with_extension(PAYLOAD_STORAGE_EXTENSION)
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            dbpath: PathBuf::new(),
            time_tolerance: 600,
            time_tolerance_per_source: BTreeMap::new(),
            finished_groups_count_triggering_restart: DEFAULT_RESTART_THRESHOLD,
            tick_interval: 3600,
            legacy_cleanup: false,
        }
    }
}
