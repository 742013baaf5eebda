//! Encoding of the index file.
//!
//! The index file starts with a magic string and a format version, followed by the MessagePack
//! encoding of the state. Version 1 kept the payloads of all groups inline. Version 2 references
//! them in the payload storage instead, together with the generation of the storage file. Version
//! 1 files are migrated on load by moving the inline payloads into the storage.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::data::AggregatorData;
use crate::error::AggregatorError;
use crate::group::HiFreqEventData;
use crate::payload::{self, PayloadStorage};
use crate::source::SourceData;

/// Leading bytes of every index file.
const MAGIC: &[u8; 8] = b"N6AGGIDX";
/// Format with inline payloads.
const LEGACY_VERSION: u8 = 1;
/// Format with payloads in the payload storage.
const CURRENT_VERSION: u8 = 2;

/// Contents of an index file.
#[derive(Debug)]
pub enum DecodedIndex {
    /// State in the current format.
    Current(AggregatorData),
    /// State in the legacy format, which has to be migrated.
    Legacy(LegacyAggregatorData),
}

/// Encodes the state into the current index format.
pub fn encode_index(data: &AggregatorData) -> Result<Vec<u8>, AggregatorError> {
    let mut bytes = Vec::with_capacity(MAGIC.len() + 1);
    bytes.extend_from_slice(MAGIC);
    bytes.push(CURRENT_VERSION);
    rmp_serde::encode::write(&mut bytes, data).map_err(AggregatorError::Encoding)?;
    Ok(bytes)
}

/// Decodes an index file of any known version read from `path`.
pub fn decode_index(bytes: &[u8], path: &Path) -> Result<DecodedIndex, AggregatorError> {
    let decoding = |source| AggregatorError::Decoding {
        path: path.to_owned(),
        source,
    };

    let Some(body) = bytes.strip_prefix(MAGIC.as_slice()) else {
        return Err(AggregatorError::integrity(format!(
            "index file {} has no valid header",
            path.display()
        )));
    };

    match body.split_first() {
        Some((&CURRENT_VERSION, body)) => rmp_serde::from_slice(body)
            .map(DecodedIndex::Current)
            .map_err(decoding),
        Some((&LEGACY_VERSION, body)) => rmp_serde::from_slice(body)
            .map(DecodedIndex::Legacy)
            .map_err(decoding),
        Some((version, _)) => Err(AggregatorError::integrity(format!(
            "index file {} has unsupported format version {version}",
            path.display()
        ))),
        None => Err(AggregatorError::integrity(format!(
            "index file {} has no format version",
            path.display()
        ))),
    }
}

/// State of the legacy index format.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LegacyAggregatorData {
    sources: BTreeMap<String, LegacySourceData>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LegacySourceData {
    time: Option<NaiveDateTime>,
    last_active: DateTime<Utc>,
    groups: IndexMap<String, LegacyGroup>,
    buffer: IndexMap<String, LegacyGroup>,
    time_tolerance: Duration,
}

/// A group with its first payload inline: first and until in microseconds, payload record and
/// count.
#[derive(Debug, Serialize, Deserialize)]
struct LegacyGroup(i64, i64, serde_bytes::ByteBuf, u64);

impl LegacyAggregatorData {
    /// Moves all inline payloads into `storage` and returns the state in the current format.
    ///
    /// The storage is cleared first, since legacy state references no records in it.
    pub fn migrate(self, storage: &mut PayloadStorage) -> Result<AggregatorData, AggregatorError> {
        let generation = 0;
        let mut handles = Vec::new();
        storage.clear(generation, &mut handles)?;

        let mut migrate_groups = |groups: IndexMap<String, LegacyGroup>| {
            groups
                .into_iter()
                .map(|(key, LegacyGroup(first, until, record, count))| {
                    if !payload::is_valid_record(&record) {
                        return Err(AggregatorError::integrity(format!(
                            "legacy group {key:?} has an unrecognized payload record"
                        )));
                    }
                    let handle = storage.save(&record, &mut handles)?;
                    let group = HiFreqEventData::from_micros(first, until, handle, count)?;
                    Ok((key, group))
                })
                .collect::<Result<IndexMap<_, _>, _>>()
        };

        let mut sources = BTreeMap::new();
        for (source_id, source) in self.sources {
            let migrated = SourceData::from_parts(
                source.time,
                source.last_active,
                migrate_groups(source.groups)?,
                migrate_groups(source.buffer)?,
                source.time_tolerance,
            );
            sources.insert(source_id, migrated);
        }

        Ok(AggregatorData::from_parts(sources, handles, generation))
    }
}
