//! Append-only storage of event payloads.
//!
//! Every group keeps the payload of its first event. Payloads are appended to a single file as
//! tagged records and referenced by [`PayloadHandle`]s. The order in which records were written
//! is kept in a handle list owned by the aggregation state; records are contiguous, so the end of
//! the last handle always equals the length of the file.
//!
//! The file starts with a header of [`STORAGE_HEADER_LEN`] bytes: a magic string and the
//! generation of the storage. Handle offsets are relative to the end of the header. Every
//! compaction with [`PayloadStorage::shrink`] drops the records no longer referenced by any group
//! and writes a new generation, which the index file records as well.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use serde::{Deserialize, Serialize};

use crate::data::AggregatorData;
use crate::error::AggregatorError;
use crate::event::Event;

/// Tag of a record holding a JSON payload.
const PLAIN_TAG: u8 = b'P';
/// Tag of a record holding a zlib-compressed JSON payload.
///
/// Written by older versions only; kept readable for migrated state.
const COMPRESSED_TAG: u8 = b'C';

/// Leading bytes of every payload storage file.
const STORAGE_MAGIC: &[u8; 8] = b"N6AGGPLD";
/// Length of the header preceding the first record.
pub const STORAGE_HEADER_LEN: u64 = 16;

/// Encodes the header of a storage file of the given generation.
fn storage_header(generation: u64) -> [u8; STORAGE_HEADER_LEN as usize] {
    let mut header = [0; STORAGE_HEADER_LEN as usize];
    header[..8].copy_from_slice(STORAGE_MAGIC);
    header[8..].copy_from_slice(&generation.to_be_bytes());
    header
}

/// Decodes the generation from a storage header.
fn parse_storage_header(header: &[u8]) -> Option<u64> {
    let generation = header.strip_prefix(STORAGE_MAGIC.as_slice())?;
    Some(u64::from_be_bytes(generation.try_into().ok()?))
}

/// Reference to a payload record in the [`PayloadStorage`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PayloadHandle {
    offset: u64,
    size: u64,
}

impl PayloadHandle {
    /// Creates a handle to `size` bytes starting at `offset`.
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Position of the first byte of the record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length of the record in bytes, including its tag.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Position right after the last byte of the record.
    ///
    /// Saturates for handles that reach past the largest possible offset. Use
    /// [`checked_end`](Self::checked_end) for handles read from disk.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }

    /// Position right after the last byte of the record, or `None` if it overflows.
    pub fn checked_end(&self) -> Option<u64> {
        self.offset.checked_add(self.size)
    }

    /// Like [`checked_end`](Self::checked_end), but fails with a state integrity error.
    pub(crate) fn try_end(&self) -> Result<u64, AggregatorError> {
        self.checked_end().ok_or_else(|| {
            AggregatorError::integrity(format!(
                "payload at offset {} with {} bytes exceeds the storage address space",
                self.offset, self.size,
            ))
        })
    }
}

/// Serializes an event into a storage record.
pub fn encode_payload(event: &Event) -> Result<Vec<u8>, AggregatorError> {
    let mut record = vec![PLAIN_TAG];
    serde_json::to_writer(&mut record, event).map_err(AggregatorError::Serialization)?;
    Ok(record)
}

/// Deserializes a storage record into an event.
pub fn decode_payload(record: &[u8]) -> Result<Event, AggregatorError> {
    let result = match record.split_first() {
        Some((&PLAIN_TAG, json)) => serde_json::from_slice(json),
        Some((&COMPRESSED_TAG, compressed)) => serde_json::from_reader(ZlibDecoder::new(compressed)),
        _ => return Err(AggregatorError::integrity("unrecognized payload record")),
    };

    result.map_err(|error| {
        AggregatorError::integrity(format!("corrupted payload record: {error}"))
    })
}

/// Returns `true` if the record starts with a known format tag.
pub fn is_valid_record(record: &[u8]) -> bool {
    matches!(record.first(), Some(&PLAIN_TAG | &COMPRESSED_TAG))
}

/// Appends payloads to a [`PayloadStorage`] and keeps the handle list of the state in sync.
#[derive(Debug)]
pub struct PayloadSink<'a> {
    storage: &'a mut PayloadStorage,
    handles: &'a mut Vec<PayloadHandle>,
}

impl<'a> PayloadSink<'a> {
    /// Creates a sink writing into `storage` and recording handles in `handles`.
    pub fn new(storage: &'a mut PayloadStorage, handles: &'a mut Vec<PayloadHandle>) -> Self {
        Self { storage, handles }
    }

    /// Stores a record. See [`PayloadStorage::save`].
    pub fn save(&mut self, record: &[u8]) -> Result<PayloadHandle, AggregatorError> {
        self.storage.save(record, self.handles)
    }
}

/// The payload storage file.
#[derive(Debug)]
pub struct PayloadStorage {
    path: PathBuf,
    file: Option<File>,
    generation: Option<u64>,
    len: u64,
}

impl PayloadStorage {
    /// Opens the storage file at `path`, creating it if it does not exist.
    ///
    /// A new file is initialized with a header of generation zero. A file without a valid header
    /// is opened as well, but cannot be read or written until it is [cleared](Self::clear).
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AggregatorError> {
        let mut storage = Self {
            path: path.into(),
            file: None,
            generation: None,
            len: 0,
        };
        storage.reopen()?;
        Ok(storage)
    }

    /// The path of the storage file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current length of the stored records in bytes, excluding the header.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Generation of the storage file, or `None` if the file has no valid header.
    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    /// Returns `true` if the storage holds no records.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn file(&self) -> Result<&File, AggregatorError> {
        self.file.as_ref().ok_or_else(|| {
            AggregatorError::integrity(format!(
                "payload storage {} is closed",
                self.path.display()
            ))
        })
    }

    /// Returns the file if it carries a valid header.
    fn records(&self) -> Result<&File, AggregatorError> {
        let file = self.file()?;
        if self.generation.is_none() {
            return Err(AggregatorError::integrity(format!(
                "payload storage {} has no valid header",
                self.path.display()
            )));
        }
        Ok(file)
    }

    fn io_error(&self, error: io::Error) -> AggregatorError {
        AggregatorError::persistence(&self.path, error)
    }

    /// Appends a record and registers its handle at the end of `handles`.
    ///
    /// The record is written at the end of the last handle, which must coincide with the end of
    /// the file.
    pub fn save(
        &mut self,
        record: &[u8],
        handles: &mut Vec<PayloadHandle>,
    ) -> Result<PayloadHandle, AggregatorError> {
        if !is_valid_record(record) {
            return Err(AggregatorError::integrity("refusing to store an untagged record"));
        }

        let expected = match handles.last() {
            Some(handle) => handle.try_end()?,
            None => 0,
        };
        if expected != self.len {
            return Err(AggregatorError::integrity(format!(
                "payload storage {} has {} bytes but the last payload ends at {expected}",
                self.path.display(),
                self.len,
            )));
        }

        let mut file = self.records()?;
        let offset = file
            .seek(SeekFrom::End(0))
            .map_err(|e| self.io_error(e))?
            .saturating_sub(STORAGE_HEADER_LEN);
        if offset != expected {
            return Err(AggregatorError::integrity(format!(
                "payload storage {} ends at {offset} instead of {expected}",
                self.path.display(),
            )));
        }
        file.write_all(record).map_err(|e| self.io_error(e))?;

        let handle = PayloadHandle::new(offset, record.len() as u64);
        self.len = handle.end();
        handles.push(handle);
        Ok(handle)
    }

    /// Reads the record referenced by `handle`.
    pub fn load(&self, handle: PayloadHandle) -> Result<Vec<u8>, AggregatorError> {
        let start = handle
            .offset()
            .checked_add(STORAGE_HEADER_LEN)
            .filter(|_| handle.checked_end().is_some())
            .ok_or_else(|| {
                AggregatorError::integrity(format!(
                    "payload at offset {} lies outside of {}",
                    handle.offset(),
                    self.path.display(),
                ))
            })?;

        let mut file = self.records()?;
        file.seek(SeekFrom::Start(start))
            .map_err(|e| self.io_error(e))?;

        let mut record = Vec::with_capacity(handle.size().min(self.len) as usize);
        (&mut file)
            .take(handle.size())
            .read_to_end(&mut record)
            .map_err(|e| self.io_error(e))?;

        if record.len() as u64 != handle.size() {
            return Err(AggregatorError::integrity(format!(
                "payload at offset {} of {} is truncated",
                handle.offset(),
                self.path.display(),
            )));
        }

        if !is_valid_record(&record) {
            return Err(AggregatorError::integrity(format!(
                "payload at offset {} of {} has an unknown format",
                handle.offset(),
                self.path.display(),
            )));
        }

        Ok(record)
    }

    /// Loads and decodes the payload referenced by `handle`.
    pub fn load_event(&self, handle: PayloadHandle) -> Result<Event, AggregatorError> {
        decode_payload(&self.load(handle)?)
    }

    /// Copies all payloads still referenced by `data` into `writer` and remaps their handles.
    ///
    /// `writer` receives a header of the next generation, followed by the records in the order
    /// of their offsets. Afterwards, every group of `data` references the new location of its
    /// payload, the handle list of `data` contains only the copied records and `data` refers to
    /// the new generation. Returns the length of the copied records.
    ///
    /// The storage itself is not modified. Once `writer` replaces the storage file, call
    /// [`reopen`](Self::reopen).
    pub fn shrink<W>(&self, writer: &mut W, data: &mut AggregatorData) -> Result<u64, AggregatorError>
    where
        W: Write + Seek,
    {
        let mut live: Vec<PayloadHandle> = data.live_handles().collect();
        live.sort_unstable();
        live.dedup();

        let generation = data.storage_generation().wrapping_add(1);
        writer
            .write_all(&storage_header(generation))
            .map_err(|e| self.io_error(e))?;

        let mut relocated = HashMap::with_capacity(live.len());
        let mut handles = Vec::with_capacity(live.len());
        let mut written = 0;
        let mut previous_end = 0;

        for handle in live {
            if handle.offset() < previous_end {
                return Err(AggregatorError::integrity(format!(
                    "payload at offset {} overlaps its predecessor",
                    handle.offset(),
                )));
            }
            previous_end = handle.try_end()?;

            let record = self.load(handle)?;
            writer.write_all(&record).map_err(|e| self.io_error(e))?;

            let moved = PayloadHandle::new(written, handle.size());
            relocated.insert(handle, moved);
            handles.push(moved);
            written = moved.try_end()?;
        }

        writer.flush().map_err(|e| self.io_error(e))?;
        let position = writer.stream_position().map_err(|e| self.io_error(e))?;
        if position != STORAGE_HEADER_LEN + written {
            return Err(AggregatorError::integrity(format!(
                "compacted payload storage has {position} bytes instead of {}",
                STORAGE_HEADER_LEN + written,
            )));
        }

        data.relocate_payloads(&relocated)?;
        data.set_payload_handles(handles);
        data.set_storage_generation(generation);

        Ok(written)
    }

    /// Removes all records, empties `handles` and marks the file with `generation`.
    pub fn clear(
        &mut self,
        generation: u64,
        handles: &mut Vec<PayloadHandle>,
    ) -> Result<(), AggregatorError> {
        let mut file = self.file()?;
        file.set_len(0).map_err(|e| self.io_error(e))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| self.io_error(e))?;
        file.write_all(&storage_header(generation))
            .map_err(|e| self.io_error(e))?;

        self.generation = Some(generation);
        self.len = 0;
        handles.clear();
        Ok(())
    }

    /// Cuts the stored records down to `len` bytes.
    pub fn truncate(&mut self, len: u64) -> Result<(), AggregatorError> {
        let file = self.records()?;
        file.set_len(STORAGE_HEADER_LEN + len)
            .map_err(|e| self.io_error(e))?;
        self.len = len;
        Ok(())
    }

    /// Closes the file. Any further access fails until the storage is reopened.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Opens the storage file again, picking up a file that replaced it on disk.
    pub fn reopen(&mut self) -> Result<(), AggregatorError> {
        self.file = None;
        self.generation = None;
        self.len = 0;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;

        let file_len = file.metadata().map_err(|e| self.io_error(e))?.len();
        if file_len == 0 {
            file.write_all(&storage_header(0))
                .map_err(|e| self.io_error(e))?;
            self.generation = Some(0);
        } else if file_len >= STORAGE_HEADER_LEN {
            let mut header = [0; STORAGE_HEADER_LEN as usize];
            file.read_exact(&mut header)
                .map_err(|e| self.io_error(e))?;
            self.generation = parse_storage_header(&header);
            if self.generation.is_some() {
                self.len = file_len - STORAGE_HEADER_LEN;
            }
        }

        self.file = Some(file);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use serde_json::json;

    use super::*;

    fn event(value: serde_json::Value) -> Event {
        match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn storage() -> (tempfile::TempDir, PayloadStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = PayloadStorage::open(dir.path().join("db.payload-storage")).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_save_and_load() {
        let (_dir, mut storage) = storage();
        let mut handles = Vec::new();

        let first = encode_payload(&event(json!({"a": 1}))).unwrap();
        let second = encode_payload(&event(json!({"b": "two"}))).unwrap();

        let h1 = storage.save(&first, &mut handles).unwrap();
        let h2 = storage.save(&second, &mut handles).unwrap();

        assert_eq!(h1.offset(), 0);
        assert_eq!(h2.offset(), h1.end());
        assert_eq!(handles, [h1, h2]);
        assert_eq!(storage.len(), h2.end());

        assert_eq!(storage.load(h2).unwrap(), second);
        assert_eq!(storage.load_event(h1).unwrap(), event(json!({"a": 1})));
    }

    #[test]
    fn test_save_rejects_stale_handles() {
        let (_dir, mut storage) = storage();
        let mut handles = Vec::new();
        let record = encode_payload(&event(json!({"a": 1}))).unwrap();
        storage.save(&record, &mut handles).unwrap();

        let mut stale = Vec::new();
        let error = storage.save(&record, &mut stale).unwrap_err();
        assert!(matches!(error, AggregatorError::StateIntegrity(_)));
        assert!(stale.is_empty());
    }

    #[test]
    fn test_load_truncated_record() {
        let (_dir, mut storage) = storage();
        let mut handles = Vec::new();
        let record = encode_payload(&event(json!({"a": 1}))).unwrap();
        let handle = storage.save(&record, &mut handles).unwrap();

        let beyond = PayloadHandle::new(handle.offset(), handle.size() + 10);
        assert!(matches!(
            storage.load(beyond),
            Err(AggregatorError::StateIntegrity(_))
        ));
    }

    #[test]
    fn test_load_unknown_tag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.payload-storage");
        let mut contents = storage_header(0).to_vec();
        contents.extend_from_slice(b"X{}");
        std::fs::write(&path, contents).unwrap();

        let storage = PayloadStorage::open(&path).unwrap();
        assert!(matches!(
            storage.load(PayloadHandle::new(0, 3)),
            Err(AggregatorError::StateIntegrity(_))
        ));
    }

    #[test]
    fn test_decode_compressed_record() {
        let mut encoder = ZlibEncoder::new(vec![COMPRESSED_TAG], Compression::default());
        encoder.write_all(br#"{"legacy": true}"#).unwrap();
        let record = encoder.finish().unwrap();

        assert_eq!(
            decode_payload(&record).unwrap(),
            event(json!({"legacy": true}))
        );
    }

    #[test]
    fn test_closed_storage() {
        let (_dir, mut storage) = storage();
        let mut handles = Vec::new();
        let record = encode_payload(&event(json!({"a": 1}))).unwrap();
        let handle = storage.save(&record, &mut handles).unwrap();

        storage.close();
        assert!(storage.load(handle).is_err());

        storage.reopen().unwrap();
        assert_eq!(storage.len(), handle.end());
        assert_eq!(storage.load(handle).unwrap(), record);
    }

    #[test]
    fn test_clear() {
        let (_dir, mut storage) = storage();
        let mut handles = Vec::new();
        let record = encode_payload(&event(json!({"a": 1}))).unwrap();
        storage.save(&record, &mut handles).unwrap();

        storage.clear(7, &mut handles).unwrap();
        assert!(storage.is_empty());
        assert!(handles.is_empty());
        assert_eq!(storage.generation(), Some(7));

        let handle = storage.save(&record, &mut handles).unwrap();
        assert_eq!(handle.offset(), 0);

        storage.reopen().unwrap();
        assert_eq!(storage.generation(), Some(7));
        assert_eq!(storage.len(), handle.end());
    }

    #[test]
    fn test_open_writes_header() {
        let (dir, storage) = storage();

        assert_eq!(storage.generation(), Some(0));
        assert!(storage.is_empty());
        assert_eq!(
            std::fs::read(dir.path().join("db.payload-storage")).unwrap(),
            b"N6AGGPLD\0\0\0\0\0\0\0\0"
        );
    }

    #[test]
    fn test_invalid_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.payload-storage");
        std::fs::write(&path, b"P{\"a\":1}").unwrap();

        let mut storage = PayloadStorage::open(&path).unwrap();
        assert_eq!(storage.generation(), None);
        assert!(storage.is_empty());

        let mut handles = Vec::new();
        let record = encode_payload(&event(json!({"a": 1}))).unwrap();
        assert!(matches!(
            storage.save(&record, &mut handles),
            Err(AggregatorError::StateIntegrity(_))
        ));
        assert!(matches!(
            storage.load(PayloadHandle::new(0, 1)),
            Err(AggregatorError::StateIntegrity(_))
        ));

        storage.clear(0, &mut handles).unwrap();
        assert_eq!(storage.save(&record, &mut handles).unwrap().offset(), 0);
    }

    #[test]
    fn test_overflowing_handle() {
        let (_dir, mut storage) = storage();
        let mut handles = Vec::new();
        let record = encode_payload(&event(json!({"a": 1}))).unwrap();
        storage.save(&record, &mut handles).unwrap();

        let handle = PayloadHandle::new(u64::MAX - 1, 10);
        assert_eq!(handle.checked_end(), None);
        assert_eq!(handle.end(), u64::MAX);
        assert!(matches!(
            storage.load(handle),
            Err(AggregatorError::StateIntegrity(_))
        ));

        let mut corrupted = vec![handle];
        assert!(matches!(
            storage.save(&record, &mut corrupted),
            Err(AggregatorError::StateIntegrity(_))
        ));
    }

    #[test]
    fn test_shrink_empty() {
        let (_dir, storage) = storage();
        let mut data = AggregatorData::default();
        let mut target = Cursor::new(Vec::new());

        assert_eq!(storage.shrink(&mut target, &mut data).unwrap(), 0);
        assert_eq!(target.into_inner(), storage_header(1));
        assert!(data.payload_handles().is_empty());
        assert_eq!(data.storage_generation(), 1);
    }
}
