//! Write-ahead log
//!
//! Appends multi-key writes and range deletes to segment files so the cache
//! can be rebuilt after a restart. Segments rotate at a configured size;
//! closed segments are removed once a cache snapshot containing their data
//! has been durably written to a TSM file.
//!
//! Each entry is framed as `magic | version | type | crc32 | body length`
//! followed by the body. The body starts with the wall-clock write time and
//! carries the entry payload. A torn entry at the tail of a segment (from a
//! crash mid-write) truncates replay at that point.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::engine::traits::Log;
use crate::metrics;
use crate::storage::cache::Cache;
use crate::types::ValuesMap;
use crate::value::Value;

/// Magic bytes identifying a WAL segment entry
const WAL_MAGIC: [u8; 4] = [0x54, 0x53, 0x4D, 0x57]; // "TSMW"

/// Current WAL format version
const WAL_VERSION: u8 = 1;

/// Size of the entry frame header (magic + version + type + crc + length)
const ENTRY_HEADER_SIZE: usize = 4 + 1 + 1 + 4 + 4;

/// Prefix of WAL segment file names
const SEGMENT_FILE_PREFIX: &str = "wal-";

/// Extension of WAL segment files
pub const WAL_FILE_EXTENSION: &str = "wal";

/// Default segment file size before rotation (10MB)
const DEFAULT_SEGMENT_SIZE: u64 = 10 * 1024 * 1024;

/// Default maximum entry size (16MB)
const DEFAULT_MAX_ENTRY_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur during WAL operations
#[derive(Debug, Error)]
pub enum WalError {
    /// I/O error during WAL operations
    #[error("wal i/o error: {0}")]
    Io(#[from] io::Error),

    /// Invalid WAL entry magic bytes
    #[error("invalid WAL magic bytes at offset {offset}")]
    InvalidMagic {
        /// File offset of the bad frame
        offset: u64,
    },

    /// Unsupported WAL version
    #[error("unsupported WAL version: {0}")]
    UnsupportedVersion(u8),

    /// Checksum verification failed
    #[error("checksum mismatch for entry at offset {offset}")]
    ChecksumMismatch {
        /// File offset where the mismatch occurred
        offset: u64,
    },

    /// Corrupted WAL entry
    #[error("corrupted WAL entry at offset {offset}: {reason}")]
    CorruptedEntry {
        /// File offset of the corrupted entry
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Entry larger than the configured maximum
    #[error("entry size {size} exceeds maximum {max}")]
    EntryTooLarge {
        /// Actual entry size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Invalid configuration
    #[error("invalid WAL configuration: {0}")]
    InvalidConfig(String),
}

/// Synchronization mode for WAL writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Rely on OS buffer flushing; fastest, least durable
    NoSync,

    /// fsync after every write; slowest, guarantees durability
    #[default]
    EveryWrite,
}

/// Configuration for the write-ahead log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Maximum size of a segment file before rotation
    #[serde(default = "default_segment_size")]
    pub segment_size: u64,

    /// Sync mode for durability
    #[serde(default)]
    pub sync_mode: SyncMode,

    /// Maximum entry size in bytes
    #[serde(default = "default_max_entry_size")]
    pub max_entry_size: usize,
}

fn default_segment_size() -> u64 {
    DEFAULT_SEGMENT_SIZE
}
fn default_max_entry_size() -> usize {
    DEFAULT_MAX_ENTRY_SIZE
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            sync_mode: SyncMode::default(),
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
        }
    }
}

impl WalConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), WalError> {
        if self.segment_size == 0 {
            return Err(WalError::InvalidConfig(
                "segment_size must be greater than 0".to_string(),
            ));
        }
        if self.max_entry_size == 0 {
            return Err(WalError::InvalidConfig(
                "max_entry_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

const ENTRY_TYPE_WRITE: u8 = 1;
const ENTRY_TYPE_DELETE_RANGE: u8 = 2;

/// A single WAL entry
#[derive(Debug, Clone, PartialEq)]
pub enum WalEntry {
    /// Values written for one or more composite keys
    Write {
        /// Values by composite key
        values: ValuesMap,
    },

    /// A range delete over a set of composite keys
    DeleteRange {
        /// Composite keys the delete applies to
        keys: Vec<Vec<u8>>,
        /// Minimum timestamp, inclusive
        min: i64,
        /// Maximum timestamp, inclusive
        max: i64,
    },
}

impl WalEntry {
    fn type_code(&self) -> u8 {
        match self {
            WalEntry::Write { .. } => ENTRY_TYPE_WRITE,
            WalEntry::DeleteRange { .. } => ENTRY_TYPE_DELETE_RANGE,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        // Wall-clock write time; informational only.
        let _ = body.write_i64::<LittleEndian>(chrono::Utc::now().timestamp_millis());
        match self {
            WalEntry::Write { values } => {
                let _ = body.write_u32::<LittleEndian>(values.len() as u32);
                for (key, vs) in values {
                    let _ = body.write_u16::<LittleEndian>(key.len() as u16);
                    body.extend_from_slice(key);
                    let _ = body.write_u32::<LittleEndian>(vs.len() as u32);
                    for v in vs {
                        v.encode_into(&mut body);
                    }
                }
            }
            WalEntry::DeleteRange { keys, min, max } => {
                let _ = body.write_i64::<LittleEndian>(*min);
                let _ = body.write_i64::<LittleEndian>(*max);
                let _ = body.write_u32::<LittleEndian>(keys.len() as u32);
                for key in keys {
                    let _ = body.write_u16::<LittleEndian>(key.len() as u16);
                    body.extend_from_slice(key);
                }
            }
        }
        body
    }

    /// Serialize the entry into its framed wire form
    fn serialize(&self, max_entry_size: usize) -> Result<Vec<u8>, WalError> {
        let body = self.encode_body();
        let total = ENTRY_HEADER_SIZE + body.len();
        if total > max_entry_size {
            return Err(WalError::EntryTooLarge {
                size: total,
                max: max_entry_size,
            });
        }

        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&WAL_MAGIC);
        buf.push(WAL_VERSION);
        buf.push(self.type_code());
        let _ = buf.write_u32::<LittleEndian>(crc32fast::hash(&body));
        let _ = buf.write_u32::<LittleEndian>(body.len() as u32);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    fn decode_body(type_code: u8, body: &[u8], offset: u64) -> Result<Self, WalError> {
        let corrupted = |reason: String| WalError::CorruptedEntry { offset, reason };

        let mut cursor = Cursor::new(body);
        // Skip the write-time stamp.
        cursor
            .read_i64::<LittleEndian>()
            .map_err(|e| corrupted(e.to_string()))?;

        match type_code {
            ENTRY_TYPE_WRITE => {
                let key_count = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|e| corrupted(e.to_string()))? as usize;
                let mut values: ValuesMap = HashMap::with_capacity(key_count);
                for _ in 0..key_count {
                    let key = read_key(&mut cursor).map_err(|e| corrupted(e.to_string()))?;
                    let n = cursor
                        .read_u32::<LittleEndian>()
                        .map_err(|e| corrupted(e.to_string()))?
                        as usize;
                    let mut vs = Vec::with_capacity(n);
                    for _ in 0..n {
                        let v = Value::decode_from(&mut cursor)
                            .map_err(|e| corrupted(e.to_string()))?;
                        vs.push(v);
                    }
                    values.insert(key, vs);
                }
                Ok(WalEntry::Write { values })
            }
            ENTRY_TYPE_DELETE_RANGE => {
                let min = cursor
                    .read_i64::<LittleEndian>()
                    .map_err(|e| corrupted(e.to_string()))?;
                let max = cursor
                    .read_i64::<LittleEndian>()
                    .map_err(|e| corrupted(e.to_string()))?;
                let key_count = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|e| corrupted(e.to_string()))? as usize;
                let mut keys = Vec::with_capacity(key_count);
                for _ in 0..key_count {
                    keys.push(read_key(&mut cursor).map_err(|e| corrupted(e.to_string()))?);
                }
                Ok(WalEntry::DeleteRange { keys, min, max })
            }
            other => Err(corrupted(format!("unknown entry type: {}", other))),
        }
    }
}

fn read_key(cursor: &mut Cursor<&[u8]>) -> io::Result<Vec<u8>> {
    let len = cursor.read_u16::<LittleEndian>()? as usize;
    let mut key = vec![0u8; len];
    std::io::Read::read_exact(cursor, &mut key)?;
    Ok(key)
}

struct OpenSegment {
    path: PathBuf,
    file: BufWriter<File>,
    size: u64,
}

#[derive(Default)]
struct WalState {
    current: Option<OpenSegment>,
    closed: Vec<(PathBuf, u64)>,
    next_id: u64,
}

impl WalState {
    fn disk_size(&self) -> u64 {
        let closed: u64 = self.closed.iter().map(|(_, size)| size).sum();
        closed + self.current.as_ref().map(|c| c.size).unwrap_or(0)
    }

    fn segment_count(&self) -> usize {
        self.closed.len() + usize::from(self.current.is_some())
    }
}

/// File-backed write-ahead log
pub struct Wal {
    dir: PathBuf,
    config: WalConfig,
    state: Mutex<WalState>,
    last_write: Mutex<SystemTime>,
}

impl Wal {
    /// Create a WAL rooted at `dir`. Nothing touches the disk until
    /// [`Log::open`] is called.
    pub fn new(dir: impl Into<PathBuf>, config: WalConfig) -> Self {
        Self {
            dir: dir.into(),
            config,
            state: Mutex::new(WalState::default()),
            last_write: Mutex::new(SystemTime::UNIX_EPOCH),
        }
    }

    fn segment_path(&self, id: u64) -> PathBuf {
        self.dir
            .join(format!("{}{:06}.{}", SEGMENT_FILE_PREFIX, id, WAL_FILE_EXTENSION))
    }

    fn open_new_segment(&self, state: &mut WalState) -> Result<(), WalError> {
        let id = state.next_id;
        state.next_id += 1;
        let path = self.segment_path(id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        debug!(path = %path.display(), "opened WAL segment");
        state.current = Some(OpenSegment {
            path,
            file: BufWriter::new(file),
            size: 0,
        });
        Ok(())
    }

    fn close_current(&self, state: &mut WalState) -> Result<(), WalError> {
        if let Some(mut segment) = state.current.take() {
            segment.file.flush()?;
            segment.file.get_ref().sync_data()?;
            state.closed.push((segment.path, segment.size));
        }
        Ok(())
    }

    fn append(&self, entry: &WalEntry) -> Result<(), WalError> {
        let buf = entry.serialize(self.config.max_entry_size)?;

        let mut state = self.state.lock();
        if state.current.is_none() {
            self.open_new_segment(&mut state)?;
        }
        let roll = state
            .current
            .as_ref()
            .map(|c| c.size > 0 && c.size + buf.len() as u64 > self.config.segment_size)
            .unwrap_or(false);
        if roll {
            self.close_current(&mut state)?;
            self.open_new_segment(&mut state)?;
        }

        let segment = match state.current.as_mut() {
            Some(segment) => segment,
            None => return Err(WalError::InvalidConfig("no active segment".to_string())),
        };
        segment.file.write_all(&buf)?;
        if self.config.sync_mode == SyncMode::EveryWrite {
            segment.file.flush()?;
            segment.file.get_ref().sync_data()?;
        }
        segment.size += buf.len() as u64;

        metrics::WAL_SIZE_BYTES.set(state.disk_size() as f64);
        metrics::WAL_SEGMENTS.set(state.segment_count() as f64);
        drop(state);

        *self.last_write.lock() = SystemTime::now();
        Ok(())
    }
}

impl Log for Wal {
    fn open(&self) -> crate::error::Result<()> {
        fs::create_dir_all(&self.dir).map_err(WalError::Io)?;

        let mut state = self.state.lock();
        let mut latest_write = SystemTime::UNIX_EPOCH;
        let mut max_id = 0u64;
        for path in segment_file_names(&self.dir)? {
            let meta = fs::metadata(&path).map_err(WalError::Io)?;
            if let Ok(modified) = meta.modified() {
                latest_write = latest_write.max(modified);
            }
            if let Some(id) = parse_segment_id(&path) {
                max_id = max_id.max(id + 1);
            }
            state.closed.push((path, meta.len()));
        }
        state.next_id = max_id;
        self.open_new_segment(&mut state)?;

        metrics::WAL_SIZE_BYTES.set(state.disk_size() as f64);
        metrics::WAL_SEGMENTS.set(state.segment_count() as f64);
        drop(state);

        if latest_write > SystemTime::UNIX_EPOCH {
            *self.last_write.lock() = latest_write;
        }
        Ok(())
    }

    fn close(&self) -> crate::error::Result<()> {
        let mut state = self.state.lock();
        self.close_current(&mut state)?;
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.dir
    }

    fn write_multi(&self, values: &ValuesMap) -> crate::error::Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        self.append(&WalEntry::Write {
            values: values.clone(),
        })?;
        Ok(())
    }

    fn delete_range(&self, keys: &[Vec<u8>], min: i64, max: i64) -> crate::error::Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.append(&WalEntry::DeleteRange {
            keys: keys.to_vec(),
            min,
            max,
        })?;
        Ok(())
    }

    fn close_segment(&self) -> crate::error::Result<()> {
        let mut state = self.state.lock();
        let has_data = state.current.as_ref().map(|c| c.size > 0).unwrap_or(false);
        if has_data {
            self.close_current(&mut state)?;
            self.open_new_segment(&mut state)?;
        }
        Ok(())
    }

    fn closed_segments(&self) -> crate::error::Result<Vec<PathBuf>> {
        let state = self.state.lock();
        Ok(state.closed.iter().map(|(path, _)| path.clone()).collect())
    }

    fn remove(&self, files: &[PathBuf]) -> crate::error::Result<()> {
        let mut state = self.state.lock();
        for file in files {
            match fs::remove_file(file) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(WalError::Io(e).into()),
            }
            state.closed.retain(|(path, _)| path != file);
        }
        metrics::WAL_SIZE_BYTES.set(state.disk_size() as f64);
        metrics::WAL_SEGMENTS.set(state.segment_count() as f64);
        Ok(())
    }

    fn disk_size_bytes(&self) -> u64 {
        self.state.lock().disk_size()
    }

    fn last_write_time(&self) -> SystemTime {
        *self.last_write.lock()
    }
}

/// A WAL that drops everything. Used when durability is disabled.
#[derive(Default)]
pub struct NopWal {
    dir: PathBuf,
}

impl NopWal {
    /// Create a no-op WAL
    pub fn new() -> Self {
        Self::default()
    }
}

impl Log for NopWal {
    fn open(&self) -> crate::error::Result<()> {
        Ok(())
    }
    fn close(&self) -> crate::error::Result<()> {
        Ok(())
    }
    fn path(&self) -> &Path {
        &self.dir
    }
    fn write_multi(&self, _values: &ValuesMap) -> crate::error::Result<()> {
        Ok(())
    }
    fn delete_range(&self, _keys: &[Vec<u8>], _min: i64, _max: i64) -> crate::error::Result<()> {
        Ok(())
    }
    fn close_segment(&self) -> crate::error::Result<()> {
        Ok(())
    }
    fn closed_segments(&self) -> crate::error::Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
    fn remove(&self, _files: &[PathBuf]) -> crate::error::Result<()> {
        Ok(())
    }
    fn disk_size_bytes(&self) -> u64 {
        0
    }
    fn last_write_time(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH
    }
}

/// Returns the WAL segment file names under `dir`, sorted ascending.
pub fn segment_file_names(dir: &Path) -> Result<Vec<PathBuf>, WalError> {
    if dir.as_os_str().is_empty() || !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for dent in fs::read_dir(dir)? {
        let dent = dent?;
        let path = dent.path();
        let is_segment = path.extension().map(|e| e == WAL_FILE_EXTENSION).unwrap_or(false)
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(SEGMENT_FILE_PREFIX))
                .unwrap_or(false);
        if is_segment {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn parse_segment_id(path: &Path) -> Option<u64> {
    path.file_stem()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix(SEGMENT_FILE_PREFIX))
        .and_then(|n| n.parse::<u64>().ok())
}

/// Reads the entries of a single segment file.
///
/// A torn frame at the tail (from a crash mid-append) ends replay of that
/// segment; everything before it is returned.
pub fn read_segment(path: &Path) -> Result<Vec<WalEntry>, WalError> {
    let data = fs::read(path)?;
    let mut entries = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() {
        if data.len() - offset < ENTRY_HEADER_SIZE {
            warn!(path = %path.display(), offset, "truncated WAL frame header, ending replay");
            break;
        }
        let header = &data[offset..offset + ENTRY_HEADER_SIZE];
        if header[0..4] != WAL_MAGIC {
            warn!(path = %path.display(), offset, "bad WAL magic, ending replay");
            break;
        }
        let version = header[4];
        if version != WAL_VERSION {
            return Err(WalError::UnsupportedVersion(version));
        }
        let type_code = header[5];
        let crc = u32::from_le_bytes([header[6], header[7], header[8], header[9]]);
        let body_len = u32::from_le_bytes([header[10], header[11], header[12], header[13]]) as usize;

        let body_start = offset + ENTRY_HEADER_SIZE;
        if data.len() - body_start < body_len {
            warn!(path = %path.display(), offset, "truncated WAL entry body, ending replay");
            break;
        }
        let body = &data[body_start..body_start + body_len];
        if crc32fast::hash(body) != crc {
            return Err(WalError::ChecksumMismatch {
                offset: offset as u64,
            });
        }

        entries.push(WalEntry::decode_body(type_code, body, offset as u64)?);
        offset = body_start + body_len;
    }

    Ok(entries)
}

/// Replays WAL segment files into a cache on startup
pub struct CacheLoader {
    files: Vec<PathBuf>,
}

impl CacheLoader {
    /// Create a loader over the given segment files
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self { files }
    }

    /// Replay every segment into `cache` in file order
    pub fn load(&self, cache: &Cache) -> crate::error::Result<()> {
        for file in &self.files {
            let entries = read_segment(file)?;
            debug!(path = %file.display(), entries = entries.len(), "replaying WAL segment");
            for entry in entries {
                match entry {
                    WalEntry::Write { values } => cache.write_multi(&values)?,
                    WalEntry::DeleteRange { keys, min, max } => cache.delete_range(&keys, min, max),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::series_field_key;
    use tempfile::TempDir;

    fn sample_values(key: &[u8]) -> ValuesMap {
        let mut values = ValuesMap::new();
        values.insert(
            key.to_vec(),
            vec![Value::float(1, 0.5), Value::integer(2, 7)],
        );
        values
    }

    #[test]
    fn test_entry_round_trip() {
        let key = series_field_key(b"cpu,host=a", b"usage");
        let entry = WalEntry::Write {
            values: sample_values(&key),
        };
        let buf = entry.serialize(DEFAULT_MAX_ENTRY_SIZE).unwrap();

        let decoded = {
            let body = &buf[ENTRY_HEADER_SIZE..];
            WalEntry::decode_body(ENTRY_TYPE_WRITE, body, 0).unwrap()
        };
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_entry_too_large() {
        let key = series_field_key(b"cpu,host=a", b"usage");
        let entry = WalEntry::Write {
            values: sample_values(&key),
        };
        assert!(matches!(
            entry.serialize(8),
            Err(WalError::EntryTooLarge { .. })
        ));
    }

    #[test]
    fn test_write_and_replay() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::new(dir.path(), WalConfig::default());
        wal.open().unwrap();

        let key = series_field_key(b"cpu,host=a", b"usage");
        wal.write_multi(&sample_values(&key)).unwrap();
        wal.delete_range(&[key.clone()], 2, 2).unwrap();
        wal.close().unwrap();

        let files = segment_file_names(dir.path()).unwrap();
        assert_eq!(files.len(), 1);

        let cache = Cache::new(0);
        CacheLoader::new(files).load(&cache).unwrap();
        let values = cache.values(&key);
        assert_eq!(values, vec![Value::float(1, 0.5)]);
    }

    #[test]
    fn test_segment_rotation_and_close_segment() {
        let dir = TempDir::new().unwrap();
        let config = WalConfig {
            segment_size: 64,
            ..Default::default()
        };
        let wal = Wal::new(dir.path(), config);
        wal.open().unwrap();

        let key = series_field_key(b"cpu,host=a", b"usage");
        for i in 0..10 {
            let mut values = ValuesMap::new();
            values.insert(key.clone(), vec![Value::float(i, i as f64)]);
            wal.write_multi(&values).unwrap();
        }

        assert!(!wal.closed_segments().unwrap().is_empty());

        let closed_before = wal.closed_segments().unwrap().len();
        wal.close_segment().unwrap();
        assert_eq!(wal.closed_segments().unwrap().len(), closed_before + 1);
    }

    #[test]
    fn test_remove_closed_segments() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::new(dir.path(), WalConfig::default());
        wal.open().unwrap();

        let key = series_field_key(b"cpu,host=a", b"usage");
        wal.write_multi(&sample_values(&key)).unwrap();
        wal.close_segment().unwrap();

        let closed = wal.closed_segments().unwrap();
        assert_eq!(closed.len(), 1);
        wal.remove(&closed).unwrap();
        assert!(wal.closed_segments().unwrap().is_empty());
        assert!(!closed[0].exists());
    }

    #[test]
    fn test_reopen_finds_existing_segments() {
        let dir = TempDir::new().unwrap();
        let key = series_field_key(b"cpu,host=a", b"usage");
        {
            let wal = Wal::new(dir.path(), WalConfig::default());
            wal.open().unwrap();
            wal.write_multi(&sample_values(&key)).unwrap();
            wal.close().unwrap();
        }

        let wal = Wal::new(dir.path(), WalConfig::default());
        wal.open().unwrap();
        // The previous segment is now a closed segment of the reopened WAL.
        assert_eq!(wal.closed_segments().unwrap().len(), 1);
        assert!(wal.disk_size_bytes() > 0);
    }

    #[test]
    fn test_torn_tail_truncates_replay() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::new(dir.path(), WalConfig::default());
        wal.open().unwrap();

        let key = series_field_key(b"cpu,host=a", b"usage");
        wal.write_multi(&sample_values(&key)).unwrap();
        wal.close().unwrap();

        // Simulate a crash mid-append by appending garbage.
        let files = segment_file_names(dir.path()).unwrap();
        let mut data = fs::read(&files[0]).unwrap();
        data.extend_from_slice(&WAL_MAGIC);
        data.push(WAL_VERSION);
        fs::write(&files[0], data).unwrap();

        let entries = read_segment(&files[0]).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_nop_wal() {
        let wal = NopWal::new();
        wal.open().unwrap();
        let key = series_field_key(b"cpu,host=a", b"usage");
        wal.write_multi(&sample_values(&key)).unwrap();
        assert!(wal.closed_segments().unwrap().is_empty());
        assert_eq!(wal.disk_size_bytes(), 0);
        wal.close().unwrap();
    }
}
