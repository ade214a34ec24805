//! Trait seams for the engine's external collaborators
//!
//! The engine coordinates the cache, WAL and file store but does not own the
//! TSM block codecs, the measurement/series index or the series file. Those
//! are consumed through the traits here; `engine::stubs` provides in-memory
//! and flat-file implementations for tests and development.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::Result;
use crate::storage::cache::CacheSnapshot;
use crate::types::{Tags, ValuesMap};
use crate::value::Value;

/// Identifier assigned to a series by the series file; zero means absent
pub type SeriesId = u64;

/// Durable append log consumed by the engine.
///
/// The engine treats the log as linearizable: writes are serialized inside
/// the implementation.
pub trait Log: Send + Sync {
    /// Open the log, scanning any existing segments
    fn open(&self) -> Result<()>;

    /// Flush and close the current segment
    fn close(&self) -> Result<()>;

    /// Directory the segment files live in
    fn path(&self) -> &Path;

    /// Durably append values for multiple composite keys
    fn write_multi(&self, values: &ValuesMap) -> Result<()>;

    /// Durably append a range delete for the given composite keys
    fn delete_range(&self, keys: &[Vec<u8>], min: i64, max: i64) -> Result<()>;

    /// Rotate the current segment so it becomes removable after the next
    /// snapshot
    fn close_segment(&self) -> Result<()>;

    /// Paths of all closed (rotated) segments
    fn closed_segments(&self) -> Result<Vec<PathBuf>>;

    /// Delete the given segment files
    fn remove(&self, files: &[PathBuf]) -> Result<()>;

    /// Total size of all segments on disk
    fn disk_size_bytes(&self) -> u64;

    /// Wall-clock time of the last write
    fn last_write_time(&self) -> SystemTime;
}

/// A batch of tombstone writes against a single TSM file.
///
/// Either every staged range is committed or none is.
pub trait BatchDeleter {
    /// Stage a tombstone covering `[min, max]` for the given composite keys
    fn delete_range(&mut self, keys: &[&[u8]], min: i64, max: i64) -> Result<()>;

    /// Durably apply every staged tombstone
    fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every staged tombstone
    fn rollback(self: Box<Self>) -> Result<()>;
}

/// An immutable, sorted TSM file
pub trait TsmFile: Send + Sync {
    /// Path of the file on disk
    fn path(&self) -> &Path;

    /// Smallest and largest composite key in the file, if any remain
    fn key_range(&self) -> Option<(Vec<u8>, Vec<u8>)>;

    /// Smallest and largest timestamp stored in the file
    fn time_range(&self) -> (i64, i64);

    /// True if the file stores any value in `[min, max]`
    fn overlaps_time_range(&self, min: i64, max: i64) -> bool {
        let (file_min, file_max) = self.time_range();
        file_min <= max && file_max >= min
    }

    /// Iterate composite keys in ascending order starting at `from`
    fn key_iterator(&self, from: &[u8]) -> Box<dyn Iterator<Item = Vec<u8>> + '_>;

    /// Open a tombstone batch against this file
    fn batch_delete(&self) -> Box<dyn BatchDeleter + '_>;

    /// Values stored for a composite key, tombstones resolved
    fn values(&self, key: &[u8]) -> Result<Vec<Value>>;

    /// Size of the file in bytes
    fn size(&self) -> u64;

    /// Release resources held by the file
    fn close(&self) -> Result<()>;
}

/// Opens TSM files for the file store
pub trait TsmFileOpener: Send + Sync {
    /// Open the TSM file at `path`. When `madv_will_need` is set the opener
    /// advises the kernel that the file's pages will be needed soon;
    /// implementations without a mapping may ignore the hint.
    fn open(&self, path: &Path, madv_will_need: bool) -> Result<Arc<dyn TsmFile>>;
}

/// Produces new TSM files from cache snapshots and compaction groups.
///
/// All methods block; the engine runs them on blocking worker threads.
pub trait Compactor: Send + Sync {
    /// Enable the compactor after the engine has opened
    fn open(&self);

    /// Disable the compactor entirely
    fn close(&self);

    /// Allow levelled/full compactions
    fn enable_compactions(&self);

    /// Refuse new levelled/full compactions
    fn disable_compactions(&self);

    /// Allow snapshot writes
    fn enable_snapshots(&self);

    /// Refuse new snapshot writes
    fn disable_snapshots(&self);

    /// Apply a write throughput limit to everything the compactor writes.
    /// A rate of 0 disables limiting. Implementations without a limiter may
    /// ignore the call.
    fn set_rate_limit(&self, _bytes_per_second: u64, _burst_bytes: u64) {}

    /// Write a cache snapshot to one or more new TSM files, returned as
    /// temp paths for [`crate::storage::file_store::FileStore::replace`]
    fn write_snapshot(&self, snapshot: &CacheSnapshot) -> Result<Vec<PathBuf>>;

    /// Merge a group quickly, without fully rewriting blocks
    fn compact_fast(&self, group: &[PathBuf]) -> Result<Vec<PathBuf>>;

    /// Merge a group fully, rewriting and re-sorting all blocks
    fn compact_full(&self, group: &[PathBuf]) -> Result<Vec<PathBuf>>;
}

/// A boolean-literal-or-field expression attached to a series element during
/// deletes. Anything but `BooleanLiteral(true)` is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeriesExpr {
    /// A literal true/false
    BooleanLiteral(bool),
    /// A field reference; unsupported in deletes
    Field(String),
}

/// One series produced by a [`SeriesIterator`]
#[derive(Debug, Clone)]
pub struct SeriesElem {
    /// Measurement name
    pub name: Vec<u8>,
    /// Tag pairs
    pub tags: Tags,
    /// Optional filter expression attached by the query layer
    pub expr: Option<SeriesExpr>,
}

/// Iterator over series candidates for a delete
pub trait SeriesIterator: Send {
    /// Next series, or `None` when exhausted
    fn next(&mut self) -> Result<Option<SeriesElem>>;
}

/// Pin on an index file set; dropping the guard releases the pin
pub trait FileSetGuard: Send {}

/// The measurement/series index consumed by the engine
pub trait Index: Send + Sync {
    /// Stop index compactions so retained entries are not merged away
    fn disable_compactions(&self);

    /// Re-allow index compactions
    fn enable_compactions(&self);

    /// Wait for in-flight index compactions to finish
    fn wait(&self);

    /// Pin the current index file set for the duration of the guard
    fn retain_file_set(&self) -> Result<Box<dyn FileSetGuard>>;

    /// Iterate the series of a measurement, or `None` if it does not exist
    fn measurement_series_iterator(&self, name: &[u8])
        -> Result<Option<Box<dyn SeriesIterator>>>;

    /// Register series, assigning ids to those not yet known
    fn create_series_list_if_not_exists(&self, series: &[(Vec<u8>, Tags)]) -> Result<()>;

    /// Drop a series from the index
    fn drop_series(&self, series_id: SeriesId, key: &[u8], cascade: bool) -> Result<()>;

    /// Drop a measurement once it has no series left
    fn drop_measurement_if_series_not_exist(&self, name: &[u8]) -> Result<()>;

    /// Rebuild derived index state after bulk deletes
    fn rebuild(&self);
}

/// The series file mapping series keys to ids
pub trait SeriesFile: Send + Sync {
    /// Id of a series, or zero if the series is not present
    fn series_id(&self, name: &[u8], tags: &Tags) -> SeriesId;

    /// Remove a series id
    fn delete_series_id(&self, id: SeriesId) -> Result<()>;

    /// Stop series file compactions
    fn disable_compactions(&self);

    /// Re-allow series file compactions
    fn enable_compactions(&self);

    /// Wait for in-flight series file compactions to finish
    fn wait(&self);
}
