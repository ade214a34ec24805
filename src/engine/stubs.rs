//! Stub implementations of the engine's external collaborators.
//!
//! These implementations are intended for:
//! - **Unit and integration testing** without the production TSM codecs or
//!   a real index backend
//! - **Development and prototyping** of engine changes
//!
//! # Available stubs
//!
//! ## In-memory index ([`InMemoryIndex`])
//!
//! Implements both [`Index`] and [`SeriesFile`] over in-memory maps, so the
//! same instance can be wired into both seams.
//!
//! ## Flat TSM files ([`SimpleTsmFile`], [`SimpleTsmOpener`], [`SimpleTsmCompactor`])
//!
//! A plain length-prefixed columnar file format. It keeps the real
//! contracts — sorted keys, generation/sequence naming, temp-file handoff
//! to the file store, disabled/in-progress errors — but does none of the
//! block compression a production codec would.
//!
//! # Warning
//!
//! **These stubs are not suitable for production use:**
//!
//! - [`InMemoryIndex`] loses all data on restart
//! - [`SimpleTsmFile`] keeps tombstones in memory only
//! - the flat file format has no compression and no block index

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};

use crate::compaction::{parse_tsm_file_name, tsm_file_name};
use crate::engine::traits::{
    BatchDeleter, Compactor, FileSetGuard, Index, SeriesElem, SeriesFile, SeriesId,
    SeriesIterator, TsmFile, TsmFileOpener,
};
use crate::error::{EngineError, Result};
use crate::storage::cache::CacheSnapshot;
use crate::storage::file_store::{TMP_FILE_EXTENSION, TSM_FILE_EXTENSION};
use crate::sync::RateLimiter;
use crate::types::{make_key, Tags};
use crate::value::{sort_dedup, Value};

// =============================================================================
// Flat TSM file format
// =============================================================================

const SIMPLE_TSM_MAGIC: [u8; 4] = [0x53, 0x54, 0x53, 0x4D]; // "STSM"
const SIMPLE_TSM_VERSION: u8 = 1;

/// Write a flat TSM file: sorted keys, each with its values.
pub fn write_simple_tsm(path: &Path, entries: &BTreeMap<Vec<u8>, Vec<Value>>) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)?;
    let mut w = BufWriter::new(file);

    w.write_all(&SIMPLE_TSM_MAGIC)?;
    w.write_all(&[SIMPLE_TSM_VERSION])?;
    for (key, values) in entries {
        w.write_u16::<LittleEndian>(key.len() as u16)?;
        w.write_all(key)?;
        w.write_u32::<LittleEndian>(values.len() as u32)?;
        let mut buf = Vec::new();
        for value in values {
            value.encode_into(&mut buf);
        }
        w.write_all(&buf)?;
    }
    w.flush()?;
    w.get_ref().sync_data()?;
    Ok(())
}

/// Read a flat TSM file back into its key/value map.
pub fn read_simple_tsm(path: &Path) -> Result<BTreeMap<Vec<u8>, Vec<Value>>> {
    let corrupted = |reason: &str| EngineError::CorruptedData {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    if data.len() < 5 || data[0..4] != SIMPLE_TSM_MAGIC {
        return Err(corrupted("bad magic"));
    }
    if data[4] != SIMPLE_TSM_VERSION {
        return Err(corrupted("unsupported version"));
    }

    let mut entries = BTreeMap::new();
    let mut cursor = Cursor::new(&data[5..]);
    while (cursor.position() as usize) < data.len() - 5 {
        let key_len = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| corrupted("truncated key length"))? as usize;
        let mut key = vec![0u8; key_len];
        cursor
            .read_exact(&mut key)
            .map_err(|_| corrupted("truncated key"))?;
        let n = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| corrupted("truncated value count"))? as usize;
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            values.push(Value::decode_from(&mut cursor)?);
        }
        entries.insert(key, values);
    }
    Ok(entries)
}

/// An in-memory view over a flat TSM file
pub struct SimpleTsmFile {
    path: PathBuf,
    size: u64,
    entries: RwLock<BTreeMap<Vec<u8>, Vec<Value>>>,
    // Keeps the advised mapping alive so the prefetched pages stay warm.
    _mmap: Option<Mmap>,
}

impl SimpleTsmFile {
    /// Open the flat TSM file at `path`. With `madv_will_need` the file is
    /// mapped and the kernel advised that its pages will be needed soon.
    pub fn open(path: &Path, madv_will_need: bool) -> Result<Self> {
        let entries = read_simple_tsm(path)?;
        let size = std::fs::metadata(path)?.len();
        let mmap = if madv_will_need {
            advise_will_need(path, size)
        } else {
            None
        };
        Ok(Self {
            path: path.to_path_buf(),
            size,
            entries: RwLock::new(entries),
            _mmap: mmap,
        })
    }
}

/// Map the file and ask the kernel to prefetch its pages. The hint is best
/// effort; mapping or advise failures leave the file unmapped.
fn advise_will_need(path: &Path, size: u64) -> Option<Mmap> {
    if size == 0 {
        return None;
    }
    let file = File::open(path).ok()?;
    let mmap = unsafe { Mmap::map(&file) }.ok()?;
    #[cfg(unix)]
    let _ = mmap.advise(memmap2::Advice::WillNeed);
    Some(mmap)
}

impl TsmFile for SimpleTsmFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn key_range(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let entries = self.entries.read();
        let first = entries.keys().next()?.clone();
        let last = entries.keys().next_back()?.clone();
        Some((first, last))
    }

    fn time_range(&self) -> (i64, i64) {
        let entries = self.entries.read();
        let mut min = i64::MAX;
        let mut max = i64::MIN;
        for values in entries.values() {
            for value in values {
                min = min.min(value.unix_nano);
                max = max.max(value.unix_nano);
            }
        }
        (min, max)
    }

    fn key_iterator(&self, from: &[u8]) -> Box<dyn Iterator<Item = Vec<u8>> + '_> {
        let keys: Vec<Vec<u8>> = self
            .entries
            .read()
            .range(from.to_vec()..)
            .map(|(k, _)| k.clone())
            .collect();
        Box::new(keys.into_iter())
    }

    fn batch_delete(&self) -> Box<dyn BatchDeleter + '_> {
        Box::new(SimpleBatchDeleter {
            file: self,
            pending: Vec::new(),
        })
    }

    fn values(&self, key: &[u8]) -> Result<Vec<Value>> {
        Ok(self.entries.read().get(key).cloned().unwrap_or_default())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct SimpleBatchDeleter<'a> {
    file: &'a SimpleTsmFile,
    pending: Vec<(Vec<u8>, i64, i64)>,
}

impl BatchDeleter for SimpleBatchDeleter<'_> {
    fn delete_range(&mut self, keys: &[&[u8]], min: i64, max: i64) -> Result<()> {
        for key in keys {
            self.pending.push((key.to_vec(), min, max));
        }
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let mut entries = self.file.entries.write();
        for (key, min, max) in self.pending {
            let Some(values) = entries.get_mut(&key) else {
                continue;
            };
            values.retain(|v| v.unix_nano < min || v.unix_nano > max);
            if values.is_empty() {
                entries.remove(&key);
            }
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Opens [`SimpleTsmFile`]s for the file store
pub struct SimpleTsmOpener;

impl TsmFileOpener for SimpleTsmOpener {
    fn open(&self, path: &Path, madv_will_need: bool) -> Result<Arc<dyn TsmFile>> {
        Ok(Arc::new(SimpleTsmFile::open(path, madv_will_need)?))
    }
}

// =============================================================================
// Flat TSM compactor
// =============================================================================

/// Compactor producing flat TSM files
pub struct SimpleTsmCompactor {
    dir: PathBuf,
    compactions_enabled: AtomicBool,
    snapshots_enabled: AtomicBool,
    in_flight: Mutex<HashSet<PathBuf>>,
    rate_limit: Mutex<RateLimiter>,
}

impl SimpleTsmCompactor {
    /// Create a compactor writing into `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            compactions_enabled: AtomicBool::new(false),
            snapshots_enabled: AtomicBool::new(false),
            in_flight: Mutex::new(HashSet::new()),
            rate_limit: Mutex::new(RateLimiter::unlimited()),
        }
    }

    /// Charge the bytes written to `path` against the throughput limit,
    /// blocking until the bucket allows them.
    fn throttle(&self, path: &Path) {
        let written = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let limiter = self.rate_limit.lock().clone();
        limiter.take(written);
    }

    fn next_generation(&self) -> Result<u64> {
        let mut max_generation = 0u64;
        if self.dir.exists() {
            for dent in std::fs::read_dir(&self.dir)? {
                let path = dent?.path();
                if path
                    .extension()
                    .map(|e| e == TSM_FILE_EXTENSION)
                    .unwrap_or(false)
                {
                    if let Some((generation, _)) = parse_tsm_file_name(&path) {
                        max_generation = max_generation.max(generation);
                    }
                }
            }
        }
        Ok(max_generation + 1)
    }

    fn merge(&self, group: &[PathBuf]) -> Result<Vec<PathBuf>> {
        if !self.compactions_enabled.load(Ordering::SeqCst) {
            return Err(EngineError::CompactionsDisabled);
        }

        {
            let mut in_flight = self.in_flight.lock();
            if let Some(busy) = group.iter().find(|path| in_flight.contains(*path)) {
                return Err(EngineError::CompactionInProgress(
                    busy.display().to_string(),
                ));
            }
            for path in group {
                in_flight.insert(path.clone());
            }
        }

        let result = self.merge_inner(group);

        let mut in_flight = self.in_flight.lock();
        for path in group {
            in_flight.remove(path);
        }
        result
    }

    fn merge_inner(&self, group: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut sorted_group: Vec<&PathBuf> = group.iter().collect();
        sorted_group.sort();

        let mut merged: BTreeMap<Vec<u8>, Vec<Value>> = BTreeMap::new();
        let mut max_generation = 0u64;
        let mut max_sequence = 0u64;
        for path in sorted_group {
            if let Some((generation, sequence)) = parse_tsm_file_name(path) {
                max_generation = max_generation.max(generation);
                max_sequence = max_sequence.max(sequence);
            }
            for (key, values) in read_simple_tsm(path)? {
                merged.entry(key).or_default().extend(values);
            }
        }
        for values in merged.values_mut() {
            sort_dedup(values);
        }

        let name = tsm_file_name(max_generation, max_sequence + 1);
        let path = self
            .dir
            .join(format!("{}.{}", name, TMP_FILE_EXTENSION));
        write_simple_tsm(&path, &merged)?;
        self.throttle(&path);
        Ok(vec![path])
    }
}

impl Compactor for SimpleTsmCompactor {
    fn open(&self) {
        self.compactions_enabled.store(true, Ordering::SeqCst);
        self.snapshots_enabled.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.compactions_enabled.store(false, Ordering::SeqCst);
        self.snapshots_enabled.store(false, Ordering::SeqCst);
    }

    fn enable_compactions(&self) {
        self.compactions_enabled.store(true, Ordering::SeqCst);
    }

    fn disable_compactions(&self) {
        self.compactions_enabled.store(false, Ordering::SeqCst);
    }

    fn enable_snapshots(&self) {
        self.snapshots_enabled.store(true, Ordering::SeqCst);
    }

    fn disable_snapshots(&self) {
        self.snapshots_enabled.store(false, Ordering::SeqCst);
    }

    fn set_rate_limit(&self, bytes_per_second: u64, burst_bytes: u64) {
        *self.rate_limit.lock() = RateLimiter::new(bytes_per_second, burst_bytes);
    }

    fn write_snapshot(&self, snapshot: &CacheSnapshot) -> Result<Vec<PathBuf>> {
        if !self.snapshots_enabled.load(Ordering::SeqCst) {
            return Err(EngineError::CompactionsDisabled);
        }

        let mut entries: BTreeMap<Vec<u8>, Vec<Value>> = BTreeMap::new();
        snapshot.for_each(|key, values| {
            entries.insert(key.to_vec(), values.to_vec());
        });

        let generation = self.next_generation()?;
        let name = tsm_file_name(generation, 1);
        let path = self
            .dir
            .join(format!("{}.{}", name, TMP_FILE_EXTENSION));
        write_simple_tsm(&path, &entries)?;
        self.throttle(&path);
        Ok(vec![path])
    }

    fn compact_fast(&self, group: &[PathBuf]) -> Result<Vec<PathBuf>> {
        self.merge(group)
    }

    fn compact_full(&self, group: &[PathBuf]) -> Result<Vec<PathBuf>> {
        self.merge(group)
    }
}

// =============================================================================
// In-memory index and series file
// =============================================================================

struct SeriesEntry {
    id: SeriesId,
    tags: Tags,
}

#[derive(Default)]
struct IndexState {
    // series key -> entry
    series: BTreeMap<Vec<u8>, SeriesEntry>,
    // measurement name -> series keys
    measurements: HashMap<Vec<u8>, BTreeSet<Vec<u8>>>,
    deleted_ids: HashSet<SeriesId>,
    next_id: SeriesId,
}

/// In-memory implementation of both [`Index`] and [`SeriesFile`]
pub struct InMemoryIndex {
    state: Mutex<IndexState>,
    index_disables: AtomicI64,
    series_file_disables: AtomicI64,
    rebuilds: AtomicU64,
}

impl InMemoryIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IndexState {
                next_id: 1,
                ..Default::default()
            }),
            index_disables: AtomicI64::new(0),
            series_file_disables: AtomicI64::new(0),
            rebuilds: AtomicU64::new(0),
        }
    }

    /// Number of series currently registered
    pub fn series_count(&self) -> usize {
        self.state.lock().series.len()
    }

    /// True if a series with this key is registered
    pub fn has_series(&self, key: &[u8]) -> bool {
        self.state.lock().series.contains_key(key)
    }

    /// True if the measurement still exists
    pub fn measurement_exists(&self, name: &[u8]) -> bool {
        self.state.lock().measurements.contains_key(name)
    }

    /// Series ids removed through the series file seam
    pub fn deleted_series_ids(&self) -> Vec<SeriesId> {
        let mut ids: Vec<SeriesId> = self.state.lock().deleted_ids.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of times the index was rebuilt
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

struct NopFileSetGuard;
impl FileSetGuard for NopFileSetGuard {}

/// Iterator over a fixed list of series elements
pub struct VecSeriesIterator {
    elems: std::vec::IntoIter<SeriesElem>,
}

impl VecSeriesIterator {
    /// Create an iterator over `elems`
    pub fn new(elems: Vec<SeriesElem>) -> Self {
        Self {
            elems: elems.into_iter(),
        }
    }
}

impl SeriesIterator for VecSeriesIterator {
    fn next(&mut self) -> Result<Option<SeriesElem>> {
        Ok(self.elems.next())
    }
}

impl Index for InMemoryIndex {
    fn disable_compactions(&self) {
        self.index_disables.fetch_add(1, Ordering::SeqCst);
    }

    fn enable_compactions(&self) {
        self.index_disables.fetch_sub(1, Ordering::SeqCst);
    }

    fn wait(&self) {}

    fn retain_file_set(&self) -> Result<Box<dyn FileSetGuard>> {
        Ok(Box::new(NopFileSetGuard))
    }

    fn measurement_series_iterator(
        &self,
        name: &[u8],
    ) -> Result<Option<Box<dyn SeriesIterator>>> {
        let state = self.state.lock();
        let Some(keys) = state.measurements.get(name) else {
            return Ok(None);
        };
        let mut elems = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = state.series.get(key) {
                elems.push(SeriesElem {
                    name: name.to_vec(),
                    tags: entry.tags.clone(),
                    expr: None,
                });
            }
        }
        Ok(Some(Box::new(VecSeriesIterator::new(elems))))
    }

    fn create_series_list_if_not_exists(&self, series: &[(Vec<u8>, Tags)]) -> Result<()> {
        let mut state = self.state.lock();
        for (name, tags) in series {
            let key = make_key(name, tags);
            if state.series.contains_key(&key) {
                continue;
            }
            let id = state.next_id;
            state.next_id += 1;
            state.series.insert(
                key.clone(),
                SeriesEntry {
                    id,
                    tags: tags.clone(),
                },
            );
            state
                .measurements
                .entry(name.clone())
                .or_default()
                .insert(key);
        }
        Ok(())
    }

    fn drop_series(&self, _series_id: SeriesId, key: &[u8], _cascade: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.series.remove(key).is_none() {
            return Ok(());
        }
        let (name, _) = crate::types::parse_key(key);
        if let Some(keys) = state.measurements.get_mut(&name) {
            keys.remove(key);
        }
        Ok(())
    }

    fn drop_measurement_if_series_not_exist(&self, name: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let empty = state
            .measurements
            .get(name)
            .map(|keys| keys.is_empty())
            .unwrap_or(false);
        if empty {
            state.measurements.remove(name);
        }
        Ok(())
    }

    fn rebuild(&self) {
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
    }
}

impl SeriesFile for InMemoryIndex {
    fn series_id(&self, name: &[u8], tags: &Tags) -> SeriesId {
        let key = make_key(name, tags);
        self.state
            .lock()
            .series
            .get(&key)
            .map(|entry| entry.id)
            .unwrap_or(0)
    }

    fn delete_series_id(&self, id: SeriesId) -> Result<()> {
        self.state.lock().deleted_ids.insert(id);
        Ok(())
    }

    fn disable_compactions(&self) {
        self.series_file_disables.fetch_add(1, Ordering::SeqCst);
    }

    fn enable_compactions(&self) {
        self.series_file_disables.fetch_sub(1, Ordering::SeqCst);
    }

    fn wait(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::series_field_key;
    use tempfile::TempDir;

    #[test]
    fn test_simple_tsm_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000000001-000000001.tsm");

        let mut entries = BTreeMap::new();
        entries.insert(
            series_field_key(b"cpu,host=a", b"usage"),
            vec![Value::float(1, 0.5), Value::string(2, b"x".to_vec())],
        );
        write_simple_tsm(&path, &entries).unwrap();

        let read = read_simple_tsm(&path).unwrap();
        assert_eq!(read, entries);
    }

    #[test]
    fn test_simple_tsm_file_ranges() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000000001-000000001.tsm");

        let mut entries = BTreeMap::new();
        entries.insert(
            series_field_key(b"cpu,host=a", b"usage"),
            vec![Value::float(5, 0.5), Value::float(9, 0.9)],
        );
        entries.insert(
            series_field_key(b"mem,host=a", b"free"),
            vec![Value::float(3, 1.0)],
        );
        write_simple_tsm(&path, &entries).unwrap();

        let file = SimpleTsmFile::open(&path, false).unwrap();
        let (min_key, max_key) = file.key_range().unwrap();
        assert_eq!(min_key, series_field_key(b"cpu,host=a", b"usage"));
        assert_eq!(max_key, series_field_key(b"mem,host=a", b"free"));
        assert_eq!(file.time_range(), (3, 9));
        assert!(file.overlaps_time_range(9, 100));
        assert!(!file.overlaps_time_range(10, 100));
    }

    #[test]
    fn test_batch_delete_commit_and_rollback() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000000001-000000001.tsm");
        let key = series_field_key(b"cpu,host=a", b"usage");

        let mut entries = BTreeMap::new();
        entries.insert(key.clone(), vec![Value::float(5, 0.5), Value::float(20, 2.0)]);
        write_simple_tsm(&path, &entries).unwrap();
        let file = SimpleTsmFile::open(&path, false).unwrap();

        // Rolled back deletes leave the file untouched.
        let mut batch = file.batch_delete();
        batch.delete_range(&[key.as_slice()], 0, 100).unwrap();
        batch.rollback().unwrap();
        assert_eq!(file.values(&key).unwrap().len(), 2);

        // Committed deletes remove the range.
        let mut batch = file.batch_delete();
        batch.delete_range(&[key.as_slice()], 0, 10).unwrap();
        batch.commit().unwrap();
        assert_eq!(file.values(&key).unwrap(), vec![Value::float(20, 2.0)]);
    }

    #[test]
    fn test_compactor_disabled() {
        let dir = TempDir::new().unwrap();
        let compactor = SimpleTsmCompactor::new(dir.path());
        let err = compactor.compact_full(&[]).unwrap_err();
        assert!(matches!(err, EngineError::CompactionsDisabled));
    }

    #[test]
    fn test_open_with_madv_will_need() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000000001-000000001.tsm");
        let key = series_field_key(b"cpu,host=a", b"usage");

        let mut entries = BTreeMap::new();
        entries.insert(key.clone(), vec![Value::float(1, 0.5)]);
        write_simple_tsm(&path, &entries).unwrap();

        // The prefetch hint must not change what the file serves.
        let file = SimpleTsmFile::open(&path, true).unwrap();
        assert_eq!(file.values(&key).unwrap(), vec![Value::float(1, 0.5)]);
    }

    #[test]
    fn test_compactor_rate_limit_throttles_writes() {
        use crate::storage::cache::Cache;
        use std::time::{Duration, Instant};

        let dir = TempDir::new().unwrap();
        let compactor = SimpleTsmCompactor::new(dir.path());
        compactor.open();
        // A bucket barely larger than one snapshot file: the second write
        // has to wait for the bucket to refill.
        compactor.set_rate_limit(200, 64);

        let cache = Cache::new(0);
        let mut values = crate::types::ValuesMap::new();
        values.insert(
            series_field_key(b"cpu,host=a", b"usage"),
            vec![Value::float(1, 0.5)],
        );
        cache.write_multi(&values).unwrap();
        let snapshot = cache.snapshot().unwrap();

        let first = compactor.write_snapshot(&snapshot).unwrap();
        // Promote the temp file the way the file store would, so the next
        // snapshot lands in a new generation.
        let final_path = first[0].with_extension("");
        std::fs::rename(&first[0], &final_path).unwrap();

        let start = Instant::now();
        let second = compactor.write_snapshot(&snapshot).unwrap();
        // The bucket cannot hold two files' worth of tokens up front, so
        // the second write must have slept for a refill.
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert_ne!(first[0], second[0]);
    }

    #[test]
    fn test_compactor_merges_groups() {
        let dir = TempDir::new().unwrap();
        let key = series_field_key(b"cpu,host=a", b"usage");

        // Generation 2 is written as two files to exercise merging.
        for (generation, sequence, ts, value) in
            [(1u64, 1u64, 1i64, 1.0f64), (2, 1, 1, 9.0), (2, 2, 2, 2.0)]
        {
            let mut entries = BTreeMap::new();
            entries.insert(key.clone(), vec![Value::float(ts, value)]);
            let path = dir.path().join(tsm_file_name(generation, sequence));
            write_simple_tsm(&path, &entries).unwrap();
        }

        let compactor = SimpleTsmCompactor::new(dir.path());
        compactor.open();

        let group: Vec<PathBuf> = vec![
            dir.path().join(tsm_file_name(1, 1)),
            dir.path().join(tsm_file_name(2, 1)),
            dir.path().join(tsm_file_name(2, 2)),
        ];
        let out = compactor.compact_full(&group).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].to_string_lossy().ends_with("000000002-000000003.tsm.tmp"));

        // Later generations win duplicate timestamps.
        let merged = read_simple_tsm(&out[0]).unwrap();
        let values = &merged[&key];
        assert_eq!(values.len(), 2);
        assert_eq!(values[0], Value::float(1, 9.0));
        assert_eq!(values[1], Value::float(2, 2.0));
    }

    #[test]
    fn test_index_create_and_drop() {
        let index = InMemoryIndex::new();
        let tags = Tags::from_pairs([("host", "a")]);
        index
            .create_series_list_if_not_exists(&[(b"cpu".to_vec(), tags.clone())])
            .unwrap();

        let key = make_key(b"cpu", &tags);
        assert!(index.has_series(&key));
        let sid = index.series_id(b"cpu", &tags);
        assert!(sid > 0);

        index.drop_series(sid, &key, false).unwrap();
        assert!(!index.has_series(&key));
        assert_eq!(index.series_id(b"cpu", &tags), 0);

        assert!(index.measurement_exists(b"cpu"));
        index.drop_measurement_if_series_not_exist(b"cpu").unwrap();
        assert!(!index.measurement_exists(b"cpu"));
    }

    #[test]
    fn test_index_series_iterator() {
        let index = InMemoryIndex::new();
        for host in ["a", "b"] {
            index
                .create_series_list_if_not_exists(&[(
                    b"cpu".to_vec(),
                    Tags::from_pairs([("host", host)]),
                )])
                .unwrap();
        }

        let mut itr = index.measurement_series_iterator(b"cpu").unwrap().unwrap();
        let mut seen = 0;
        while let Some(elem) = itr.next().unwrap() {
            assert_eq!(elem.name, b"cpu");
            seen += 1;
        }
        assert_eq!(seen, 2);

        assert!(index.measurement_series_iterator(b"mem").unwrap().is_none());
    }
}
