//! In-memory write cache
//!
//! The cache holds recently written values keyed by composite key until a
//! snapshot compaction persists them to a TSM file. It applies back-pressure
//! once its configured memory limit is reached, and supports the snapshot /
//! clear protocol used by the engine:
//!
//! - [`Cache::snapshot`] moves the live region into an immutable snapshot
//!   region; only one snapshot may be outstanding at a time.
//! - [`Cache::clear_snapshot`] with `true` drops the snapshot after it has
//!   been persisted; with `false` it merges the snapshot back into the live
//!   region so the data is snapshotted again later.
//!
//! Reads merge the live and snapshot regions, so a value stays visible from
//! the moment `write_multi` returns until its TSM file is readable.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::metrics;
use crate::types::ValuesMap;
use crate::value::{sort_dedup, Value};

/// Errors surfaced by cache writes and snapshots
#[derive(Debug, Error)]
pub enum CacheError {
    /// The write would push the cache past its memory limit
    #[error("cache-max-memory-size exceeded: {size}/{limit}")]
    MaxMemorySizeExceeded {
        /// Cache size the write would have produced
        size: u64,
        /// Configured limit
        limit: u64,
    },

    /// A snapshot is already outstanding
    #[error("snapshot in progress")]
    SnapshotInProgress,
}

#[derive(Debug, Default)]
struct Entry {
    values: Vec<Value>,
    needs_sort: bool,
}

impl Entry {
    fn add(&mut self, values: &[Value]) {
        if let (Some(first), Some(last)) = (values.first(), self.values.last()) {
            if first.unix_nano <= last.unix_nano {
                self.needs_sort = true;
            }
        }
        self.values.extend_from_slice(values);
    }

    fn sorted_values(&self) -> Vec<Value> {
        let mut values = self.values.clone();
        if self.needs_sort {
            sort_dedup(&mut values);
        }
        values
    }
}

/// The immutable snapshot region produced by [`Cache::snapshot`]
pub struct CacheSnapshot {
    entries: Mutex<BTreeMap<Vec<u8>, Vec<Value>>>,
    size: AtomicU64,
}

impl CacheSnapshot {
    fn new(entries: BTreeMap<Vec<u8>, Vec<Value>>, size: u64) -> Self {
        Self {
            entries: Mutex::new(entries),
            size: AtomicU64::new(size),
        }
    }

    /// Byte size of the snapshot region
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Number of composite keys in the snapshot
    pub fn key_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Sorts and deduplicates every key's values, keeping the latest write
    /// for duplicate timestamps. Expensive; the engine runs this outside its
    /// write lock.
    pub fn deduplicate(&self) {
        let mut entries = self.entries.lock();
        for values in entries.values_mut() {
            sort_dedup(values);
        }
    }

    /// Visit every key and its values in ascending key order
    pub fn for_each<F: FnMut(&[u8], &[Value])>(&self, mut f: F) {
        let entries = self.entries.lock();
        for (key, values) in entries.iter() {
            f(key, values);
        }
    }

    fn values(&self, key: &[u8]) -> Vec<Value> {
        self.entries.lock().get(key).cloned().unwrap_or_default()
    }

    fn take_entries(&self) -> BTreeMap<Vec<u8>, Vec<Value>> {
        std::mem::take(&mut *self.entries.lock())
    }
}

/// Ordered in-memory values per composite key with snapshot semantics
pub struct Cache {
    // Guards the snapshot boundary: writers hold it shared, snapshot
    // transitions hold it exclusively.
    mu: RwLock<()>,
    store: DashMap<Vec<u8>, Entry>,
    store_size: AtomicU64,
    snapshot_size: AtomicU64,
    max_size: AtomicU64,
    snapshot: Mutex<Option<Arc<CacheSnapshot>>>,
    last_write: Mutex<Instant>,
    last_snapshot: Mutex<Instant>,
}

impl Cache {
    /// Create a cache with the given memory limit; a limit of 0 disables
    /// back-pressure
    pub fn new(max_size: u64) -> Self {
        Self {
            mu: RwLock::new(()),
            store: DashMap::new(),
            store_size: AtomicU64::new(0),
            snapshot_size: AtomicU64::new(0),
            max_size: AtomicU64::new(max_size),
            snapshot: Mutex::new(None),
            last_write: Mutex::new(Instant::now()),
            last_snapshot: Mutex::new(Instant::now()),
        }
    }

    /// Total size in bytes of the live and snapshot regions
    pub fn size(&self) -> u64 {
        self.store_size.load(Ordering::SeqCst) + self.snapshot_size.load(Ordering::SeqCst)
    }

    /// Configured memory limit; 0 means unlimited
    pub fn max_size(&self) -> u64 {
        self.max_size.load(Ordering::SeqCst)
    }

    /// Change the memory limit. Used to disable admission while reloading
    /// the cache from the WAL.
    pub fn set_max_size(&self, max_size: u64) {
        self.max_size.store(max_size, Ordering::SeqCst);
    }

    /// Instant of the last accepted write
    pub fn last_write_time(&self) -> Instant {
        *self.last_write.lock()
    }

    /// Write values for multiple composite keys.
    ///
    /// The whole batch is rejected when it would push the cache past its
    /// memory limit.
    pub fn write_multi(&self, values: &ValuesMap) -> Result<(), CacheError> {
        let add_size: u64 = values
            .values()
            .flat_map(|vs| vs.iter())
            .map(|v| v.size() as u64)
            .sum();

        let limit = self.max_size();
        if limit > 0 && self.size() + add_size > limit {
            metrics::CACHE_WRITES_TOTAL
                .with_label_values(&["rejected"])
                .inc();
            return Err(CacheError::MaxMemorySizeExceeded {
                size: self.size() + add_size,
                limit,
            });
        }

        let _guard = self.mu.read();
        for (key, vs) in values {
            if vs.is_empty() {
                continue;
            }
            self.store.entry(key.clone()).or_default().add(vs);
        }
        self.store_size.fetch_add(add_size, Ordering::SeqCst);
        *self.last_write.lock() = Instant::now();

        metrics::CACHE_WRITES_TOTAL.with_label_values(&["ok"]).inc();
        metrics::CACHE_SIZE_BYTES.set(self.store_size.load(Ordering::SeqCst) as f64);
        Ok(())
    }

    /// Move the live region into a new snapshot region and return it.
    ///
    /// Fails if a snapshot is already outstanding.
    pub fn snapshot(&self) -> Result<Arc<CacheSnapshot>, CacheError> {
        let _guard = self.mu.write();
        let mut slot = self.snapshot.lock();
        if slot.is_some() {
            return Err(CacheError::SnapshotInProgress);
        }

        let mut entries = BTreeMap::new();
        for item in self.store.iter() {
            entries.insert(item.key().clone(), item.value().sorted_values());
        }

        let size = self.store_size.swap(0, Ordering::SeqCst);
        self.snapshot_size.store(size, Ordering::SeqCst);

        let snap = Arc::new(CacheSnapshot::new(entries, size));
        *slot = Some(Arc::clone(&snap));

        // Publish the snapshot before emptying the live region so readers
        // never observe a gap. Duplicates across the two regions merge away
        // in values().
        let keys: Vec<Vec<u8>> = self.store.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.store.remove(&key);
        }

        metrics::CACHE_SIZE_BYTES.set(0.0);
        metrics::CACHE_SNAPSHOT_BYTES.set(size as f64);
        Ok(snap)
    }

    /// Clear the outstanding snapshot region.
    ///
    /// `success == true` drops the snapshot; `success == false` merges it
    /// back into the live region.
    pub fn clear_snapshot(&self, success: bool) {
        let _guard = self.mu.write();
        let mut slot = self.snapshot.lock();
        let Some(snap) = slot.take() else {
            return;
        };

        if success {
            self.snapshot_size.store(0, Ordering::SeqCst);
            *self.last_snapshot.lock() = Instant::now();
            metrics::CACHE_SNAPSHOT_BYTES.set(0.0);
            metrics::CACHE_AGE_SECONDS.set(0.0);
            return;
        }

        let mut restored = 0u64;
        for (key, values) in snap.take_entries() {
            restored += values.iter().map(|v| v.size() as u64).sum::<u64>();
            self.store.entry(key).or_default().add(&values);
        }
        self.store_size.fetch_add(restored, Ordering::SeqCst);
        self.snapshot_size.store(0, Ordering::SeqCst);
        metrics::CACHE_SIZE_BYTES.set(self.store_size.load(Ordering::SeqCst) as f64);
        metrics::CACHE_SNAPSHOT_BYTES.set(0.0);
    }

    /// Values for a composite key, merged across the live and snapshot
    /// regions, sorted by timestamp with duplicates resolved to the latest
    /// write
    pub fn values(&self, key: &[u8]) -> Vec<Value> {
        let mut values = {
            let slot = self.snapshot.lock();
            match slot.as_ref() {
                Some(snap) => snap.values(key),
                None => Vec::new(),
            }
        };
        if let Some(entry) = self.store.get(key) {
            values.extend(entry.sorted_values());
        }
        sort_dedup(&mut values);
        values
    }

    /// Remove values in `[min, max]` for each key from the live region
    pub fn delete_range(&self, keys: &[Vec<u8>], min: i64, max: i64) {
        let _guard = self.mu.read();
        let mut removed = 0u64;
        for key in keys {
            let Some(mut entry) = self.store.get_mut(key.as_slice()) else {
                continue;
            };
            entry.values.retain(|v| {
                let delete = v.unix_nano >= min && v.unix_nano <= max;
                if delete {
                    removed += v.size() as u64;
                }
                !delete
            });
            let empty = entry.values.is_empty();
            drop(entry);
            if empty {
                self.store.remove(key.as_slice());
            }
        }
        let _ = self
            .store_size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |size| {
                Some(size.saturating_sub(removed))
            });
        metrics::CACHE_SIZE_BYTES.set(self.store_size.load(Ordering::SeqCst) as f64);
    }

    /// Visit every composite key in the live region. Iteration order is
    /// arbitrary.
    pub fn apply_entry_fn<F: FnMut(&[u8])>(&self, mut f: F) {
        for item in self.store.iter() {
            f(item.key());
        }
    }

    /// Refresh the cache-age gauge; called once per tick by the snapshot
    /// loop
    pub fn update_age(&self) {
        let age = self.last_snapshot.lock().elapsed();
        metrics::CACHE_AGE_SECONDS.set(age.as_secs_f64());
    }

    /// Release all cache memory. Only sensible once the cache is empty or
    /// its contents are no longer needed.
    pub fn free(&self) {
        let _guard = self.mu.write();
        self.store.clear();
        self.store.shrink_to_fit();
        *self.snapshot.lock() = None;
        self.store_size.store(0, Ordering::SeqCst);
        self.snapshot_size.store(0, Ordering::SeqCst);
        metrics::CACHE_SIZE_BYTES.set(0.0);
        metrics::CACHE_SNAPSHOT_BYTES.set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::series_field_key;

    fn values_map(key: &[u8], values: Vec<Value>) -> ValuesMap {
        let mut map = ValuesMap::new();
        map.insert(key.to_vec(), values);
        map
    }

    #[test]
    fn test_write_and_read() {
        let cache = Cache::new(0);
        let key = series_field_key(b"cpu,host=a", b"usage");
        cache
            .write_multi(&values_map(&key, vec![Value::float(1, 0.5)]))
            .unwrap();

        let values = cache.values(&key);
        assert_eq!(values, vec![Value::float(1, 0.5)]);
        assert!(cache.size() > 0);
    }

    #[test]
    fn test_max_size_back_pressure() {
        let cache = Cache::new(16);
        let key = series_field_key(b"cpu,host=a", b"usage");
        let err = cache
            .write_multi(&values_map(
                &key,
                vec![Value::float(1, 0.5), Value::float(2, 0.6)],
            ))
            .unwrap_err();
        assert!(matches!(err, CacheError::MaxMemorySizeExceeded { .. }));
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_snapshot_and_clear_success() {
        let cache = Cache::new(0);
        let key = series_field_key(b"cpu,host=a", b"usage");
        cache
            .write_multi(&values_map(&key, vec![Value::float(1, 0.5)]))
            .unwrap();

        let snap = cache.snapshot().unwrap();
        assert_eq!(snap.key_count(), 1);
        // Values remain visible while the snapshot is outstanding.
        assert_eq!(cache.values(&key).len(), 1);
        assert!(cache.size() > 0);

        // Only one snapshot may be outstanding.
        assert!(matches!(
            cache.snapshot(),
            Err(CacheError::SnapshotInProgress)
        ));

        cache.clear_snapshot(true);
        assert_eq!(cache.size(), 0);
        assert!(cache.values(&key).is_empty());
    }

    #[test]
    fn test_snapshot_rollback_restores_values() {
        let cache = Cache::new(0);
        let key = series_field_key(b"cpu,host=a", b"usage");
        cache
            .write_multi(&values_map(&key, vec![Value::float(1, 0.5)]))
            .unwrap();

        let _snap = cache.snapshot().unwrap();
        cache.clear_snapshot(false);

        assert_eq!(cache.values(&key), vec![Value::float(1, 0.5)]);
        assert!(cache.size() > 0);
        // A new snapshot picks the restored values up again.
        let snap = cache.snapshot().unwrap();
        assert_eq!(snap.key_count(), 1);
    }

    #[test]
    fn test_writes_during_snapshot_merge_in_reads() {
        let cache = Cache::new(0);
        let key = series_field_key(b"cpu,host=a", b"usage");
        cache
            .write_multi(&values_map(&key, vec![Value::float(1, 0.5)]))
            .unwrap();

        let _snap = cache.snapshot().unwrap();
        cache
            .write_multi(&values_map(&key, vec![Value::float(2, 0.6)]))
            .unwrap();

        let values = cache.values(&key);
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].unix_nano, 1);
        assert_eq!(values[1].unix_nano, 2);
    }

    #[test]
    fn test_delete_range() {
        let cache = Cache::new(0);
        let key = series_field_key(b"cpu,host=a", b"usage");
        cache
            .write_multi(&values_map(
                &key,
                vec![
                    Value::float(3, 3.0),
                    Value::float(7, 7.0),
                    Value::float(12, 12.0),
                ],
            ))
            .unwrap();

        cache.delete_range(&[key.clone()], 5, 10);
        let values = cache.values(&key);
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].unix_nano, 3);
        assert_eq!(values[1].unix_nano, 12);

        // Deleting the rest removes the key entirely.
        cache.delete_range(&[key.clone()], i64::MIN, i64::MAX);
        assert!(cache.values(&key).is_empty());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_apply_entry_fn_sees_all_keys() {
        let cache = Cache::new(0);
        for i in 0..10 {
            let key = series_field_key(format!("cpu,host={}", i).as_bytes(), b"usage");
            cache
                .write_multi(&values_map(&key, vec![Value::float(1, 1.0)]))
                .unwrap();
        }
        let mut seen = 0;
        cache.apply_entry_fn(|_| seen += 1);
        assert_eq!(seen, 10);
    }

    #[test]
    fn test_duplicate_timestamps_last_write_wins() {
        let cache = Cache::new(0);
        let key = series_field_key(b"cpu,host=a", b"usage");
        cache
            .write_multi(&values_map(&key, vec![Value::float(1, 0.5)]))
            .unwrap();
        cache
            .write_multi(&values_map(&key, vec![Value::float(1, 0.9)]))
            .unwrap();

        let values = cache.values(&key);
        assert_eq!(values, vec![Value::float(1, 0.9)]);
    }

    #[test]
    fn test_free_clears_everything() {
        let cache = Cache::new(0);
        let key = series_field_key(b"cpu,host=a", b"usage");
        cache
            .write_multi(&values_map(&key, vec![Value::float(1, 0.5)]))
            .unwrap();
        cache.free();
        assert_eq!(cache.size(), 0);
        assert!(cache.values(&key).is_empty());
    }
}
