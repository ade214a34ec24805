//! Storage engine core
//!
//! The engine coordinates three tiers — the in-memory [`Cache`], the
//! append-only WAL and the immutable [`FileStore`] — and the compaction
//! subsystem that merges TSM files across levels.
//!
//! Two background loops run while compactions are enabled, each ticking at
//! 1 Hz:
//!
//! - the *snapshot loop* persists the cache to a new TSM file once it grows
//!   past its flush threshold or goes write-cold, then removes the WAL
//!   segments the snapshot covers;
//! - the *level loop* asks the planner for compaction groups, consults the
//!   scheduler for the next level to dispatch, and hands groups to a
//!   bounded worker pool.
//!
//! The two loops are gated independently. The snapshot gate is a simple
//! single-flight toggle. The level gate is reference-counted: callers that
//! must keep compactions off for a while (deletes, which need their
//! tombstones to survive) disable with `wait = true` and re-enable when
//! done; the loop only restarts once every such hold has been released.

pub mod stubs;
pub mod traits;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::compaction::{
    CompactionGroup, CompactionLevel, CompactionPlanner, CompactionTracker, DefaultPlanner,
    Scheduler,
};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::storage::cache::{Cache, CacheSnapshot};
use crate::storage::file_store::{FileStore, TMP_FILE_EXTENSION};
use crate::storage::wal::{self, CacheLoader, NopWal};
use crate::sync::{FixedLimiter, StopSignal, WaitGroup};
use crate::types::{
    make_key, normalize_time_range, parse_key, series_and_field_from_composite_key, Point, Tags,
    ValuesMap, KEY_FIELD_SEPARATOR_BYTES,
};
use crate::value::Value;
use traits::{
    Compactor, Index, Log, SeriesExpr, SeriesFile, SeriesIterator, TsmFile, TsmFileOpener,
};

/// Size in bytes at which a batch of series keys to delete is flushed
const DELETE_FLUSH_THRESHOLD: usize = 50 * 1024 * 1024;

/// Predicate consulted per series during a delete: returns the time range to
/// delete and whether the series should be deleted at all
pub type DeletePredicate = Box<dyn FnMut(&[u8], &Tags) -> (i64, i64, bool) + Send>;

#[derive(Default)]
struct LevelGate {
    stop: Option<StopSignal>,
    wg: Option<WaitGroup>,
    // Number of outstanding "hold compactions disabled" tokens.
    workers: i64,
}

#[derive(Default)]
struct SnapshotGate {
    stop: Option<StopSignal>,
    wg: Option<WaitGroup>,
}

enum GateAction {
    Idle,
    TearDown(WaitGroup),
    WaitForTearDown(StopSignal, WaitGroup),
}

/// Builder for wiring an [`Engine`] with its collaborators
pub struct EngineBuilder {
    path: PathBuf,
    config: Config,
    index: Option<Arc<dyn Index>>,
    series_file: Option<Arc<dyn SeriesFile>>,
    wal: Option<Arc<dyn Log>>,
    compactor: Option<Arc<dyn Compactor>>,
    tsm_opener: Option<Arc<dyn TsmFileOpener>>,
    planner: Option<Arc<dyn CompactionPlanner>>,
}

impl EngineBuilder {
    /// Start building an engine rooted at `path`
    pub fn new(path: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            path: path.into(),
            config,
            index: None,
            series_file: None,
            wal: None,
            compactor: None,
            tsm_opener: None,
            planner: None,
        }
    }

    /// Set the measurement/series index
    pub fn with_index(mut self, index: Arc<dyn Index>) -> Self {
        self.index = Some(index);
        self
    }

    /// Set the series file
    pub fn with_series_file(mut self, series_file: Arc<dyn SeriesFile>) -> Self {
        self.series_file = Some(series_file);
        self
    }

    /// Set the WAL. Defaults to a no-op log when not configured.
    pub fn with_wal(mut self, wal: Arc<dyn Log>) -> Self {
        self.wal = Some(wal);
        self
    }

    /// Set the compactor
    pub fn with_compactor(mut self, compactor: Arc<dyn Compactor>) -> Self {
        self.compactor = Some(compactor);
        self
    }

    /// Set the TSM file opener used by the file store
    pub fn with_tsm_opener(mut self, opener: Arc<dyn TsmFileOpener>) -> Self {
        self.tsm_opener = Some(opener);
        self
    }

    /// Set a custom compaction planner. Defaults to [`DefaultPlanner`].
    pub fn with_planner(mut self, planner: Arc<dyn CompactionPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Build the engine
    pub fn build(self) -> Result<Arc<Engine>> {
        let index = self
            .index
            .ok_or_else(|| EngineError::Configuration("no index configured".to_string()))?;
        let series_file = self
            .series_file
            .ok_or_else(|| EngineError::Configuration("no series file configured".to_string()))?;
        let compactor = self
            .compactor
            .ok_or_else(|| EngineError::Configuration("no compactor configured".to_string()))?;
        let tsm_opener = self.tsm_opener.ok_or_else(|| {
            EngineError::Configuration("no TSM file opener configured".to_string())
        })?;

        // Wire the throughput limit into whichever compactor was injected.
        compactor.set_rate_limit(
            self.config.compaction.throughput_bytes,
            self.config.compaction.throughput_burst_bytes,
        );

        let max_compactions = self.config.compaction.max_concurrent_compactions();
        let file_store = Arc::new(FileStore::new(
            &self.path,
            tsm_opener,
            self.config.storage.max_concurrent_opens,
            self.config.storage.madv_will_need,
        ));
        let planner = self.planner.unwrap_or_else(|| {
            Arc::new(DefaultPlanner::new(
                Arc::clone(&file_store),
                self.config.compaction.full_write_cold_duration(),
            ))
        });
        let tracker = Arc::new(CompactionTracker::new());

        Ok(Arc::new_cyclic(|me| Engine {
            me: me.clone(),
            cache_flush_memory_size_threshold: self.config.cache.snapshot_memory_size,
            cache_flush_write_cold_duration: self.config.cache.snapshot_write_cold_duration(),
            cache: Arc::new(Cache::new(self.config.cache.max_memory_size)),
            wal: self.wal.unwrap_or_else(|| Arc::new(NopWal::new())),
            scheduler: Scheduler::new(max_compactions, Arc::clone(&tracker)),
            limiter: FixedLimiter::new(max_compactions),
            enable_compactions_on_open: AtomicBool::new(true),
            level_gate: Mutex::new(LevelGate::default()),
            snapshot_gate: Mutex::new(SnapshotGate::default()),
            path: self.path,
            index,
            series_file,
            compactor,
            planner,
            file_store,
            tracker,
            mu: tokio::sync::RwLock::new(()),
        }))
    }
}

/// The storage engine core. Built behind an [`Arc`]; background loops hold
/// clones of it.
pub struct Engine {
    // Self-handle for spawning background tasks.
    me: Weak<Engine>,

    // Coordinates writers with snapshot rotation. Never held across
    // blocking compactor work.
    mu: tokio::sync::RwLock<()>,

    path: PathBuf,
    index: Arc<dyn Index>,
    series_file: Arc<dyn SeriesFile>,

    wal: Arc<dyn Log>,
    cache: Arc<Cache>,
    compactor: Arc<dyn Compactor>,
    planner: Arc<dyn CompactionPlanner>,
    file_store: Arc<FileStore>,

    cache_flush_memory_size_threshold: u64,
    cache_flush_write_cold_duration: Duration,

    enable_compactions_on_open: AtomicBool,

    tracker: Arc<CompactionTracker>,
    limiter: FixedLimiter,
    scheduler: Scheduler,

    level_gate: Mutex<LevelGate>,
    snapshot_gate: Mutex<SnapshotGate>,
}

impl Engine {
    /// Path the engine was built with
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The engine's cache tier
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// The engine's file store tier
    pub fn file_store(&self) -> &Arc<FileStore> {
        &self.file_store
    }

    /// The engine's compaction planner
    pub fn planner(&self) -> &Arc<dyn CompactionPlanner> {
        &self.planner
    }

    /// The engine's compaction tracker
    pub fn compaction_tracker(&self) -> &Arc<CompactionTracker> {
        &self.tracker
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open and initialize the engine: remove stale temp files, open the
    /// WAL and file store, reload the cache from the WAL and start
    /// compactions if enabled.
    pub async fn open(&self) -> Result<()> {
        fs::create_dir_all(&self.path)?;
        self.cleanup()?;

        self.wal.open()?;
        self.file_store.open().await?;
        self.reload_cache()?;
        self.compactor.open();

        if self.enable_compactions_on_open.load(Ordering::SeqCst) {
            self.set_compactions_enabled(true).await;
        }

        info!(path = %self.path.display(), tsm_files = self.file_store.count(), "engine opened");
        Ok(())
    }

    /// Close the engine: stop compactions, close the file store and the
    /// WAL. Subsequent calls are a no-op.
    pub async fn close(&self) -> Result<()> {
        self.set_compactions_enabled(false).await;

        let _guard = self.mu.write().await;
        {
            let mut gate = self.level_gate.lock();
            gate.stop = None;
            gate.wg = None;
        }

        self.file_store.close()?;
        self.wal.close()?;
        Ok(())
    }

    /// Set whether the engine is enabled; also applied at the next `open`
    pub async fn set_enabled(&self, enabled: bool) {
        self.enable_compactions_on_open
            .store(enabled, Ordering::SeqCst);
        self.set_compactions_enabled(enabled).await;
    }

    /// Toggle both compaction gates. Disabling stops the background loops;
    /// in-flight worker tasks run to completion.
    pub async fn set_compactions_enabled(&self, enabled: bool) {
        if enabled {
            self.enable_snapshot_compactions();
            self.enable_level_compactions(false);
        } else {
            self.disable_snapshot_compactions().await;
            self.disable_level_compactions(false).await;
        }
    }

    /// True if the cache is empty, no compactions are running and the shard
    /// is fully compacted
    pub fn is_idle(&self) -> bool {
        self.cache.size() == 0 && self.tracker.all_active() == 0 && self.planner.fully_compacted()
    }

    /// Release memory held by the cache
    pub fn free(&self) {
        self.cache.free();
    }

    /// Total size in bytes of all TSM files and WAL segments on disk
    pub fn disk_size(&self) -> u64 {
        self.file_store.disk_size_bytes() + self.wal.disk_size_bytes()
    }

    /// Time the shard was last modified
    pub fn last_modified(&self) -> SystemTime {
        self.file_store
            .last_modified()
            .max(self.wal.last_write_time())
    }

    /// Register series with the index, assigning ids to new ones
    pub fn create_series_list_if_not_exists(&self, series: &[(Vec<u8>, Tags)]) -> Result<()> {
        self.index.create_series_list_if_not_exists(series)
    }

    /// Removes all temp files and stale snapshot directories. Only run at
    /// startup, before any compaction can own a temp file.
    fn cleanup(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for dent in entries {
            let dent = dent?;
            let path = dent.path();
            let is_tmp = path
                .extension()
                .map(|e| e == TMP_FILE_EXTENSION)
                .unwrap_or(false);
            if !is_tmp {
                continue;
            }
            if path.is_dir() {
                debug!(path = %path.display(), "removing stale snapshot directory");
                fs::remove_dir_all(&path)?;
            } else {
                debug!(path = %path.display(), "removing stale compaction temp file");
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Reads the WAL segment files and loads them into the cache, with the
    /// cache size limit disabled for the duration of the load.
    fn reload_cache(&self) -> Result<()> {
        let start = Instant::now();
        let files = wal::segment_file_names(self.wal.path())?;

        let limit = self.cache.max_size();
        self.cache.set_max_size(0);
        let result = CacheLoader::new(files).load(&self.cache);
        self.cache.set_max_size(limit);
        result?;

        trace!(
            path = %self.wal.path().display(),
            duration_ms = start.elapsed().as_millis() as u64,
            "reloaded WAL cache"
        );
        Ok(())
    }

    // =========================================================================
    // Compaction gates
    // =========================================================================

    /// Request that level compactions start back up again.
    ///
    /// `wait = true` releases a hold taken by a corresponding
    /// `disable_level_compactions(true)`; the loop restarts only once every
    /// hold is released.
    fn enable_level_compactions(&self, wait: bool) {
        let Some(engine) = self.me.upgrade() else {
            return;
        };

        let mut gate = self.level_gate.lock();
        if wait {
            gate.workers -= 1;
        }
        if gate.workers != 0 || gate.stop.is_some() {
            // Still waiting on more holds, or already enabled.
            return;
        }

        self.compactor.enable_compactions();
        let stop = StopSignal::new();
        let wg = WaitGroup::new();
        gate.stop = Some(stop.clone());
        gate.wg = Some(wg.clone());
        drop(gate);

        let guard = wg.add();
        tokio::spawn(async move {
            let _guard = guard;
            engine.compact_loop(stop, wg).await;
        });
    }

    /// Stop level compactions before returning.
    ///
    /// With `wait = true` the caller takes a hold that keeps compactions
    /// disabled until a matching `enable_level_compactions(true)`.
    async fn disable_level_compactions(&self, wait: bool) {
        let action = {
            let mut gate = self.level_gate.lock();
            let old = gate.workers;
            if wait {
                gate.workers += 1;
            }

            match (gate.stop.clone(), gate.wg.clone()) {
                (Some(stop), Some(wg)) => {
                    if old == 0 && !stop.is_stopped() {
                        // First disabler: stop the loop and wait for every
                        // worker to drain.
                        self.compactor.disable_compactions();
                        stop.stop();
                        GateAction::TearDown(wg)
                    } else {
                        // Another disabler is already tearing down.
                        GateAction::WaitForTearDown(stop, wg)
                    }
                }
                _ => GateAction::Idle,
            }
        };

        match action {
            GateAction::Idle => {}
            GateAction::TearDown(wg) => {
                wg.wait().await;
                let mut gate = self.level_gate.lock();
                gate.stop = None;
                gate.wg = None;
            }
            GateAction::WaitForTearDown(stop, wg) => {
                stop.stopped().await;
                wg.wait().await;
            }
        }
    }

    fn enable_snapshot_compactions(&self) {
        let Some(engine) = self.me.upgrade() else {
            return;
        };

        let mut gate = self.snapshot_gate.lock();
        if gate.stop.is_some() {
            return;
        }

        self.compactor.enable_snapshots();
        let stop = StopSignal::new();
        let wg = WaitGroup::new();
        gate.stop = Some(stop.clone());
        gate.wg = Some(wg.clone());
        drop(gate);

        let guard = wg.add();
        tokio::spawn(async move {
            let _guard = guard;
            engine.compact_cache_loop(stop).await;
        });
    }

    async fn disable_snapshot_compactions(&self) {
        let action = {
            let mut gate = self.snapshot_gate.lock();
            match (gate.stop.clone(), gate.wg.clone()) {
                (Some(stop), Some(wg)) => {
                    if stop.is_stopped() {
                        GateAction::WaitForTearDown(stop, wg)
                    } else {
                        stop.stop();
                        self.compactor.disable_snapshots();
                        GateAction::TearDown(wg)
                    }
                }
                _ => GateAction::Idle,
            }
        };

        match action {
            GateAction::Idle => return,
            GateAction::TearDown(wg) => {
                wg.wait().await;
                let mut gate = self.snapshot_gate.lock();
                gate.stop = None;
                gate.wg = None;
            }
            GateAction::WaitForTearDown(stop, wg) => {
                stop.stopped().await;
                wg.wait().await;
                return;
            }
        }

        // The snapshot loop is down; if the cache is empty release its
        // memory too.
        if self.cache.size() == 0 {
            self.cache.free();
        }
    }

    /// Force the engine to fully compact all stored data: snapshot the
    /// cache, cancel running compaction planning, force a full plan and
    /// restart. Expensive.
    pub async fn schedule_full_compaction(&self) -> Result<()> {
        self.write_snapshot().await?;
        self.set_compactions_enabled(false).await;
        self.planner.force_full();
        self.set_compactions_enabled(true).await;
        Ok(())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write a batch of points into the cache and then durably into the
    /// WAL. The batch is rejected whole if the cache is over its memory
    /// limit.
    pub async fn write_points(&self, points: &[Point]) -> Result<()> {
        let mut values: ValuesMap = ValuesMap::with_capacity(points.len());
        let mut key_buf: Vec<u8> = Vec::new();

        for point in points {
            key_buf.clear();
            key_buf.extend_from_slice(point.key());
            key_buf.extend_from_slice(KEY_FIELD_SEPARATOR_BYTES);
            let base_len = key_buf.len();
            let time = point.time();

            for (field, field_value) in point.fields() {
                key_buf.truncate(base_len);
                key_buf.extend_from_slice(field);
                values
                    .entry(key_buf.clone())
                    .or_default()
                    .push(Value::new(time, field_value.clone()));
            }
        }

        let _guard = self.mu.read().await;

        // Cache first so reads observe the write immediately; the WAL then
        // makes it recoverable.
        self.cache.write_multi(&values)?;
        self.wal.write_multi(&values)?;
        Ok(())
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// True if the cache is over its flush threshold or has gone
    /// write-cold. An empty cache never triggers a snapshot.
    pub fn should_compact_cache(&self, now: Instant) -> bool {
        let size = self.cache.size();
        if size == 0 {
            return false;
        }
        if size > self.cache_flush_memory_size_threshold {
            return true;
        }
        now.saturating_duration_since(self.cache.last_write_time())
            > self.cache_flush_write_cold_duration
    }

    /// Snapshot the cache and write a new TSM file with its contents,
    /// releasing the snapshot when done.
    pub async fn write_snapshot(&self) -> Result<()> {
        let started = Instant::now();
        let result = self.write_snapshot_inner().await;
        match &result {
            Ok(()) => info!(
                path = %self.path.display(),
                duration_ms = started.elapsed().as_millis() as u64,
                "snapshot written"
            ),
            Err(EngineError::CompactionsDisabled) => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "error writing snapshot"),
        }
        result
    }

    async fn write_snapshot_inner(&self) -> Result<()> {
        // Rotate the WAL and snapshot the cache under the write lock, then
        // release it before the expensive work.
        let (closed_segments, snapshot) = {
            let _guard = self.mu.write().await;
            self.wal.close_segment()?;
            let segments = self.wal.closed_segments()?;
            let snapshot = self.cache.snapshot()?;
            (segments, snapshot)
        };

        if snapshot.size() == 0 {
            self.cache.clear_snapshot(true);
            return Ok(());
        }

        // The snapshotted cache may hold duplicate and unsorted points.
        let dedup_start = Instant::now();
        snapshot.deduplicate();
        trace!(
            path = %self.path.display(),
            duration_ms = dedup_start.elapsed().as_millis() as u64,
            "snapshot deduplicated"
        );

        let result = self
            .write_snapshot_and_commit(&closed_segments, &snapshot)
            .await;
        if result.is_err() {
            self.cache.clear_snapshot(false);
        }
        result
    }

    async fn write_snapshot_and_commit(
        &self,
        closed_segments: &[PathBuf],
        snapshot: &Arc<CacheSnapshot>,
    ) -> Result<()> {
        // The compactor blocks on file writes and its rate limiter.
        let new_files = {
            let compactor = Arc::clone(&self.compactor);
            let snapshot = Arc::clone(snapshot);
            tokio::task::spawn_blocking(move || compactor.write_snapshot(&snapshot))
                .await
                .map_err(|e| EngineError::Io(std::io::Error::other(e.to_string())))??
        };

        let _guard = self.mu.read().await;

        self.file_store.replace(&[], &new_files)?;
        self.cache.clear_snapshot(true);

        if let Err(e) = self.wal.remove(closed_segments) {
            warn!(error = %e, "error removing closed WAL segments");
        }
        Ok(())
    }

    /// Background loop: checks once per second whether the cache should be
    /// written to disk.
    async fn compact_cache_loop(self: Arc<Self>, stop: StopSignal) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.stopped() => {
                    debug!(path = %self.path.display(), "snapshot compactions stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.cache.update_age();
                    if self.should_compact_cache(Instant::now()) {
                        let start = Instant::now();
                        trace!(path = %self.path.display(), "compacting cache");
                        let result = self.write_snapshot().await;
                        let soft = matches!(result, Ok(()) | Err(EngineError::CompactionsDisabled));
                        if !soft {
                            if let Err(e) = &result {
                                error!(error = %e, "error writing snapshot");
                            }
                        }
                        self.tracker.snapshot_attempted(soft, start.elapsed());
                    }
                }
            }
        }
    }

    // =========================================================================
    // Level compactions
    // =========================================================================

    /// Background loop: plans and dispatches level compactions once per
    /// second.
    async fn compact_loop(self: Arc<Self>, stop: StopSignal, workers: WaitGroup) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.stopped() => {
                    debug!(path = %self.path.display(), "level compactions stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.compact_tick(&workers);
                }
            }
        }
    }

    fn compact_tick(&self, workers: &WaitGroup) {
        let mut level1 = self.planner.plan_level(1);
        let mut level2 = self.planner.plan_level(2);
        let mut level3 = self.planner.plan_level(3);

        let mut level4 = self.planner.plan(self.file_store.last_modified());
        self.tracker.set_optimize_queue(level4.len() as u64);

        // If no full compactions are needed, see if an optimize is.
        let mut level4_optimize = false;
        if level4.is_empty() {
            level4 = self.planner.plan_optimize();
            level4_optimize = true;
            self.tracker.set_optimize_queue(level4.len() as u64);
        }

        self.tracker
            .set_queue(CompactionLevel::One, level1.len() as u64);
        self.tracker
            .set_queue(CompactionLevel::Two, level2.len() as u64);
        self.tracker
            .set_queue(CompactionLevel::Three, level3.len() as u64);

        self.scheduler.set_depth(1, level1.len());
        self.scheduler.set_depth(2, level2.len());
        self.scheduler.set_depth(3, level3.len());
        self.scheduler.set_depth(4, level4.len());

        // Find the next compaction that can run and try to kick it off.
        if let Some(level) = self.scheduler.next() {
            match level {
                1 if !level1.is_empty() => {
                    if self.start_compaction(level1[0].clone(), CompactionLevel::One, false, workers)
                    {
                        level1.remove(0);
                    }
                }
                2 if !level2.is_empty() => {
                    if self.start_compaction(level2[0].clone(), CompactionLevel::Two, false, workers)
                    {
                        level2.remove(0);
                    }
                }
                3 if !level3.is_empty() => {
                    if self.start_compaction(level3[0].clone(), CompactionLevel::Three, true, workers)
                    {
                        level3.remove(0);
                    }
                }
                4 if !level4.is_empty() => {
                    let (lvl, fast) = if level4_optimize {
                        (CompactionLevel::Optimize, true)
                    } else {
                        (CompactionLevel::Full, false)
                    };
                    if self.start_compaction(level4[0].clone(), lvl, fast, workers) {
                        level4.remove(0);
                    }
                }
                _ => {}
            }
        }

        // Release the plans we did not start so the planner does not
        // double-book them next tick.
        self.planner.release(level1);
        self.planner.release(level2);
        self.planner.release(level3);
        self.planner.release(level4);
    }

    /// Try to hand a group to the worker pool. Returns true if a worker was
    /// started; the group is then owned by the worker until it completes.
    fn start_compaction(
        &self,
        group: CompactionGroup,
        level: CompactionLevel,
        fast: bool,
        workers: &WaitGroup,
    ) -> bool {
        let Some(engine) = self.me.upgrade() else {
            return false;
        };
        let Some(permit) = self.limiter.try_take() else {
            return false;
        };

        self.tracker.inc_active(level);
        let guard = workers.add();
        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            engine.compact_group(&group, fast, level).await;
            engine.planner.release(vec![group]);
            engine.tracker.dec_active(level);
        });
        true
    }

    /// Execute one claimed compaction group.
    async fn compact_group(&self, group: &CompactionGroup, fast: bool, level: CompactionLevel) {
        let start = Instant::now();
        info!(level = %level, files = group.len(), "beginning compaction");
        for (i, file) in group.iter().enumerate() {
            trace!(index = i, file = %file.display(), "compacting file");
        }

        let compactor = Arc::clone(&self.compactor);
        let input = group.clone();
        let task = tokio::task::spawn_blocking(move || {
            if fast {
                compactor.compact_fast(&input)
            } else {
                compactor.compact_full(&input)
            }
        });

        let result = match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(level = %level, error = %e, "compaction task failed");
                self.tracker.attempted(level, false, Duration::ZERO);
                return;
            }
        };

        let files = match result {
            Ok(files) => files,
            Err(EngineError::CompactionsDisabled) => {
                debug!(level = %level, "aborted compaction, compactions disabled");
                return;
            }
            Err(EngineError::CompactionInProgress(reason)) => {
                debug!(level = %level, reason = %reason, "aborted compaction, already in progress");
                tokio::time::sleep(Duration::from_secs(1)).await;
                return;
            }
            Err(e) => {
                error!(level = %level, error = %e, "error compacting TSM files");
                self.tracker.attempted(level, false, Duration::ZERO);
                tokio::time::sleep(Duration::from_secs(1)).await;
                return;
            }
        };

        if let Err(e) = self.file_store.replace_with_callback(group, &files) {
            error!(level = %level, error = %e, "error replacing new TSM files");
            self.tracker.attempted(level, false, Duration::ZERO);
            tokio::time::sleep(Duration::from_secs(1)).await;
            return;
        }

        for (i, file) in files.iter().enumerate() {
            trace!(index = i, file = %file.display(), "compacted file");
        }
        info!(
            level = %level,
            files = files.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "finished compacting files"
        );
        self.tracker.attempted(level, true, start.elapsed());
    }

    // =========================================================================
    // Deletes
    // =========================================================================

    /// Remove values in `[min, max]` (inclusive) from every series produced
    /// by `itr`.
    pub async fn delete_series_range(
        &self,
        itr: Box<dyn SeriesIterator>,
        min: i64,
        max: i64,
    ) -> Result<()> {
        self.delete_series_range_with_predicate(
            itr,
            Some(Box::new(move |_name, _tags| (min, max, true))),
        )
        .await
    }

    /// Remove values from every series for which `predicate` returns a
    /// range and `true`. A `None` predicate deletes the full time range of
    /// every series.
    pub async fn delete_series_range_with_predicate(
        &self,
        mut itr: Box<dyn SeriesIterator>,
        mut predicate: Option<DeletePredicate>,
    ) -> Result<()> {
        // Hold index compactions off so the measurements and series being
        // deleted are not merged away underneath us.
        self.index.disable_compactions();
        self.index.wait();

        let mut disabled_once = false;
        let result = self
            .delete_series_loop(&mut itr, &mut predicate, &mut disabled_once)
            .await;

        if disabled_once {
            self.enable_level_compactions(true);
            self.series_file.enable_compactions();
        }
        self.index.enable_compactions();
        result
    }

    async fn delete_series_loop(
        &self,
        itr: &mut Box<dyn SeriesIterator>,
        predicate: &mut Option<DeletePredicate>,
        disabled_once: &mut bool,
    ) -> Result<()> {
        let _file_set = self.index.retain_file_set()?;

        let mut size = 0usize;
        let (mut min, mut max) = (i64::MIN, i64::MAX);
        let mut flush_batch = false;

        // Reversed from min/max so they differ the first time through.
        let (mut new_min, mut new_max) = (i64::MAX, i64::MIN);
        if predicate.is_none() {
            new_min = min;
            new_max = max;
        }

        let mut batch: Vec<Vec<u8>> = Vec::with_capacity(10_000);
        loop {
            let Some(elem) = itr.next()? else { break };

            if let Some(predicate) = predicate.as_mut() {
                let (p_min, p_max, should_delete) = predicate(&elem.name, &elem.tags);
                if !should_delete {
                    continue;
                }
                new_min = p_min;
                new_max = p_max;
                // A min/max change forces the current batch out first.
                flush_batch = (min != new_min || max != new_max) && !batch.is_empty();
            }

            if let Some(expr) = &elem.expr {
                match expr {
                    SeriesExpr::BooleanLiteral(true) => {}
                    _ => return Err(EngineError::FieldsNotSupportedInDelete),
                }
            }

            if !*disabled_once {
                // Hold level compactions off so tombstones written to
                // existing TSM files are not compacted away mid-delete,
                // which would resurrect deleted series. Snapshots keep
                // running so a slow delete does not fill the cache.
                self.disable_level_compactions(true).await;
                self.series_file.disable_compactions();
                self.series_file.wait();
                *disabled_once = true;
            }

            if size >= DELETE_FLUSH_THRESHOLD || flush_batch {
                self.delete_series_range_batch(&mut batch, min, max).await?;
                batch.clear();
                size = 0;
                flush_batch = false;
            }

            min = new_min;
            max = new_max;

            let key = make_key(&elem.name, &elem.tags);
            size += key.len();
            batch.push(key);
        }

        if !batch.is_empty() {
            self.delete_series_range_batch(&mut batch, min, max).await?;
        }

        self.index.rebuild();
        Ok(())
    }

    /// Remove values in `[min, max]` for the given sorted series keys from
    /// every tier, then reconcile the index. Does not disable compactions;
    /// callers go through the public delete operations.
    async fn delete_series_range_batch(
        &self,
        series_keys: &mut Vec<Vec<u8>>,
        min: i64,
        max: i64,
    ) -> Result<()> {
        if series_keys.is_empty() {
            return Ok(());
        }

        // Lower layers require sorted keys.
        if series_keys.windows(2).any(|w| w[0] > w[1]) {
            series_keys.sort_unstable();
        }
        let (min, max) = normalize_time_range(min, max);

        let keys = Arc::new(std::mem::take(series_keys));
        let min_key = keys[0].clone();
        let max_key = keys[keys.len() - 1].clone();

        // Phase A: tombstone matching ranges in every overlapping TSM file,
        // in parallel.
        {
            let keys = Arc::clone(&keys);
            let min_key = min_key.clone();
            self.file_store
                .apply(move |file| {
                    let Some((file_min, file_max)) = file.key_range() else {
                        return Ok(());
                    };
                    let (tsm_min, _) = series_and_field_from_composite_key(&file_min);
                    let (tsm_max, _) = series_and_field_from_composite_key(&file_max);

                    let overlaps_keys =
                        tsm_min <= max_key.as_slice() && tsm_max >= min_key.as_slice();
                    if !overlaps_keys || !file.overlaps_time_range(min, max) {
                        return Ok(());
                    }

                    // Delete each key found in the file, walking the file
                    // keys and the sorted delete set together.
                    let mut batch = file.batch_delete();
                    let mut j = 0usize;
                    for index_key in file.key_iterator(&min_key) {
                        let (series_key, _) = series_and_field_from_composite_key(&index_key);

                        while j < keys.len() && keys[j].as_slice() < series_key {
                            j += 1;
                        }
                        if j >= keys.len() {
                            break;
                        }
                        if keys[j].as_slice() == series_key {
                            if let Err(e) = batch.delete_range(&[index_key.as_slice()], min, max) {
                                batch.rollback()?;
                                return Err(e);
                            }
                        }
                    }
                    batch.commit()
                })
                .await?;
        }

        // Phase B: collect matching composite keys from the cache. The
        // cache walks keys in arbitrary order, so search the sorted delete
        // set per key and sort afterwards.
        let mut delete_keys: Vec<Vec<u8>> = Vec::with_capacity(keys.len());
        self.cache.apply_entry_fn(|composite_key| {
            let (series_key, _) = series_and_field_from_composite_key(composite_key);
            if keys
                .binary_search_by(|probe| probe.as_slice().cmp(series_key))
                .is_ok()
            {
                delete_keys.push(composite_key.to_vec());
            }
        });
        delete_keys.sort_unstable();

        self.cache.delete_range(&delete_keys, min, max);
        self.wal.delete_range(&delete_keys, min, max)?;

        // Phase C: the series are gone from disk for [min, max], but other
        // ranges may survive. Walk the files again and mark every series
        // that still exists on disk; those must stay in the index. Files
        // are visited in parallel, so matches merge through a shared keep
        // set.
        let keep = Arc::new(Mutex::new(vec![false; keys.len()]));
        {
            let keys = Arc::clone(&keys);
            let keep = Arc::clone(&keep);
            let min_key = min_key.clone();
            self.file_store
                .apply(move |file| {
                    let mut matched: Vec<usize> = Vec::new();
                    let mut j = 0usize;
                    for index_key in file.key_iterator(&min_key) {
                        if j >= keys.len() {
                            break;
                        }
                        let (series_key, _) = series_and_field_from_composite_key(&index_key);

                        while j < keys.len() && keys[j].as_slice() < series_key {
                            j += 1;
                        }
                        if j < keys.len() && keys[j].as_slice() == series_key {
                            matched.push(j);
                            j += 1;
                        }
                    }
                    if !matched.is_empty() {
                        let mut keep = keep.lock();
                        for index in matched {
                            keep[index] = true;
                        }
                    }
                    Ok(())
                })
                .await?;
        }

        // Phase D: drop series with no surviving values from the index and
        // the series file.
        //
        // A write racing this loop may land in the cache after the check
        // below and still lose its index entry; the next index rebuild or
        // series creation reinstates it.
        let keep = keep.lock();
        let mut measurements: HashSet<Vec<u8>> = HashSet::new();
        let mut delete_ids: HashSet<traits::SeriesId> = HashSet::new();

        for (i, key) in keys.iter().enumerate() {
            if keep[i] {
                continue;
            }

            let (name, tags) = parse_key(key);
            let sid = self.series_file.series_id(&name, &tags);
            if sid == 0 {
                continue;
            }

            // If any field of this series still has cache values (a
            // concurrent write may have re-added some), keep the series.
            let mut idx = delete_keys.partition_point(|dk| dk.as_slice() < key.as_slice());
            let mut has_cache_values = false;
            while idx < delete_keys.len() && delete_keys[idx].starts_with(key.as_slice()) {
                if !self.cache.values(&delete_keys[idx]).is_empty() {
                    has_cache_values = true;
                    break;
                }
                idx += 1;
            }
            if has_cache_values {
                continue;
            }

            measurements.insert(name);
            self.index.drop_series(sid, key, false)?;
            delete_ids.insert(sid);
        }

        for measurement in &measurements {
            self.index
                .drop_measurement_if_series_not_exist(measurement)?;
        }

        let mut last_err = None;
        for sid in &delete_ids {
            if let Err(e) = self.series_file.delete_series_id(*sid) {
                last_err = Some(e);
            }
        }
        if let Some(e) = last_err {
            return Err(e);
        }

        Ok(())
    }

    /// Delete a measurement and all related series.
    pub async fn delete_measurement(&self, name: &[u8]) -> Result<()> {
        let Some(itr) = self.index.measurement_series_iterator(name)? else {
            return Ok(());
        };
        self.delete_series_range(itr, i64::MIN, i64::MAX).await
    }
}

#[cfg(test)]
mod tests {
    use super::stubs::{InMemoryIndex, SimpleTsmCompactor, SimpleTsmOpener};
    use super::*;
    use crate::storage::wal::{Wal, WalConfig};
    use tempfile::TempDir;

    fn build_engine(dir: &Path) -> Arc<Engine> {
        let index = Arc::new(InMemoryIndex::new());
        let mut config = Config::default();
        config.cache.snapshot_memory_size = 1024 * 1024;
        EngineBuilder::new(dir, config)
            .with_index(Arc::clone(&index) as Arc<dyn Index>)
            .with_series_file(index as Arc<dyn SeriesFile>)
            .with_wal(Arc::new(Wal::new(dir.join("wal"), WalConfig::default())))
            .with_compactor(Arc::new(SimpleTsmCompactor::new(dir)))
            .with_tsm_opener(Arc::new(SimpleTsmOpener))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = EngineBuilder::new("/tmp/nope", Config::default())
            .build()
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_gate_double_disable_is_safe() {
        let dir = TempDir::new().unwrap();
        let engine = build_engine(dir.path());
        engine.open().await.unwrap();

        engine.disable_level_compactions(false).await;
        engine.disable_level_compactions(false).await;
        engine.enable_level_compactions(false);
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_level_gate_holds() {
        let dir = TempDir::new().unwrap();
        let engine = build_engine(dir.path());
        engine.open().await.unwrap();

        // Two holds; the loop only restarts after both release.
        engine.disable_level_compactions(true).await;
        engine.disable_level_compactions(true).await;
        assert!(engine.level_gate.lock().stop.is_none());

        engine.enable_level_compactions(true);
        assert!(engine.level_gate.lock().stop.is_none());

        engine.enable_level_compactions(true);
        assert!(engine.level_gate.lock().stop.is_some());

        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_should_compact_cache_empty_cache() {
        let dir = TempDir::new().unwrap();
        let engine = build_engine(dir.path());
        // Empty cache never triggers, even when write-cold.
        assert!(!engine.should_compact_cache(Instant::now() + Duration::from_secs(10_000)));
    }
}
