//! Prometheus metrics for the storage engine
//!
//! Registration happens once per process through lazy statics; the
//! compaction tracker, cache and WAL mirror their state here. Tests that
//! assert on metric values call [`reset`] first.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};

lazy_static! {
    // === Compactions ===

    /// Completed compaction attempts by level and status
    pub static ref COMPACTIONS_TOTAL: CounterVec = register_counter_vec!(
        "tsm_compactions_total",
        "Total compaction attempts by level and status",
        &["level", "status"]
    ).unwrap();

    /// Currently running compactions by level
    pub static ref COMPACTIONS_ACTIVE: GaugeVec = register_gauge_vec!(
        "tsm_compactions_active",
        "Number of running compactions by level",
        &["level"]
    ).unwrap();

    /// Successful compaction durations by level
    pub static ref COMPACTION_DURATION: HistogramVec = register_histogram_vec!(
        "tsm_compaction_duration_seconds",
        "Duration of successful compactions in seconds",
        &["level"],
        vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    ).unwrap();

    /// Compaction queue depths by level
    pub static ref COMPACTION_QUEUE: GaugeVec = register_gauge_vec!(
        "tsm_compaction_queue",
        "Compaction plan queue depth by level",
        &["level"]
    ).unwrap();

    // === Cache ===

    /// Live cache size in bytes
    pub static ref CACHE_SIZE_BYTES: Gauge = register_gauge!(
        "tsm_cache_size_bytes",
        "Size of the live cache region in bytes"
    ).unwrap();

    /// Snapshot region size in bytes
    pub static ref CACHE_SNAPSHOT_BYTES: Gauge = register_gauge!(
        "tsm_cache_snapshot_bytes",
        "Size of the cache snapshot region in bytes"
    ).unwrap();

    /// Seconds since the cache was last snapshotted
    pub static ref CACHE_AGE_SECONDS: Gauge = register_gauge!(
        "tsm_cache_age_seconds",
        "Seconds since the last cache snapshot"
    ).unwrap();

    /// Cache write batches by status
    pub static ref CACHE_WRITES_TOTAL: CounterVec = register_counter_vec!(
        "tsm_cache_writes_total",
        "Cache write batches by status",
        &["status"]
    ).unwrap();

    // === WAL ===

    /// WAL size on disk in bytes
    pub static ref WAL_SIZE_BYTES: Gauge = register_gauge!(
        "tsm_wal_size_bytes",
        "Size of all WAL segments on disk in bytes"
    ).unwrap();

    /// Number of WAL segment files
    pub static ref WAL_SEGMENTS: Gauge = register_gauge!(
        "tsm_wal_segments",
        "Number of WAL segment files"
    ).unwrap();

    // === File store ===

    /// Number of TSM files
    pub static ref FILE_STORE_FILES: Gauge = register_gauge!(
        "tsm_file_store_files",
        "Number of TSM files in the file store"
    ).unwrap();

    /// File store size on disk in bytes
    pub static ref FILE_STORE_SIZE_BYTES: Gauge = register_gauge!(
        "tsm_file_store_size_bytes",
        "Size of all TSM files on disk in bytes"
    ).unwrap();
}

/// Get metrics in Prometheus text format
pub fn gather() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("metrics contain invalid UTF-8: {}", e))
}

/// Reset all engine metrics. Registration is global per process, so tests
/// that assert on metric values call this first.
pub fn reset() {
    COMPACTIONS_TOTAL.reset();
    COMPACTIONS_ACTIVE.reset();
    COMPACTION_DURATION.reset();
    COMPACTION_QUEUE.reset();
    CACHE_WRITES_TOTAL.reset();
    CACHE_SIZE_BYTES.set(0.0);
    CACHE_SNAPSHOT_BYTES.set(0.0);
    CACHE_AGE_SECONDS.set(0.0);
    WAL_SIZE_BYTES.set(0.0);
    WAL_SEGMENTS.set(0.0);
    FILE_STORE_FILES.set(0.0);
    FILE_STORE_SIZE_BYTES.set(0.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_engine_metrics() {
        COMPACTIONS_TOTAL.with_label_values(&["1", "ok"]).inc();
        let metrics = gather().expect("failed to gather metrics");
        assert!(metrics.contains("tsm_compactions_total"));
    }

    #[test]
    fn test_reset() {
        COMPACTIONS_TOTAL
            .with_label_values(&["optimize", "error"])
            .inc();
        reset();
        assert_eq!(
            COMPACTIONS_TOTAL
                .with_label_values(&["optimize", "error"])
                .get(),
            0.0
        );
    }
}
