//! Compaction state tracking
//!
//! Atomic per-level counters and gauges for completed, active, failed and
//! queued compactions. Every write is mirrored into the Prometheus metrics
//! the engine exposes; readers observe eventually-consistent snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::compaction::CompactionLevel;
use crate::metrics;

/// Atomic counters and gauges for compactions at every level
#[derive(Default)]
pub struct CompactionTracker {
    ok: [AtomicU64; 6],
    active: [AtomicU64; 6],
    errors: [AtomicU64; 6],
    queue: [AtomicU64; 6],
}

impl CompactionTracker {
    /// Create a tracker with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of successfully completed compactions for a level
    pub fn completed(&self, level: CompactionLevel) -> u64 {
        self.ok[level.index()].load(Ordering::SeqCst)
    }

    /// Number of compactions currently running for a level
    pub fn active(&self, level: CompactionLevel) -> u64 {
        self.active[level.index()].load(Ordering::SeqCst)
    }

    /// Number of active snapshots and compactions across every level
    pub fn all_active(&self) -> u64 {
        self.active
            .iter()
            .map(|a| a.load(Ordering::SeqCst))
            .sum()
    }

    /// Number of active optimize compactions
    pub fn active_optimize(&self) -> u64 {
        self.active(CompactionLevel::Optimize)
    }

    /// Number of active full compactions
    pub fn active_full(&self) -> u64 {
        self.active(CompactionLevel::Full)
    }

    /// Total number of failed compaction attempts for a level
    pub fn errors(&self, level: CompactionLevel) -> u64 {
        self.errors[level.index()].load(Ordering::SeqCst)
    }

    /// Queue depth last published for a level
    pub fn queue(&self, level: CompactionLevel) -> u64 {
        self.queue[level.index()].load(Ordering::SeqCst)
    }

    /// Mark one more compaction running at a level
    pub fn inc_active(&self, level: CompactionLevel) {
        self.active[level.index()].fetch_add(1, Ordering::SeqCst);
        metrics::COMPACTIONS_ACTIVE
            .with_label_values(&[&level.to_string()])
            .inc();
    }

    /// Mark one compaction at a level as no longer running
    pub fn dec_active(&self, level: CompactionLevel) {
        self.active[level.index()].fetch_sub(1, Ordering::SeqCst);
        metrics::COMPACTIONS_ACTIVE
            .with_label_values(&[&level.to_string()])
            .dec();
    }

    /// Record a finished compaction attempt
    pub fn attempted(&self, level: CompactionLevel, success: bool, duration: Duration) {
        let label = level.to_string();
        if success {
            self.ok[level.index()].fetch_add(1, Ordering::SeqCst);
            metrics::COMPACTION_DURATION
                .with_label_values(&[&label])
                .observe(duration.as_secs_f64());
            metrics::COMPACTIONS_TOTAL
                .with_label_values(&[&label, "ok"])
                .inc();
            return;
        }

        self.errors[level.index()].fetch_add(1, Ordering::SeqCst);
        metrics::COMPACTIONS_TOTAL
            .with_label_values(&[&label, "error"])
            .inc();
    }

    /// Record a finished snapshot attempt
    pub fn snapshot_attempted(&self, success: bool, duration: Duration) {
        self.attempted(CompactionLevel::Snapshot, success, duration);
    }

    /// Publish the queue depth for a level
    pub fn set_queue(&self, level: CompactionLevel, depth: u64) {
        self.queue[level.index()].store(depth, Ordering::SeqCst);
        metrics::COMPACTION_QUEUE
            .with_label_values(&[&level.to_string()])
            .set(depth as f64);
    }

    /// Publish the optimize-compaction queue depth
    pub fn set_optimize_queue(&self, depth: u64) {
        self.set_queue(CompactionLevel::Optimize, depth);
    }

    /// Publish the full-compaction queue depth
    pub fn set_full_queue(&self, depth: u64) {
        self.set_queue(CompactionLevel::Full, depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_counters() {
        let tracker = CompactionTracker::new();
        tracker.inc_active(CompactionLevel::One);
        tracker.inc_active(CompactionLevel::One);
        tracker.inc_active(CompactionLevel::Full);

        assert_eq!(tracker.active(CompactionLevel::One), 2);
        assert_eq!(tracker.active_full(), 1);
        assert_eq!(tracker.all_active(), 3);

        tracker.dec_active(CompactionLevel::One);
        assert_eq!(tracker.all_active(), 2);
    }

    #[test]
    fn test_attempted_counts_ok_and_errors() {
        let tracker = CompactionTracker::new();
        tracker.attempted(CompactionLevel::Two, true, Duration::from_secs(1));
        tracker.attempted(CompactionLevel::Two, false, Duration::ZERO);
        tracker.attempted(CompactionLevel::Two, false, Duration::ZERO);

        assert_eq!(tracker.completed(CompactionLevel::Two), 1);
        assert_eq!(tracker.errors(CompactionLevel::Two), 2);
    }

    #[test]
    fn test_snapshot_attempted_uses_level_zero() {
        let tracker = CompactionTracker::new();
        tracker.snapshot_attempted(true, Duration::from_millis(5));
        assert_eq!(tracker.completed(CompactionLevel::Snapshot), 1);
    }

    #[test]
    fn test_queue_depths() {
        let tracker = CompactionTracker::new();
        tracker.set_queue(CompactionLevel::One, 7);
        tracker.set_optimize_queue(3);
        assert_eq!(tracker.queue(CompactionLevel::One), 7);
        assert_eq!(tracker.queue(CompactionLevel::Optimize), 3);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        let tracker = Arc::new(CompactionTracker::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let t = Arc::clone(&tracker);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    t.inc_active(CompactionLevel::Three);
                    t.dec_active(CompactionLevel::Three);
                    t.attempted(CompactionLevel::Three, true, Duration::ZERO);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.active(CompactionLevel::Three), 0);
        assert_eq!(tracker.completed(CompactionLevel::Three), 800);
    }
}
