//! Compaction scheduler
//!
//! Consulted once per tick of the level-compaction loop with the current
//! plan queue depths, the scheduler picks the next level to dispatch under
//! the shared worker pool. Levels 1 and 2 take priority over 3 and 4, but
//! one worker slot is reserved for the level-4 lane (optimize and full
//! compactions) whenever it has queued work and nothing from it is running,
//! so a steady stream of level-1 work cannot starve full compactions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::compaction::{CompactionLevel, CompactionTracker};

/// Picks the next compaction level to run
pub struct Scheduler {
    depths: [AtomicUsize; 4],
    max_concurrency: usize,
    tracker: Arc<CompactionTracker>,
}

impl Scheduler {
    /// Create a scheduler over a worker pool of `max_concurrency` slots
    pub fn new(max_concurrency: usize, tracker: Arc<CompactionTracker>) -> Self {
        Self {
            depths: Default::default(),
            max_concurrency: max_concurrency.max(1),
            tracker,
        }
    }

    /// Publish the plan queue depth for a level (1 through 4)
    pub fn set_depth(&self, level: u8, depth: usize) {
        debug_assert!((1..=4).contains(&level));
        if let Some(slot) = self.depths.get(level as usize - 1) {
            slot.store(depth, Ordering::SeqCst);
        }
    }

    fn depth(&self, level: u8) -> usize {
        self.depths[level as usize - 1].load(Ordering::SeqCst)
    }

    /// The next level with queued work that may dispatch, or `None` when
    /// every candidate is empty or saturated.
    pub fn next(&self) -> Option<u8> {
        // Workers running for levels 1..5; snapshots do not hold pool slots.
        let running = (self.tracker.active(CompactionLevel::One)
            + self.tracker.active(CompactionLevel::Two)
            + self.tracker.active(CompactionLevel::Three)
            + self.tracker.active_optimize()
            + self.tracker.active_full()) as usize;

        let level4_running = (self.tracker.active_optimize() + self.tracker.active_full()) as usize;
        let reserve_level4 = self.depth(4) > 0 && level4_running == 0;

        // Levels 1..3 may not take the slot reserved for level 4.
        let usable = self.max_concurrency - usize::from(reserve_level4);
        for level in [1u8, 2, 3] {
            if self.depth(level) == 0 {
                continue;
            }
            let lane = match level {
                1 => CompactionLevel::One,
                2 => CompactionLevel::Two,
                _ => CompactionLevel::Three,
            };
            if running >= usable || self.tracker.active(lane) as usize >= usable {
                continue;
            }
            return Some(level);
        }

        if self.depth(4) > 0 && running < self.max_concurrency && level4_running < self.max_concurrency
        {
            return Some(4);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(max: usize) -> (Scheduler, Arc<CompactionTracker>) {
        let tracker = Arc::new(CompactionTracker::new());
        (Scheduler::new(max, Arc::clone(&tracker)), tracker)
    }

    #[test]
    fn test_empty_queues_yield_nothing() {
        let (s, _) = scheduler(2);
        assert_eq!(s.next(), None);
    }

    #[test]
    fn test_priority_order() {
        let (s, _) = scheduler(4);
        s.set_depth(1, 1);
        s.set_depth(2, 1);
        s.set_depth(3, 1);
        s.set_depth(4, 0);
        assert_eq!(s.next(), Some(1));

        s.set_depth(1, 0);
        assert_eq!(s.next(), Some(2));

        s.set_depth(2, 0);
        assert_eq!(s.next(), Some(3));
    }

    #[test]
    fn test_slot_reserved_for_level_four() {
        // Capacity 2, level 1 hot, one level-4 plan pending: the first
        // dispatch goes to level 1, the second to level 4 because the last
        // slot is reserved for it.
        let (s, tracker) = scheduler(2);
        s.set_depth(1, 10);
        s.set_depth(4, 1);

        assert_eq!(s.next(), Some(1));
        tracker.inc_active(CompactionLevel::One);

        assert_eq!(s.next(), Some(4));
        tracker.inc_active(CompactionLevel::Full);

        // Pool full now.
        assert_eq!(s.next(), None);

        // Once level 4 is running the reservation lifts and level 1 can use
        // the freed slot.
        tracker.dec_active(CompactionLevel::One);
        assert_eq!(s.next(), Some(1));
    }

    #[test]
    fn test_level_one_fills_pool_without_level_four_work() {
        let (s, tracker) = scheduler(2);
        s.set_depth(1, 10);

        assert_eq!(s.next(), Some(1));
        tracker.inc_active(CompactionLevel::One);
        assert_eq!(s.next(), Some(1));
        tracker.inc_active(CompactionLevel::One);
        assert_eq!(s.next(), None);

        // A completed level-1 run frees a slot for the next group.
        tracker.dec_active(CompactionLevel::One);
        assert_eq!(s.next(), Some(1));
    }

    #[test]
    fn test_optimize_running_counts_toward_level_four_lane() {
        let (s, tracker) = scheduler(2);
        s.set_depth(1, 1);
        s.set_depth(4, 1);
        tracker.inc_active(CompactionLevel::Optimize);

        // Lane 4 already runs, so no reservation; level 1 may dispatch.
        assert_eq!(s.next(), Some(1));
    }

    #[test]
    fn test_single_slot_pool_prefers_reserved_level_four() {
        let (s, _) = scheduler(1);
        s.set_depth(1, 5);
        s.set_depth(4, 1);
        // The only slot is reserved for level 4.
        assert_eq!(s.next(), Some(4));
    }
}
