//! Compaction subsystem: levels, groups, planning, scheduling and tracking
//!
//! TSM files are named `<generation>-<sequence>.tsm`. A cache snapshot
//! writes a new generation at sequence 1; each merge of a run of
//! generations produces a file whose sequence is one higher than its
//! inputs'. The sequence therefore encodes how many times a generation's
//! data has been compacted, which is what level planning keys off.

use std::fmt;
use std::path::{Path, PathBuf};

pub mod planner;
pub mod scheduler;
pub mod tracker;

pub use planner::{CompactionPlanner, DefaultPlanner};
pub use scheduler::Scheduler;
pub use tracker::CompactionTracker;

/// An ordered set of TSM file paths selected to be merged together
pub type CompactionGroup = Vec<PathBuf>;

/// A rung of the merge hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompactionLevel {
    /// Level 0: cache snapshots
    Snapshot,
    /// Level 1
    One,
    /// Level 2
    Two,
    /// Level 3
    Three,
    /// Level 4: optimize compactions
    Optimize,
    /// Level 5: full compactions
    Full,
}

impl CompactionLevel {
    /// Slot index used by the tracker's per-level arrays
    pub fn index(self) -> usize {
        match self {
            CompactionLevel::Snapshot => 0,
            CompactionLevel::One => 1,
            CompactionLevel::Two => 2,
            CompactionLevel::Three => 3,
            CompactionLevel::Optimize => 4,
            CompactionLevel::Full => 5,
        }
    }

    /// All levels, in slot order
    pub fn all() -> [CompactionLevel; 6] {
        [
            CompactionLevel::Snapshot,
            CompactionLevel::One,
            CompactionLevel::Two,
            CompactionLevel::Three,
            CompactionLevel::Optimize,
            CompactionLevel::Full,
        ]
    }
}

impl fmt::Display for CompactionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompactionLevel::Snapshot => write!(f, "snapshot"),
            CompactionLevel::One => write!(f, "1"),
            CompactionLevel::Two => write!(f, "2"),
            CompactionLevel::Three => write!(f, "3"),
            CompactionLevel::Optimize => write!(f, "optimize"),
            CompactionLevel::Full => write!(f, "full"),
        }
    }
}

/// Formats a TSM file name from its generation and sequence numbers.
pub fn tsm_file_name(generation: u64, sequence: u64) -> String {
    format!(
        "{:09}-{:09}.{}",
        generation,
        sequence,
        crate::storage::file_store::TSM_FILE_EXTENSION
    )
}

/// Parses the generation and sequence numbers out of a TSM file path.
pub fn parse_tsm_file_name(path: &Path) -> Option<(u64, u64)> {
    let stem = path.file_stem()?.to_str()?;
    let (generation, sequence) = stem.split_once('-')?;
    Some((generation.parse().ok()?, sequence.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_display() {
        assert_eq!(CompactionLevel::Snapshot.to_string(), "snapshot");
        assert_eq!(CompactionLevel::One.to_string(), "1");
        assert_eq!(CompactionLevel::Optimize.to_string(), "optimize");
        assert_eq!(CompactionLevel::Full.to_string(), "full");
    }

    #[test]
    fn test_file_name_round_trip() {
        let name = tsm_file_name(12, 3);
        assert_eq!(name, "000000012-000000003.tsm");
        let parsed = parse_tsm_file_name(Path::new(&name)).unwrap();
        assert_eq!(parsed, (12, 3));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_tsm_file_name(Path::new("foo.tsm")).is_none());
        assert!(parse_tsm_file_name(Path::new("abc-def.tsm")).is_none());
    }
}
