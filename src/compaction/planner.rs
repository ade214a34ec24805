//! Compaction planning
//!
//! The planner inspects the file store and produces [`CompactionGroup`]s of
//! files that should be merged together. A group, once returned, is claimed:
//! the planner will not hand its files out again until [`CompactionPlanner::release`]
//! returns them, which happens either when the engine declines to start the
//! group this tick or when the worker that ran it finishes.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::compaction::{parse_tsm_file_name, CompactionGroup};
use crate::storage::file_store::FileStore;

/// Produces and tracks compaction plans
pub trait CompactionPlanner: Send + Sync {
    /// Plan full compactions: merges of mature generation runs, or
    /// everything at once when the shard has gone write-cold or a full
    /// compaction was forced
    fn plan(&self, last_write: SystemTime) -> Vec<CompactionGroup>;

    /// Plan compactions of generation runs at the given level (1 through 3)
    fn plan_level(&self, level: u8) -> Vec<CompactionGroup>;

    /// Plan optimize compactions: merges of fragmented fully-compacted
    /// generations
    fn plan_optimize(&self) -> Vec<CompactionGroup>;

    /// Return unclaimed or finished groups to the planner
    fn release(&self, groups: Vec<CompactionGroup>);

    /// True when nothing remains to merge
    fn fully_compacted(&self) -> bool;

    /// Make the next call to [`CompactionPlanner::plan`] return a single
    /// plan covering every file
    fn force_full(&self);
}

#[derive(Debug)]
struct GenerationFile {
    path: PathBuf,
    sequence: u64,
}

#[derive(Debug)]
struct Generation {
    id: u64,
    files: Vec<GenerationFile>,
}

impl Generation {
    /// How many times this generation's data has been compacted, capped at
    /// the optimize level.
    fn level(&self) -> u64 {
        self.files
            .iter()
            .map(|f| f.sequence)
            .max()
            .unwrap_or(1)
            .min(4)
    }

    fn paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.files.iter().map(|f| f.path.clone())
    }
}

#[derive(Default)]
struct PlannerState {
    claimed: HashSet<PathBuf>,
    force_full: bool,
}

/// Generation-based planner over a [`FileStore`]
pub struct DefaultPlanner {
    file_store: Arc<FileStore>,
    full_write_cold_duration: Duration,
    state: Mutex<PlannerState>,
}

/// Number of generations merged per group
const MAX_GENERATIONS_PER_GROUP: usize = 4;

impl DefaultPlanner {
    /// Create a planner over `file_store`; `full_write_cold_duration` is how
    /// long a shard must go without writes before everything is merged into
    /// a single generation
    pub fn new(file_store: Arc<FileStore>, full_write_cold_duration: Duration) -> Self {
        Self {
            file_store,
            full_write_cold_duration,
            state: Mutex::new(PlannerState::default()),
        }
    }

    /// Generations sorted by id, excluding files in `claimed`. A generation
    /// with any claimed file is excluded entirely so concurrent plans never
    /// split one.
    fn generations(&self, claimed: &HashSet<PathBuf>) -> Vec<Generation> {
        let mut gens: Vec<Generation> = Vec::new();
        let mut paths = self.file_store.file_paths();
        paths.sort();

        for path in paths {
            let Some((id, sequence)) = parse_tsm_file_name(&path) else {
                continue;
            };
            let file = GenerationFile { path, sequence };
            match gens.last_mut() {
                Some(generation) if generation.id == id => generation.files.push(file),
                _ => gens.push(Generation {
                    id,
                    files: vec![file],
                }),
            }
        }

        gens.retain(|generation| !generation.files.iter().any(|f| claimed.contains(&f.path)));
        gens
    }

    fn claim(state: &mut PlannerState, group: &CompactionGroup) {
        for path in group {
            state.claimed.insert(path.clone());
        }
    }

    fn flush_run(
        state: &mut PlannerState,
        run: &mut Vec<&Generation>,
        groups: &mut Vec<CompactionGroup>,
    ) {
        for chunk in run.chunks(MAX_GENERATIONS_PER_GROUP) {
            if chunk.len() < 2 {
                continue;
            }
            let group: CompactionGroup = chunk.iter().flat_map(|g| g.paths()).collect();
            Self::claim(state, &group);
            groups.push(group);
        }
        run.clear();
    }

    fn group_runs<F>(
        state: &mut PlannerState,
        gens: &[Generation],
        mut in_run: F,
    ) -> Vec<CompactionGroup>
    where
        F: FnMut(&Generation) -> bool,
    {
        let mut groups = Vec::new();
        let mut run: Vec<&Generation> = Vec::new();
        for generation in gens {
            if in_run(generation) {
                run.push(generation);
                continue;
            }
            Self::flush_run(state, &mut run, &mut groups);
        }
        Self::flush_run(state, &mut run, &mut groups);
        groups
    }
}

impl CompactionPlanner for DefaultPlanner {
    fn plan(&self, last_write: SystemTime) -> Vec<CompactionGroup> {
        let mut state = self.state.lock();
        let gens = self.generations(&state.claimed);
        if gens.is_empty() {
            state.force_full = false;
            return Vec::new();
        }

        let cold = last_write
            .elapsed()
            .map(|e| e > self.full_write_cold_duration)
            .unwrap_or(false);

        if state.force_full || cold {
            state.force_full = false;
            // A single, fully-compacted generation has nothing left to merge.
            if gens.len() < 2 && gens[0].level() >= 4 && gens[0].files.len() < 2 {
                return Vec::new();
            }
            let group: CompactionGroup = gens.iter().flat_map(|g| g.paths()).collect();
            Self::claim(&mut state, &group);
            return vec![group];
        }

        // Steady state: merge adjacent runs of fully-compacted generations.
        Self::group_runs(&mut state, &gens, |g| g.level() >= 4)
    }

    fn plan_level(&self, level: u8) -> Vec<CompactionGroup> {
        let mut state = self.state.lock();
        let gens = self.generations(&state.claimed);
        Self::group_runs(&mut state, &gens, |g| g.level() == level as u64)
    }

    fn plan_optimize(&self) -> Vec<CompactionGroup> {
        let mut state = self.state.lock();
        let gens = self.generations(&state.claimed);

        // Fragmented fully-compacted generations: several files at the max
        // level that can be merged without a full block rewrite.
        let mut groups = Vec::new();
        let mut run: Vec<&Generation> = Vec::new();

        fn flush(
            state: &mut PlannerState,
            run: &mut Vec<&Generation>,
            groups: &mut Vec<CompactionGroup>,
        ) {
            let fragmented = run.len() >= 2 || run.iter().any(|g| g.files.len() > 1);
            if fragmented {
                let group: CompactionGroup = run.iter().flat_map(|g| g.paths()).collect();
                if group.len() >= 2 {
                    DefaultPlanner::claim(state, &group);
                    groups.push(group);
                }
            }
            run.clear();
        }

        for generation in &gens {
            if generation.level() >= 4 {
                run.push(generation);
                continue;
            }
            flush(&mut state, &mut run, &mut groups);
        }
        flush(&mut state, &mut run, &mut groups);
        groups
    }

    fn release(&self, groups: Vec<CompactionGroup>) {
        let mut state = self.state.lock();
        for group in groups {
            for path in group {
                state.claimed.remove(&path);
            }
        }
    }

    fn fully_compacted(&self) -> bool {
        let state = self.state.lock();
        let gens = self.generations(&HashSet::new());
        !state.force_full
            && match gens.len() {
                0 => true,
                1 => gens[0].files.len() < 2,
                _ => false,
            }
    }

    fn force_full(&self) {
        self.state.lock().force_full = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::tsm_file_name;
    use crate::engine::stubs::{write_simple_tsm, SimpleTsmOpener};
    use crate::value::Value;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    async fn store_with_files(dir: &TempDir, names: &[(u64, u64)]) -> Arc<FileStore> {
        for (generation, sequence) in names {
            let mut entries = BTreeMap::new();
            entries.insert(
                b"cpu,host=a#!~#usage".to_vec(),
                vec![Value::float(*generation as i64, 1.0)],
            );
            let path = dir.path().join(tsm_file_name(*generation, *sequence));
            write_simple_tsm(&path, &entries).unwrap();
        }
        let store = Arc::new(FileStore::new(dir.path(), Arc::new(SimpleTsmOpener), 4, false));
        store.open().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_plan_level_groups_runs() {
        let dir = TempDir::new().unwrap();
        let store = store_with_files(&dir, &[(1, 1), (2, 1), (3, 1), (4, 1), (5, 2)]).await;
        let planner = DefaultPlanner::new(store, Duration::from_secs(3600));

        let groups = planner.plan_level(1);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 4);

        // Claimed files are not planned again until released.
        assert!(planner.plan_level(1).is_empty());
        planner.release(groups);
        assert_eq!(planner.plan_level(1).len(), 1);
    }

    #[tokio::test]
    async fn test_plan_level_requires_two_generations() {
        let dir = TempDir::new().unwrap();
        let store = store_with_files(&dir, &[(1, 1)]).await;
        let planner = DefaultPlanner::new(store, Duration::from_secs(3600));
        assert!(planner.plan_level(1).is_empty());
    }

    #[tokio::test]
    async fn test_force_full_plans_everything_once() {
        let dir = TempDir::new().unwrap();
        let store = store_with_files(&dir, &[(1, 1), (2, 2), (3, 4)]).await;
        let planner = DefaultPlanner::new(store, Duration::from_secs(3600));

        planner.force_full();
        let groups = planner.plan(SystemTime::now());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);

        planner.release(groups);
        // The force is consumed; a warm shard plans nothing.
        assert!(planner.plan(SystemTime::now()).is_empty());
    }

    #[tokio::test]
    async fn test_cold_shard_plans_full() {
        let dir = TempDir::new().unwrap();
        let store = store_with_files(&dir, &[(1, 1), (2, 1)]).await;
        let planner = DefaultPlanner::new(store, Duration::from_secs(60));

        let cold = SystemTime::now() - Duration::from_secs(3600);
        let groups = planner.plan(cold);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[tokio::test]
    async fn test_plan_optimize_merges_fragmented_generation() {
        let dir = TempDir::new().unwrap();
        // One generation, two files at the max level.
        let store = store_with_files(&dir, &[(1, 4), (1, 5)]).await;
        let planner = DefaultPlanner::new(store, Duration::from_secs(3600));

        // A single fully-compacted generation is not a full-compaction
        // candidate on a warm shard...
        assert!(planner.plan(SystemTime::now()).is_empty());
        // ...but optimize merges its fragments.
        let groups = planner.plan_optimize();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[tokio::test]
    async fn test_fully_compacted() {
        let dir = TempDir::new().unwrap();
        let store = store_with_files(&dir, &[(1, 4)]).await;
        let planner = DefaultPlanner::new(Arc::clone(&store), Duration::from_secs(3600));
        assert!(planner.fully_compacted());

        planner.force_full();
        assert!(!planner.fully_compacted());
    }

    #[tokio::test]
    async fn test_fully_compacted_false_with_multiple_generations() {
        let dir = TempDir::new().unwrap();
        let store = store_with_files(&dir, &[(1, 1), (2, 1)]).await;
        let planner = DefaultPlanner::new(store, Duration::from_secs(3600));
        assert!(!planner.fully_compacted());
    }
}
