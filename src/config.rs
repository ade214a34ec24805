//! Configuration for the storage engine
//!
//! TOML file support with environment variable overrides and sensible
//! defaults. Every knob the engine consumes is enumerated here; the
//! compactor rate-limit values are passed through to whichever compactor
//! implementation is plugged in.

use serde::{Deserialize, Serialize};

use std::time::Duration;

use crate::storage::wal::WalConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// File store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Cache sizing and flush thresholds
    #[serde(default)]
    pub cache: CacheConfig,

    /// Compaction tuning
    #[serde(default)]
    pub compaction: CompactionConfig,

    /// Write-ahead log configuration
    #[serde(default)]
    pub wal: WalConfig,
}

/// File store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Number of TSM files opened in parallel on startup
    #[serde(default = "default_max_concurrent_opens")]
    pub max_concurrent_opens: usize,

    /// Advise the kernel that mapped TSM data will be needed soon
    #[serde(default)]
    pub madv_will_need: bool,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum cache size in bytes before writes are rejected
    #[serde(default = "default_cache_max_memory_size")]
    pub max_memory_size: u64,

    /// Cache size at which a snapshot to a TSM file is triggered
    #[serde(default = "default_cache_snapshot_memory_size")]
    pub snapshot_memory_size: u64,

    /// Seconds without writes after which the cache is snapshotted
    #[serde(default = "default_cache_snapshot_write_cold_secs")]
    pub snapshot_write_cold_duration_secs: u64,
}

/// Compaction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Compactor write throughput in bytes per second
    #[serde(default = "default_compaction_throughput")]
    pub throughput_bytes: u64,

    /// Compactor write throughput burst in bytes
    #[serde(default = "default_compaction_throughput_burst")]
    pub throughput_burst_bytes: u64,

    /// Maximum concurrent compactions; 0 computes a limit from the core count
    #[serde(default)]
    pub max_concurrent: usize,

    /// Seconds without writes after which a full compaction is planned
    #[serde(default = "default_full_write_cold_secs")]
    pub full_write_cold_duration_secs: u64,
}

fn default_max_concurrent_opens() -> usize {
    num_cpus()
}
fn default_cache_max_memory_size() -> u64 {
    1024 * 1024 * 1024
}
fn default_cache_snapshot_memory_size() -> u64 {
    25 * 1024 * 1024
}
fn default_cache_snapshot_write_cold_secs() -> u64 {
    600
}
fn default_compaction_throughput() -> u64 {
    48 * 1024 * 1024
}
fn default_compaction_throughput_burst() -> u64 {
    48 * 1024 * 1024
}
fn default_full_write_cold_secs() -> u64 {
    4 * 3600
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_concurrent_opens: default_max_concurrent_opens(),
            madv_will_need: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_size: default_cache_max_memory_size(),
            snapshot_memory_size: default_cache_snapshot_memory_size(),
            snapshot_write_cold_duration_secs: default_cache_snapshot_write_cold_secs(),
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            throughput_bytes: default_compaction_throughput(),
            throughput_burst_bytes: default_compaction_throughput_burst(),
            max_concurrent: 0,
            full_write_cold_duration_secs: default_full_write_cold_secs(),
        }
    }
}

impl CacheConfig {
    /// Write-cold flush threshold as a [`Duration`]
    pub fn snapshot_write_cold_duration(&self) -> Duration {
        Duration::from_secs(self.snapshot_write_cold_duration_secs)
    }
}

impl CompactionConfig {
    /// Full-compaction cold threshold as a [`Duration`]
    pub fn full_write_cold_duration(&self) -> Duration {
        Duration::from_secs(self.full_write_cold_duration_secs)
    }

    /// Effective worker-pool capacity.
    ///
    /// When `max_concurrent` is 0 the limit is computed from the core count:
    /// half the cores, at least 1, capped at 4 to limit disk utilization,
    /// and never more than the core count.
    pub fn max_concurrent_compactions(&self) -> usize {
        let cores = num_cpus();
        if self.max_concurrent > 0 {
            return self.max_concurrent.min(cores);
        }
        (cores / 2).clamp(1, 4).min(cores)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file {}: {}", path, e))?;

        toml::from_str(&contents)
            .map_err(|e| format!("failed to parse config file {}: {}", path, e))
    }

    /// Load configuration with environment variable overrides applied
    pub fn from_file_with_env(path: &str) -> Result<Self, String> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TSM_CACHE_MAX_MEMORY_SIZE") {
            if let Ok(n) = v.parse() {
                self.cache.max_memory_size = n;
            }
        }
        if let Ok(v) = std::env::var("TSM_CACHE_SNAPSHOT_MEMORY_SIZE") {
            if let Ok(n) = v.parse() {
                self.cache.snapshot_memory_size = n;
            }
        }
        if let Ok(v) = std::env::var("TSM_COMPACTION_MAX_CONCURRENT") {
            if let Ok(n) = v.parse() {
                self.compaction.max_concurrent = n;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.cache.max_memory_size > 0
            && self.cache.snapshot_memory_size > self.cache.max_memory_size
        {
            return Err("cache snapshot_memory_size cannot exceed max_memory_size".to_string());
        }
        if self.storage.max_concurrent_opens == 0 {
            return Err("storage max_concurrent_opens must be > 0".to_string());
        }
        self.wal.validate().map_err(|e| e.to_string())
    }
}
