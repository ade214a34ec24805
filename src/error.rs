//! Error types for the storage engine

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::cache::CacheError;
use crate::storage::wal::WalError;

/// Main error type for the storage engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// A value carried a type tag that is not one of the supported block types
    #[error("unknown field type: block code {0}")]
    UnknownFieldType(u8),

    /// A delete carried a non-trivial field expression
    #[error("fields not supported in WHERE clause during deletion")]
    FieldsNotSupportedInDelete,

    /// Cache error
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// WAL error
    #[error("wal error: {0}")]
    Wal(#[from] WalError),

    /// Compactions are disabled; expected during shutdown
    #[error("compactions disabled")]
    CompactionsDisabled,

    /// Another compaction already owns one of the group's files
    #[error("compaction in progress: {0}")]
    CompactionInProgress(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Corrupted on-disk data
    #[error("corrupted data in {path}: {reason}")]
    CorruptedData {
        /// File the corruption was detected in
        path: PathBuf,
        /// Description of the corruption
        reason: String,
    },

    /// Error propagated from the measurement/series index
    #[error("index error: {0}")]
    Index(String),

    /// Error propagated from the series file
    #[error("series file error: {0}")]
    SeriesFile(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, EngineError>;
