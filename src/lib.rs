//! tsm-shard - Storage engine core for a time-series database shard
//!
//! A Time Structured Merge tree engine coordinating three tiers:
//! - an in-memory **cache** of recently written values,
//! - an append-only **write-ahead log** for durability,
//! - an immutable on-disk **file store** of sorted columnar TSM files,
//!
//! plus the compaction subsystem (planner, scheduler, tracker, bounded
//! worker pool) that merges TSM files across levels while writes, deletes
//! and snapshots proceed concurrently.
//!
//! The TSM block codecs, the measurement/series index and the series file
//! are external collaborators consumed through the traits in
//! [`engine::traits`]; [`engine::stubs`] provides in-memory and flat-file
//! implementations for tests and development.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compaction;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod storage;
pub mod sync;
pub mod types;
pub mod value;

// Re-export main types
pub use config::Config;
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, Result};
pub use types::{Point, Tags};
pub use value::{FieldValue, Value};
