//! FluxMon Core - Pull-based Metrics Collection, Storage and Alerting
//!
//! A single-node monitoring engine built around its own time-series
//! database.
//!
//! # Architecture
//!
//! - **Series Index**: label set to series reference mapping with postings
//! - **Storage Engine**: WAL, in-memory head block, immutable on-disk
//!   blocks, compaction and retention
//! - **Scrape Scheduler**: one task per target pulling text exposition
//! - **Query Evaluator**: PromQL-style expressions over a read snapshot
//! - **Rule Evaluator**: recording rules and the alert lifecycle
//! - **Alert Dispatcher**: grouping, throttling and routing of alerts

pub mod block;
pub mod compaction;
pub mod compression;
pub mod head;
pub mod index;
pub mod notify;
pub mod query;
pub mod rules;
pub mod scrape;
pub mod settings;
pub mod storage;
pub mod wal;

mod error;
mod types;

pub use error::{Error, QueryError, Result};
pub use types::*;

/// FluxMon version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Head block range and smallest block size (2h)
    pub const BLOCK_RANGE_MS: i64 = 2 * 60 * 60 * 1000;

    /// Samples per chunk before a new chunk is cut
    pub const SAMPLES_PER_CHUNK: usize = 120;

    /// Number of compaction levels above the head block range
    pub const COMPACTION_LEVELS: usize = 3;

    /// Range multiplier between compaction levels
    pub const COMPACTION_FACTOR: i64 = 3;

    /// Retention period (15d)
    pub const RETENTION_MS: i64 = 15 * 24 * 60 * 60 * 1000;

    /// WAL segment size (16MB)
    pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

    /// WAL fsync interval
    pub const WAL_SYNC_MILLIS: u64 = 1000;

    /// Chunk segment file size inside a block (512MB)
    pub const CHUNK_SEGMENT_SIZE: u64 = 512 * 1024 * 1024;

    /// Staleness lookback for instant vector selectors (5m)
    pub const LOOKBACK_DELTA_MS: i64 = 5 * 60 * 1000;

    /// Default query timeout (2m)
    pub const QUERY_TIMEOUT_MS: u64 = 2 * 60 * 1000;

    /// Default per-query sample budget
    pub const QUERY_MAX_SAMPLES: usize = 50_000_000;

    /// Maximum concurrent scrape fetches
    pub const SCRAPE_CONCURRENCY: usize = 64;
}
