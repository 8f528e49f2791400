//! Error types for FluxMon

use crate::Timestamp;
use thiserror::Error;

/// Result type alias for FluxMon operations
pub type Result<T> = std::result::Result<T, Error>;

/// FluxMon error types
#[derive(Error, Debug)]
pub enum Error {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Chunk encoding/decoding error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Malformed label set
    #[error("Invalid labels: {0}")]
    InvalidLabels(String),

    /// Sample timestamp not after the series' last timestamp
    #[error("Out of order sample for {series}: timestamp {timestamp} <= last {last}")]
    OutOfOrder {
        series: String,
        timestamp: Timestamp,
        last: Timestamp,
    },

    /// Sample older than the head block's lower bound
    #[error("Out of bounds sample: timestamp {timestamp} < minimum valid time {min_valid}")]
    OutOfBounds {
        timestamp: Timestamp,
        min_valid: Timestamp,
    },

    /// Write path is refusing appends
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Query error
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Scrape fetch or parse failure
    #[error("Scrape error: {0}")]
    Scrape(String),

    /// Notification delivery failure
    #[error("Notification error: {0}")]
    Notify(String),

    /// WAL recovery error
    #[error("WAL recovery error: {0}")]
    WalRecovery(String),

    /// Compaction error
    #[error("Compaction error: {0}")]
    Compaction(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Notify(_) | Error::Scrape(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Corruption(_) | Error::ChecksumMismatch { .. } | Error::Compression(_)
        )
    }

    /// Errors that reject a single sample without affecting the engine
    pub fn is_ingestion(&self) -> bool {
        matches!(
            self,
            Error::OutOfOrder { .. } | Error::OutOfBounds { .. } | Error::InvalidLabels(_)
        )
    }
}

/// Errors returned by query parsing and evaluation.
///
/// Each variant maps onto a stable category string so callers can render
/// a bad expression differently from a timeout or an unavailable engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// The expression could not be parsed
    #[error("parse error at char {position}: {message}")]
    Parse { position: usize, message: String },

    /// Well-formed expression used with invalid query parameters
    #[error("{0}")]
    BadData(String),

    /// Evaluation exceeded its deadline
    #[error("query timed out in {0}")]
    Timeout(String),

    /// Evaluation loaded more samples than allowed
    #[error("query processing would load too many samples into memory (limit {limit})")]
    TooManySamples { limit: usize },

    /// Semantic failure during evaluation
    #[error("{0}")]
    Execution(String),

    /// Storage could not serve the read
    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

impl QueryError {
    pub(crate) fn parse(position: usize, message: impl Into<String>) -> Self {
        QueryError::Parse {
            position,
            message: message.into(),
        }
    }

    pub(crate) fn exec(message: impl Into<String>) -> Self {
        QueryError::Execution(message.into())
    }

    /// Wire category for the error
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::Parse { .. } | QueryError::BadData(_) => "bad_data",
            QueryError::Timeout(_) => "timeout",
            QueryError::TooManySamples { .. } => "resource_exhausted",
            QueryError::Execution(_) => "execution",
            QueryError::Unavailable(_) => "unavailable",
        }
    }

    /// True for the budget errors (time or samples)
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, QueryError::Timeout(_) | QueryError::TooManySamples { .. })
    }
}

impl From<Error> for QueryError {
    fn from(err: Error) -> Self {
        match err {
            Error::Query(q) => q,
            Error::Unavailable(msg) => QueryError::Unavailable(msg),
            other => QueryError::Unavailable(other.to_string()),
        }
    }
}
