//! Error types for the store module.

use thiserror::Error;

use gink_core::{ChainStart, CoreError, Medallion, Timestamp};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A bundle names a prior time that does not match the chain on record.
    #[error(
        "chain ({medallion}, {chain_start}) is at {seen_through} but bundle {timestamp} \
         claims prior {prior_time:?}"
    )]
    ChainMismatch {
        medallion: Medallion,
        chain_start: ChainStart,
        timestamp: Timestamp,
        prior_time: Option<Timestamp>,
        seen_through: Timestamp,
    },

    /// A non-initial bundle arrived for a chain the store has never seen.
    #[error("bundle {timestamp} extends unknown chain ({medallion}, {chain_start})")]
    MissingChainStart {
        medallion: Medallion,
        chain_start: ChainStart,
        timestamp: Timestamp,
    },

    /// A `BundlesAgo` query reached past the first stored bundle.
    #[error("asked for state {requested} bundles ago but only {available} are stored")]
    AsOfOutOfRange { requested: u32, available: usize },

    /// Bundle bytes failed to decode or validate.
    #[error("decode error: {0}")]
    Decode(#[from] CoreError),

    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// A blocking storage task panicked or was cancelled.
    #[error("storage task failed: {0}")]
    Task(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether this error means the sender broke chain rules.
    pub fn is_chain_violation(&self) -> bool {
        matches!(
            self,
            StoreError::ChainMismatch { .. } | StoreError::MissingChainStart { .. }
        )
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
