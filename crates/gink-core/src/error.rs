//! Error types for Gink core.

use thiserror::Error;

use crate::info::{ChainStart, Medallion, Timestamp};

/// Core errors raised while building, encoding or tracking bundles.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("bundler has already been sealed")]
    AlreadySealed,

    #[error("bundler has not been sealed yet")]
    NotSealed,

    #[error("medallion mismatch: bundler pre-assigned {expected}, seal used {got}")]
    MedallionMismatch { expected: Medallion, got: Medallion },

    #[error(
        "bundle {timestamp} is not a valid extension of chain ({medallion}, {chain_start}) \
         seen through {seen_through}"
    )]
    InvalidExtension {
        medallion: Medallion,
        chain_start: ChainStart,
        timestamp: Timestamp,
        seen_through: Timestamp,
    },

    #[error("invalid bundle info: {0}")]
    InvalidInfo(String),

    #[error("malformed bundle: {0}")]
    MalformedBundle(String),

    #[error("malformed muid: {0}")]
    MalformedMuid(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("decoding error: {0}")]
    Decoding(String),

    #[error("timed out waiting for ({medallion}, {timestamp})")]
    Timeout {
        medallion: Medallion,
        timestamp: Timestamp,
    },

    #[error("chain tracker dropped before the wait resolved")]
    WaitAbandoned,
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
