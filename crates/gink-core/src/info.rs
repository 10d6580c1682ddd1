//! Bundle metadata and chain identity.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Microseconds since the Unix epoch.
pub type Timestamp = i64;

/// Random identifier of a chain owner.
pub type Medallion = i64;

/// Timestamp of the first bundle on a chain.
pub type ChainStart = Timestamp;

/// Identifies a process (or other actor) that may claim chains.
pub type ActorId = u32;

/// A chain is identified by its medallion and its start timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainKey {
    pub medallion: Medallion,
    pub chain_start: ChainStart,
}

impl ChainKey {
    pub const fn new(medallion: Medallion, chain_start: ChainStart) -> Self {
        Self {
            medallion,
            chain_start,
        }
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.medallion, self.chain_start)
    }
}

/// Metadata describing a sealed bundle.
///
/// For the first bundle on a chain `timestamp == chain_start` and
/// `prior_time` is absent. Every later bundle names the timestamp of the
/// bundle before it in `prior_time`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BundleInfo {
    pub timestamp: Timestamp,
    pub medallion: Medallion,
    pub chain_start: ChainStart,
    pub prior_time: Option<Timestamp>,
    pub comment: Option<String>,
}

impl BundleInfo {
    /// Info for the first bundle of a new chain.
    pub fn chain_start(medallion: Medallion, timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            medallion,
            chain_start: timestamp,
            prior_time: None,
            comment: None,
        }
    }

    /// Info for the bundle that follows `self` on the same chain.
    pub fn extend(&self, timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            medallion: self.medallion,
            chain_start: self.chain_start,
            prior_time: Some(self.timestamp),
            comment: None,
        }
    }

    /// Attach a comment.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Whether this is the first bundle on its chain.
    pub fn is_chain_start(&self) -> bool {
        self.timestamp == self.chain_start && self.prior_time.is_none()
    }

    /// The chain this bundle belongs to.
    pub fn chain(&self) -> ChainKey {
        ChainKey::new(self.medallion, self.chain_start)
    }

    /// Check the shape rules every bundle must satisfy on its own.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.medallion <= 0 {
            return Err(CoreError::InvalidInfo(format!(
                "medallion must be positive, got {}",
                self.medallion
            )));
        }
        if self.timestamp <= 0 || self.chain_start <= 0 {
            return Err(CoreError::InvalidInfo("timestamps must be positive".into()));
        }
        if self.timestamp < self.chain_start {
            return Err(CoreError::InvalidInfo(format!(
                "timestamp {} precedes chain start {}",
                self.timestamp, self.chain_start
            )));
        }
        match self.prior_time {
            None if self.timestamp != self.chain_start => Err(CoreError::InvalidInfo(format!(
                "bundle {} has no prior time but is not the chain start {}",
                self.timestamp, self.chain_start
            ))),
            Some(prior) if prior >= self.timestamp || prior < self.chain_start => {
                Err(CoreError::InvalidInfo(format!(
                    "prior time {} out of range for bundle {}",
                    prior, self.timestamp
                )))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for BundleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bundle {} on chain ({}, {})",
            self.timestamp, self.medallion, self.chain_start
        )?;
        if let Some(prior) = self.prior_time {
            write!(f, " after {prior}")?;
        }
        Ok(())
    }
}
