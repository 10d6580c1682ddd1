//! Error types for the Database.

use gink_core::CoreError;
use gink_store::StoreError;
use gink_sync::{PeerId, SyncError};
use thiserror::Error;

/// Errors that can occur during Database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Bundle could not be built, decoded or tracked.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Storage error, including rejected chain extensions.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Peer or transport error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Networking was requested but no transport is attached.
    #[error("no transport attached")]
    NoTransport,

    /// Frame from a peer we have no connection for.
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),
}

impl DatabaseError {
    /// Whether a bundle was refused because it does not fit its chain.
    pub fn is_chain_violation(&self) -> bool {
        matches!(self, DatabaseError::Store(e) if e.is_chain_violation())
    }
}

/// Result type for Database operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;
