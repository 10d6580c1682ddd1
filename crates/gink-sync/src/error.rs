//! Error types for the sync module.

use std::time::Duration;

use thiserror::Error;

use crate::messages::PeerId;

/// Errors that can occur while talking to peers.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Peer connected but never sent a greeting.
    #[error("peer {peer} did not greet within {waited:?}")]
    HandshakeTimeout { peer: PeerId, waited: Duration },

    /// Peer sent a second greeting.
    #[error("peer {0} already sent a greeting")]
    DuplicateGreeting(PeerId),

    /// Peer connection was closed.
    #[error("peer {0} is closed")]
    PeerClosed(PeerId),

    /// No connection to this peer.
    #[error("peer not connected: {0}")]
    PeerNotConnected(PeerId),

    /// Frame could not be decoded as a sync message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Store operation failed.
    #[error("store error: {0}")]
    StoreError(#[from] gink_store::StoreError),

    /// Greeting or bundle could not be decoded.
    #[error("core error: {0}")]
    CoreError(#[from] gink_core::CoreError),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
