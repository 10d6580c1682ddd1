//! Transport abstraction for gossip.
//!
//! A transport moves opaque frames between peers over an ordered, reliable
//! channel. Implementations may use WebSockets or anything else; this
//! crate ships only the in-memory network used by tests.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::messages::PeerId;

/// Transport trait for sending and receiving frames.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a frame to a specific peer.
    async fn send(&self, peer: PeerId, frame: Bytes) -> Result<()>;

    /// Receive the next frame from any peer.
    ///
    /// Blocks until a frame is available or the transport is closed.
    async fn recv(&self) -> Result<(PeerId, Bytes)>;

    /// Receive with timeout.
    ///
    /// Returns None if timeout expires before a frame arrives.
    async fn recv_timeout(&self, timeout: Duration) -> Result<Option<(PeerId, Bytes)>>;

    /// Get the local peer's identity.
    fn local_peer_id(&self) -> PeerId;

    /// List currently reachable peers.
    async fn connected_peers(&self) -> Result<Vec<PeerId>>;

    /// Check if a specific peer is reachable.
    async fn is_connected(&self, peer: PeerId) -> bool;
}

/// A simple in-memory transport for testing.
///
/// Uses channels to simulate message passing between replicas.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex, RwLock};

    use crate::error::SyncError;

    const CHANNEL_CAPACITY: usize = 1024;

    /// Frame envelope for internal routing.
    #[derive(Debug, Clone)]
    struct Envelope {
        from: PeerId,
        frame: Bytes,
    }

    /// Shared state for the memory transport network.
    #[derive(Default)]
    pub struct MemoryNetwork {
        /// Sender channels for each peer.
        senders: RwLock<HashMap<PeerId, mpsc::Sender<Envelope>>>,
    }

    impl MemoryNetwork {
        /// Create a new memory network.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Create a transport connected to this network.
        pub async fn create_transport(self: &Arc<Self>, peer_id: PeerId) -> MemoryTransport {
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

            self.senders.write().await.insert(peer_id, tx);

            MemoryTransport {
                peer_id,
                network: Arc::clone(self),
                receiver: Mutex::new(rx),
            }
        }

        /// Drop a peer from the network. Pending frames are discarded and
        /// later sends to it fail.
        pub async fn disconnect(&self, peer_id: PeerId) {
            self.senders.write().await.remove(&peer_id);
        }
    }

    /// In-memory transport implementation.
    pub struct MemoryTransport {
        peer_id: PeerId,
        network: Arc<MemoryNetwork>,
        receiver: Mutex<mpsc::Receiver<Envelope>>,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&self, peer: PeerId, frame: Bytes) -> Result<()> {
            let sender = {
                let senders = self.network.senders.read().await;
                senders.get(&peer).cloned()
            };
            let Some(sender) = sender else {
                return Err(SyncError::PeerNotConnected(peer));
            };
            let envelope = Envelope {
                from: self.peer_id,
                frame,
            };
            sender
                .send(envelope)
                .await
                .map_err(|_| SyncError::TransportError("peer disconnected".into()))
        }

        async fn recv(&self) -> Result<(PeerId, Bytes)> {
            let mut rx = self.receiver.lock().await;
            match rx.recv().await {
                Some(envelope) => Ok((envelope.from, envelope.frame)),
                None => Err(SyncError::TransportError("channel closed".into())),
            }
        }

        async fn recv_timeout(&self, timeout: Duration) -> Result<Option<(PeerId, Bytes)>> {
            let mut rx = self.receiver.lock().await;
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(envelope)) => Ok(Some((envelope.from, envelope.frame))),
                Ok(None) => Err(SyncError::TransportError("channel closed".into())),
                Err(_) => Ok(None),
            }
        }

        fn local_peer_id(&self) -> PeerId {
            self.peer_id
        }

        async fn connected_peers(&self) -> Result<Vec<PeerId>> {
            let senders = self.network.senders.read().await;
            Ok(senders
                .keys()
                .filter(|id| **id != self.peer_id)
                .copied()
                .collect())
        }

        async fn is_connected(&self, peer: PeerId) -> bool {
            self.network.senders.read().await.contains_key(&peer)
        }
    }
}
