//! One gossip connection and what we believe the far side has.
//!
//! A [`Peer`] starts out `Connecting` with a handshake deadline. The remote
//! side's greeting moves it to `Ready`; missing the deadline moves it to
//! `Failed`. From then on the peer's own [`ChainTracker`] decides which
//! bundles are worth sending, so nothing is sent twice and nothing is sent
//! ahead of its predecessor.
//!
//! Sends to one peer are serialized under a single lock. A bundle that
//! arrives before its predecessor is held back and flushed once the
//! predecessor goes out, and [`Peer::catch_up`] reads the store while
//! holding the same lock, so live fan-out can never slip between the
//! snapshot and the sends.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use gink_core::{Bundle, BundleInfo, ChainKey, ChainTracker, CoreError, Timestamp};
use gink_store::Store;

use crate::error::{Result, SyncError};
use crate::messages::{PeerId, SyncMessage};
use crate::transport::Transport;

/// How long a peer has to send its greeting.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Waiting for the remote greeting.
    Connecting,
    /// Greeting received; bundles flow.
    Ready,
    /// No greeting before the deadline.
    Failed,
    /// Closed locally. Sends are dropped.
    Closed,
}

#[derive(Default)]
struct Outbound {
    /// What the peer has, per its greeting and everything since.
    has_map: Option<ChainTracker>,
    /// Bundles waiting for their predecessor to be sent, per chain.
    pending: BTreeMap<ChainKey, BTreeMap<Timestamp, Bundle>>,
}

impl Outbound {
    /// Drop held bundles the peer already has.
    fn prune(&mut self, chain: ChainKey) {
        let Some(seen) = self
            .has_map
            .as_ref()
            .and_then(|tracker| tracker.get_seen_to(chain.medallion, chain.chain_start))
        else {
            return;
        };
        if let Some(held) = self.pending.get_mut(&chain) {
            held.retain(|timestamp, _| *timestamp > seen);
            if held.is_empty() {
                self.pending.remove(&chain);
            }
        }
    }

    /// Take the first held bundle of `chain`, if any.
    fn next_held(&mut self, chain: ChainKey) -> Option<Bundle> {
        let held = self.pending.get_mut(&chain)?;
        let (_, bundle) = held.pop_first()?;
        if held.is_empty() {
            self.pending.remove(&chain);
        }
        Some(bundle)
    }
}

/// A connected replica.
pub struct Peer {
    id: PeerId,
    transport: Arc<dyn Transport>,
    handshake_timeout: Duration,
    deadline: Instant,
    state: watch::Sender<PeerState>,
    /// Held across every bundle send.
    outbound: Mutex<Outbound>,
    /// Highest timestamp sent per chain and not yet acknowledged.
    unacked: Mutex<BTreeMap<ChainKey, Timestamp>>,
}

impl Peer {
    /// Register a peer and arm its handshake deadline.
    pub fn new(id: PeerId, transport: Arc<dyn Transport>, handshake_timeout: Duration) -> Self {
        let (state, _) = watch::channel(PeerState::Connecting);
        Self {
            id,
            transport,
            handshake_timeout,
            deadline: Instant::now() + handshake_timeout,
            state,
            outbound: Mutex::new(Outbound::default()),
            unacked: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Current state, failing the handshake first if the deadline passed.
    pub fn state(&self) -> PeerState {
        self.expire_if_overdue()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == PeerState::Ready
    }

    pub fn is_closed(&self) -> bool {
        *self.state.borrow() == PeerState::Closed
    }

    /// Wait for the greeting.
    ///
    /// # Errors
    /// - `HandshakeTimeout` if no greeting arrives before the deadline.
    /// - `PeerClosed` if the peer is closed first.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let settled = tokio::time::timeout_at(self.deadline, async {
            rx.wait_for(|state| *state != PeerState::Connecting)
                .await
                .map(|state| *state)
        })
        .await;

        let state = match settled {
            Ok(Ok(state)) => state,
            Ok(Err(_)) => PeerState::Closed,
            Err(_) => self.expire_if_overdue(),
        };
        match state {
            PeerState::Ready => Ok(()),
            PeerState::Closed => Err(SyncError::PeerClosed(self.id)),
            PeerState::Connecting | PeerState::Failed => Err(SyncError::HandshakeTimeout {
                peer: self.id,
                waited: self.handshake_timeout,
            }),
        }
    }

    fn expire_if_overdue(&self) -> PeerState {
        let expired = self.state.send_if_modified(|state| {
            if *state == PeerState::Connecting && Instant::now() >= self.deadline {
                *state = PeerState::Failed;
                true
            } else {
                false
            }
        });
        if expired {
            warn!(peer = %self.id, timeout = ?self.handshake_timeout, "peer never greeted");
        }
        *self.state.borrow()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────────

    /// Accept the peer's greeting. Only one greeting per connection.
    pub async fn receive_has_map(&self, tracker: ChainTracker) -> Result<()> {
        let mut outbound = self.outbound.lock().await;
        match self.expire_if_overdue() {
            PeerState::Connecting => {}
            PeerState::Ready => return Err(SyncError::DuplicateGreeting(self.id)),
            PeerState::Closed => return Err(SyncError::PeerClosed(self.id)),
            PeerState::Failed => {
                return Err(SyncError::HandshakeTimeout {
                    peer: self.id,
                    waited: self.handshake_timeout,
                })
            }
        }
        outbound.has_map = Some(tracker);
        self.state.send_replace(PeerState::Ready);
        debug!(peer = %self.id, "peer greeted");
        Ok(())
    }

    /// The peer sent us this bundle, so it has it.
    pub async fn on_received_bundle(&self, info: &BundleInfo) {
        self.mark_unchecked(info).await;
    }

    async fn mark_unchecked(&self, info: &BundleInfo) {
        let mut outbound = self.outbound.lock().await;
        if let Some(tracker) = outbound.has_map.as_mut() {
            let _ = tracker.mark_as_having(info, false);
        }
        outbound.prune(info.chain());
    }

    /// The peer acknowledged a bundle.
    pub async fn on_ack(&self, info: &BundleInfo) {
        self.mark_unchecked(info).await;
        let mut unacked = self.unacked.lock().await;
        let chain = info.chain();
        if unacked.get(&chain).is_some_and(|sent| *sent <= info.timestamp) {
            unacked.remove(&chain);
        }
    }

    /// Whether any bundle sent to this peer is still unacknowledged.
    pub async fn has_sent_unacked_data(&self) -> bool {
        !self.unacked.lock().await.is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outbound
    // ─────────────────────────────────────────────────────────────────────────

    /// Send the bundle if the peer lacks it.
    ///
    /// Returns whether the bundle was sent now. A bundle that does not yet
    /// extend what the peer has is held back and goes out right after its
    /// predecessor. Before the greeting arrives nothing is sent or held;
    /// [`Peer::catch_up`] covers that window.
    pub async fn send_if_needed(&self, bundle: &Bundle) -> Result<bool> {
        let mut outbound = self.outbound.lock().await;
        self.send_locked(&mut outbound, bundle).await
    }

    /// Offer every bundle in `store` to the peer, in store order.
    ///
    /// The store is read with the send lock held. Returns how many bundles
    /// were sent.
    pub async fn catch_up<S: Store + ?Sized>(&self, store: &S) -> Result<usize> {
        let mut outbound = self.outbound.lock().await;
        let bundles = store.get_bundles().await?;
        let mut sent = 0;
        for bundle in &bundles {
            if self.send_locked(&mut outbound, bundle).await? {
                sent += 1;
            }
        }
        debug!(peer = %self.id, offered = bundles.len(), sent, "caught peer up");
        Ok(sent)
    }

    async fn send_locked(&self, outbound: &mut Outbound, bundle: &Bundle) -> Result<bool> {
        let info = bundle.info();
        let chain = info.chain();
        let Some(tracker) = outbound.has_map.as_mut() else {
            return Ok(false);
        };
        match tracker.mark_as_having(info, true) {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(CoreError::InvalidExtension { seen_through, .. }) => {
                debug!(peer = %self.id, %info, seen_through, "holding bundle until its predecessor is sent");
                outbound
                    .pending
                    .entry(chain)
                    .or_default()
                    .insert(info.timestamp, bundle.clone());
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
        self.send_bundle(bundle).await?;

        // Flush held bundles that now follow on.
        outbound.prune(chain);
        while let Some(held) = outbound.next_held(chain) {
            let Some(tracker) = outbound.has_map.as_mut() else {
                break;
            };
            match tracker.mark_as_having(held.info(), true) {
                Ok(true) => self.send_bundle(&held).await?,
                Ok(false) => {}
                Err(CoreError::InvalidExtension { .. }) => {
                    outbound
                        .pending
                        .entry(chain)
                        .or_default()
                        .insert(held.info().timestamp, held);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    async fn send_bundle(&self, bundle: &Bundle) -> Result<()> {
        let info = bundle.info();
        self.send(SyncMessage::Bundle(bundle.bytes().clone())).await?;
        let mut unacked = self.unacked.lock().await;
        let sent = unacked.entry(info.chain()).or_insert(info.timestamp);
        *sent = (*sent).max(info.timestamp);
        Ok(())
    }

    /// Tell the peer we now have this bundle.
    pub async fn send_ack(&self, info: &BundleInfo) -> Result<()> {
        self.send(SyncMessage::ack(info)).await
    }

    /// Send our serialized chain tracker.
    pub async fn send_greeting(&self, greeting: Bytes) -> Result<()> {
        self.send(SyncMessage::Greeting(greeting)).await
    }

    async fn send(&self, message: SyncMessage) -> Result<()> {
        if self.is_closed() {
            debug!(peer = %self.id, kind = message.kind(), "dropping send to closed peer");
            return Ok(());
        }
        let frame = message.encode()?;
        self.transport.send(self.id, frame).await
    }

    /// Close the connection. Later sends are silently dropped.
    pub async fn close(&self) {
        let was_open = self.state.send_if_modified(|state| {
            if *state == PeerState::Closed {
                false
            } else {
                *state = PeerState::Closed;
                true
            }
        });
        if was_open {
            let mut outbound = self.outbound.lock().await;
            outbound.has_map = None;
            outbound.pending.clear();
            debug!(peer = %self.id, "closed peer");
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryNetwork, MemoryTransport};
    use gink_core::Medallion;
    use gink_store::MemoryStore;
    use gink_testkit::fixtures::ChainFixture;

    const M: Medallion = 1 << 40;
    const LOCAL: PeerId = PeerId::new(1);
    const REMOTE: PeerId = PeerId::new(2);

    async fn pair(timeout: Duration) -> (Peer, MemoryTransport) {
        let network = MemoryNetwork::new();
        let local = network.create_transport(LOCAL).await;
        let remote = network.create_transport(REMOTE).await;
        (Peer::new(REMOTE, Arc::new(local), timeout), remote)
    }

    async fn next_message(remote: &MemoryTransport) -> Option<SyncMessage> {
        let (_, frame) = remote
            .recv_timeout(Duration::from_millis(50))
            .await
            .unwrap()?;
        Some(SyncMessage::decode(&frame).unwrap())
    }

    #[tokio::test]
    async fn test_ready_after_greeting() {
        let (peer, _remote) = pair(DEFAULT_HANDSHAKE_TIMEOUT).await;
        assert_eq!(peer.state(), PeerState::Connecting);
        peer.receive_has_map(ChainTracker::new()).await.unwrap();
        peer.ready().await.unwrap();
        assert!(peer.is_ready());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (peer, _remote) = pair(Duration::from_millis(20)).await;
        let err = peer.ready().await.unwrap_err();
        assert!(matches!(err, SyncError::HandshakeTimeout { peer: id, .. } if id == REMOTE));
        assert_eq!(peer.state(), PeerState::Failed);

        // A late greeting does not revive the connection.
        assert!(peer.receive_has_map(ChainTracker::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_greeting_rejected() {
        let (peer, _remote) = pair(DEFAULT_HANDSHAKE_TIMEOUT).await;
        peer.receive_has_map(ChainTracker::new()).await.unwrap();
        let err = peer.receive_has_map(ChainTracker::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::DuplicateGreeting(id) if id == REMOTE));
    }

    #[tokio::test]
    async fn test_send_if_needed_never_resends() {
        let (peer, remote) = pair(DEFAULT_HANDSHAKE_TIMEOUT).await;
        let mut chain = ChainFixture::new(M, 100);
        let first = chain.empty().unwrap();
        let second = chain.empty().unwrap();

        // Nothing goes out before the greeting.
        assert!(!peer.send_if_needed(&first).await.unwrap());
        peer.receive_has_map(ChainTracker::new()).await.unwrap();

        assert!(peer.send_if_needed(&first).await.unwrap());
        assert!(!peer.send_if_needed(&first).await.unwrap());
        assert!(peer.send_if_needed(&second).await.unwrap());
        assert!(!peer.send_if_needed(&second).await.unwrap());

        assert_eq!(
            next_message(&remote).await,
            Some(SyncMessage::Bundle(first.bytes().clone()))
        );
        assert_eq!(
            next_message(&remote).await,
            Some(SyncMessage::Bundle(second.bytes().clone()))
        );
        assert_eq!(next_message(&remote).await, None);
    }

    #[tokio::test]
    async fn test_out_of_order_bundle_waits_for_predecessor() {
        let (peer, remote) = pair(DEFAULT_HANDSHAKE_TIMEOUT).await;
        let mut chain = ChainFixture::new(M, 100);
        let bundles = chain.empties(3).unwrap();
        peer.receive_has_map(ChainTracker::new()).await.unwrap();

        assert!(!peer.send_if_needed(&bundles[1]).await.unwrap());
        assert!(peer.send_if_needed(&bundles[0]).await.unwrap());
        assert!(peer.send_if_needed(&bundles[2]).await.unwrap());

        for bundle in &bundles {
            assert_eq!(
                next_message(&remote).await,
                Some(SyncMessage::Bundle(bundle.bytes().clone()))
            );
        }
        assert_eq!(next_message(&remote).await, None);
        assert_eq!(chain.last(), Some(bundles[2].info()));
    }

    #[tokio::test]
    async fn test_catch_up_interleaved_with_live_sends() {
        let mut chain = ChainFixture::new(M, 100);
        let bundles = chain.empties(3).unwrap();
        let store = MemoryStore::new();
        store.add_decoded(&bundles[0]).await.unwrap();

        let (peer, remote) = pair(DEFAULT_HANDSHAKE_TIMEOUT).await;
        peer.receive_has_map(ChainTracker::new()).await.unwrap();

        // The snapshot only holds the first bundle; the second is fanned out
        // while the catch-up runs.
        let (caught_up, live) = tokio::join!(peer.catch_up(&store), peer.send_if_needed(&bundles[1]));
        caught_up.unwrap();
        live.unwrap();
        assert!(peer.send_if_needed(&bundles[2]).await.unwrap());

        for bundle in &bundles {
            assert_eq!(
                next_message(&remote).await,
                Some(SyncMessage::Bundle(bundle.bytes().clone()))
            );
        }
        assert_eq!(next_message(&remote).await, None);
    }

    #[tokio::test]
    async fn test_held_bundle_dropped_once_peer_has_it() {
        let (peer, remote) = pair(DEFAULT_HANDSHAKE_TIMEOUT).await;
        let mut chain = ChainFixture::new(M, 100);
        assert_eq!(chain.chain_start(), None);
        let bundles = chain.empties(2).unwrap();
        assert_eq!(chain.chain_start(), Some(100));
        peer.receive_has_map(ChainTracker::new()).await.unwrap();

        assert!(!peer.send_if_needed(&bundles[1]).await.unwrap());
        // The peer got both from someone else.
        peer.on_received_bundle(bundles[0].info()).await;
        peer.on_received_bundle(bundles[1].info()).await;
        assert!(!peer.send_if_needed(&bundles[0]).await.unwrap());
        assert_eq!(next_message(&remote).await, None);
    }

    #[tokio::test]
    async fn test_skips_what_peer_already_has() {
        let (peer, remote) = pair(DEFAULT_HANDSHAKE_TIMEOUT).await;
        let mut chain = ChainFixture::new(M, 100);
        let first = chain.empty().unwrap();

        let mut theirs = ChainTracker::new();
        theirs.mark_as_having(first.info(), true).unwrap();
        peer.receive_has_map(theirs).await.unwrap();
        assert!(!peer.send_if_needed(&first).await.unwrap());

        let second = chain.empty().unwrap();
        peer.on_received_bundle(second.info()).await;
        assert!(!peer.send_if_needed(&second).await.unwrap());
        assert_eq!(next_message(&remote).await, None);
    }

    #[tokio::test]
    async fn test_unacked_until_ack() {
        let (peer, _remote) = pair(DEFAULT_HANDSHAKE_TIMEOUT).await;
        let mut chain = ChainFixture::new(M, 100);
        let first = chain.empty().unwrap();
        let second = chain.empty().unwrap();
        peer.receive_has_map(ChainTracker::new()).await.unwrap();

        peer.send_if_needed(&first).await.unwrap();
        peer.send_if_needed(&second).await.unwrap();
        assert!(peer.has_sent_unacked_data().await);

        peer.on_ack(first.info()).await;
        assert!(peer.has_sent_unacked_data().await);
        peer.on_ack(second.info()).await;
        assert!(!peer.has_sent_unacked_data().await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_silences_sends() {
        let (peer, remote) = pair(DEFAULT_HANDSHAKE_TIMEOUT).await;
        let mut chain = ChainFixture::new(M, 100);
        let first = chain.empty().unwrap();
        peer.receive_has_map(ChainTracker::new()).await.unwrap();

        peer.close().await;
        peer.close().await;
        assert!(peer.is_closed());
        assert!(!peer.send_if_needed(&first).await.unwrap());
        peer.send_ack(first.info()).await.unwrap();
        peer.send_greeting(Bytes::from_static(b"\x80")).await.unwrap();
        assert_eq!(next_message(&remote).await, None);
        assert!(matches!(peer.ready().await, Err(SyncError::PeerClosed(_))));
    }
}
