//! The Database: local commits, gossip and listeners over one store.
//!
//! All writes, local or remote, funnel into [`Store::add_decoded`]. Only a
//! bundle the store accepted as novel is tracked, acknowledged, forwarded
//! to other peers and shown to listeners.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use gink_core::{
    Bundle, BundleInfo, Bundler, ChainKey, ChainTracker, Medallion, Muid, Timestamp,
};
use gink_store::Store;
use gink_sync::{Peer, PeerId, PeerState, SyncError, SyncMessage, Transport};

use crate::clock::{Clock, SystemClock, TimestampGenerator};
use crate::config::DatabaseConfig;
use crate::error::{DatabaseError, Result};
use crate::identity::{LivenessOracle, MedallionSource, ProcessLiveness, RandomMedallions};
use crate::listener::{ListenerId, Listeners};

/// The main Database struct.
///
/// Provides:
/// - Committing bundlers to a lazily acquired chain
/// - Receiving bundles from peers
/// - Greeting, catching up and acknowledging peers
/// - Listeners on all bundles or on single containers
pub struct Database<S: Store> {
    /// The storage backend.
    store: Arc<S>,
    /// Configuration.
    config: DatabaseConfig,
    timestamps: TimestampGenerator,
    medallions: Arc<dyn MedallionSource>,
    liveness: Arc<dyn LivenessOracle>,
    transport: Option<Arc<dyn Transport>>,
    /// Chain lock. Holds the last bundle on our chain once one is acquired.
    chain: Mutex<Option<BundleInfo>>,
    /// What this replica has; mirrors the store.
    tracker: Mutex<ChainTracker>,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    listeners: RwLock<Listeners>,
}

impl<S: Store> Database<S> {
    /// Open a database over `store` with the system clock, random
    /// medallions and process liveness.
    pub async fn new(store: S, config: DatabaseConfig) -> Result<Self> {
        Self::with_collaborators(
            store,
            config,
            Arc::new(SystemClock),
            Arc::new(RandomMedallions),
            Arc::new(ProcessLiveness),
        )
        .await
    }

    /// Open a database with explicit collaborators.
    pub async fn with_collaborators(
        store: S,
        config: DatabaseConfig,
        clock: Arc<dyn Clock>,
        medallions: Arc<dyn MedallionSource>,
        liveness: Arc<dyn LivenessOracle>,
    ) -> Result<Self> {
        if !config.keep_history {
            store.stop_history().await?;
        }
        let tracker = store.get_chain_tracker().await?;
        debug!(chains = tracker.chains(None).len(), "opened database");
        Ok(Self {
            store: Arc::new(store),
            config,
            timestamps: TimestampGenerator::new(clock),
            medallions,
            liveness,
            transport: None,
            chain: Mutex::new(None),
            tracker: Mutex::new(tracker),
            peers: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Listeners::default()),
        })
    }

    /// Attach the transport used to reach peers.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Get the store reference.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Seal `bundler` onto our chain, store it and fan it out.
    ///
    /// Holds the chain lock throughout, so bundles on our chain are sealed
    /// one at a time with strictly increasing timestamps.
    pub async fn add_bundler(&self, bundler: &mut Bundler) -> Result<BundleInfo> {
        let mut chain = self.chain.lock().await;
        let last = match chain.as_ref() {
            Some(last) => last.clone(),
            None => self.acquire_chain().await?,
        };
        *chain = Some(last.clone());

        let timestamp = self.timestamps.next_after(last.timestamp);
        let bundle = bundler.seal(last.extend(timestamp))?.clone();
        let info = self.receive_decoded(&bundle, None).await?;
        *chain = Some(info.clone());
        Ok(info)
    }

    /// Reuse a chain whose owner is gone, or start a new one.
    ///
    /// Called with the chain lock held.
    async fn acquire_chain(&self) -> Result<BundleInfo> {
        let actor_id = self.config.actor_id();

        for claim in self.store.get_claimed_chains().await? {
            if self.liveness.is_alive(claim.actor_id) {
                continue;
            }
            let last = self
                .tracker
                .lock()
                .await
                .get_bundle_info(claim.medallion, claim.chain_start)
                .cloned();
            let Some(last) = last else {
                continue;
            };
            self.store
                .claim_chain(claim.medallion, claim.chain_start, actor_id)
                .await?;
            info!(
                medallion = claim.medallion,
                chain_start = claim.chain_start,
                previous_actor = claim.actor_id,
                "reusing chain"
            );
            return Ok(last);
        }

        let medallion = self.medallions.next_medallion();
        let chain_start = self.timestamps.next();
        let info = BundleInfo::chain_start(medallion, chain_start).with_comment(self.config.identity());
        let bundle = Bundler::new().seal(info)?.clone();
        let info = self.receive_decoded(&bundle, None).await?;
        self.store.claim_chain(medallion, chain_start, actor_id).await?;
        info!(medallion, chain_start, actor_id, "started chain");
        Ok(info)
    }

    /// The chain this database appends to, once acquired.
    pub async fn claimed_chain(&self) -> Option<ChainKey> {
        self.chain.lock().await.as_ref().map(BundleInfo::chain)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound Bundles
    // ─────────────────────────────────────────────────────────────────────────

    /// Decode and apply a bundle, from a peer or from local code.
    ///
    /// A bundle from a peer that does not fit its chain closes that peer.
    pub async fn receive_bundle(&self, bytes: Bytes, from: Option<PeerId>) -> Result<BundleInfo> {
        let bundle = match Bundle::decode(bytes) {
            Ok(bundle) => bundle,
            Err(e) => {
                if let Some(peer_id) = from {
                    warn!(peer = %peer_id, error = %e, "undecodable bundle from peer");
                    self.disconnect(peer_id).await;
                }
                return Err(e.into());
            }
        };
        self.receive_decoded(&bundle, from).await
    }

    async fn receive_decoded(&self, bundle: &Bundle, from: Option<PeerId>) -> Result<BundleInfo> {
        let info = bundle.info().clone();
        let novel = match self.store.add_decoded(bundle).await {
            Ok(novel) => novel,
            Err(e) => {
                if let Some(peer_id) = from {
                    if e.is_chain_violation() {
                        warn!(peer = %peer_id, %info, error = %e, "peer sent bundle that breaks its chain");
                        self.disconnect(peer_id).await;
                    }
                }
                return Err(e.into());
            }
        };
        if !novel {
            debug!(%info, "bundle already stored");
            return Ok(info);
        }
        debug!(%info, from = ?from, "added bundle");

        self.tracker.lock().await.mark_as_having(&info, false)?;

        if let Some(peer_id) = from {
            if let Some(peer) = self.peer(peer_id).await {
                peer.on_received_bundle(&info).await;
                if let Err(e) = peer.send_ack(&info).await {
                    self.drop_failed_peer(peer_id, e).await;
                }
            }
        }

        for peer in self.peers_except(from).await {
            if let Err(e) = peer.send_if_needed(bundle).await {
                self.drop_failed_peer(peer.id(), e).await;
            }
        }

        let listeners = self.listeners.read().await.matching(bundle, from.is_some());
        for listener in listeners {
            listener(bundle);
        }
        Ok(info)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    /// Open a connection to `peer_id` and send our greeting.
    ///
    /// Await [`Peer::ready`] on the result to wait for the peer's greeting.
    pub async fn connect(&self, peer_id: PeerId) -> Result<Arc<Peer>> {
        let transport = self.transport.clone().ok_or(DatabaseError::NoTransport)?;
        let peer = Arc::new(Peer::new(peer_id, transport, self.config.handshake_timeout()));
        if let Some(previous) = self.peers.write().await.insert(peer_id, Arc::clone(&peer)) {
            previous.close().await;
        }

        let greeting = self.tracker.lock().await.greeting_bytes()?;
        if let Err(e) = peer.send_greeting(Bytes::from(greeting)).await {
            self.disconnect(peer_id).await;
            return Err(e.into());
        }
        info!(peer = %peer_id, "connected to peer");
        Ok(peer)
    }

    /// Close and forget a peer. Unknown peers are ignored.
    pub async fn disconnect(&self, peer_id: PeerId) {
        let removed = self.peers.write().await.remove(&peer_id);
        if let Some(peer) = removed {
            peer.close().await;
            info!(peer = %peer_id, "disconnected peer");
        }
    }

    async fn drop_failed_peer(&self, peer_id: PeerId, error: SyncError) {
        warn!(peer = %peer_id, error = %error, "send failed; dropping peer");
        self.disconnect(peer_id).await;
    }

    pub async fn peer(&self, peer_id: PeerId) -> Option<Arc<Peer>> {
        self.peers.read().await.get(&peer_id).cloned()
    }

    pub async fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    async fn peers_except(&self, skip: Option<PeerId>) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .await
            .values()
            .filter(|peer| Some(peer.id()) != skip)
            .cloned()
            .collect()
    }

    /// Handle one frame from a connected peer.
    pub async fn handle_frame(&self, from: PeerId, frame: Bytes) -> Result<()> {
        let peer = self.peer(from).await.ok_or(DatabaseError::UnknownPeer(from))?;
        let message = match SyncMessage::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %from, error = %e, "unreadable frame");
                self.disconnect(from).await;
                return Err(e.into());
            }
        };

        match message {
            SyncMessage::Greeting(greeting) => {
                let tracker = match ChainTracker::from_greeting(&greeting) {
                    Ok(tracker) => tracker,
                    Err(e) => {
                        warn!(peer = %from, error = %e, "unreadable greeting");
                        self.disconnect(from).await;
                        return Err(e.into());
                    }
                };
                if let Err(e) = peer.receive_has_map(tracker).await {
                    warn!(peer = %from, error = %e, "rejected greeting");
                    self.disconnect(from).await;
                    return Err(e.into());
                }
                debug!(peer = %from, "got greeting; catching peer up");
                if let Err(e) = peer.catch_up(self.store.as_ref()).await {
                    self.disconnect(from).await;
                    return Err(e.into());
                }
            }
            SyncMessage::Bundle(bytes) => {
                self.receive_bundle(bytes, Some(from)).await?;
            }
            SyncMessage::Ack {
                medallion,
                chain_start,
                timestamp,
            } => {
                let info = BundleInfo {
                    timestamp,
                    medallion,
                    chain_start,
                    prior_time: None,
                    comment: None,
                };
                debug!(peer = %from, %info, "got ack");
                peer.on_ack(&info).await;
            }
        }
        Ok(())
    }

    /// Receive and handle frames until the transport closes.
    ///
    /// Whenever no frame arrives within the configured message timeout,
    /// peers that never greeted are dropped.
    pub async fn run(&self) -> Result<()> {
        let transport = self.transport.clone().ok_or(DatabaseError::NoTransport)?;
        loop {
            match transport.recv_timeout(self.config.message_timeout()).await? {
                Some((from, frame)) => self.dispatch(from, frame).await?,
                None => {
                    self.drop_failed_handshakes().await;
                }
            }
        }
    }

    /// Disconnect peers whose handshake deadline passed. Returns how many.
    pub async fn drop_failed_handshakes(&self) -> usize {
        let failed: Vec<PeerId> = self
            .peers
            .read()
            .await
            .values()
            .filter(|peer| peer.state() == PeerState::Failed)
            .map(|peer| peer.id())
            .collect();
        for peer_id in &failed {
            self.disconnect(*peer_id).await;
        }
        failed.len()
    }

    /// Handle frames until none arrives for `idle`. Returns how many were handled.
    pub async fn poll_messages(&self, idle: Duration) -> Result<usize> {
        let transport = self.transport.clone().ok_or(DatabaseError::NoTransport)?;
        let mut handled = 0;
        while let Some((from, frame)) = transport.recv_timeout(idle).await? {
            self.dispatch(from, frame).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// First frame from an unknown peer opens an inbound connection.
    /// Per-frame protocol errors close that peer and are not fatal here.
    async fn dispatch(&self, from: PeerId, frame: Bytes) -> Result<()> {
        if self.peer(from).await.is_none() {
            self.connect(from).await?;
        }
        if let Err(e) = self.handle_frame(from, frame).await {
            warn!(peer = %from, error = %e, "failed to handle frame");
        }
        Ok(())
    }

    /// Close every peer connection.
    pub async fn close(&self) {
        let peers: Vec<Arc<Peer>> = self.peers.write().await.drain().map(|(_, peer)| peer).collect();
        for peer in peers {
            peer.close().await;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Listeners and Tracking
    // ─────────────────────────────────────────────────────────────────────────

    /// Call `callback` for every novel bundle, or only for bundles touching
    /// `container`. With `remote_only`, local commits are skipped.
    pub async fn add_listener<F>(&self, container: Option<Muid>, remote_only: bool, callback: F) -> ListenerId
    where
        F: Fn(&Bundle) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .await
            .add(container, remote_only, Arc::new(callback))
    }

    /// Returns whether the listener was registered.
    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.write().await.remove(id)
    }

    /// Resolve once the bundle that created `muid` (or a later one on its
    /// chain) has been stored.
    pub async fn wait_till_has(&self, muid: Muid, timeout: Option<Duration>) -> Result<()> {
        let wait = self
            .tracker
            .lock()
            .await
            .wait_till_has(muid.medallion, muid.timestamp, timeout);
        wait.await?;
        Ok(())
    }

    pub async fn get_chain_tracker(&self) -> ChainTracker {
        self.tracker.lock().await.clone()
    }

    /// Whether the bundle at `(medallion, timestamp)` has been stored.
    pub async fn has(&self, medallion: Medallion, timestamp: Timestamp) -> bool {
        self.tracker.lock().await.has(medallion, timestamp)
    }
}

impl<S: Store> std::fmt::Debug for Database<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
