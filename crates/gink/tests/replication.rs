//! Replication between databases over the in-memory network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;

use gink::core::{AsOf, Behavior, Bundler, ChainTracker, Muid};
use gink::store::{LogBackedStore, MemoryStore, Store, StoreExt};
use gink::sync::{
    verify_convergence, MemoryNetwork, MemoryTransport, PeerId, SyncError, SyncMessage, Transport,
};
use gink::{Database, DatabaseConfig};
use gink_testkit::fixtures::ChainFixture;

const IDLE: Duration = Duration::from_millis(20);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn open<S: Store>(
    network: &Arc<MemoryNetwork>,
    id: PeerId,
    store: S,
) -> Result<Database<S>> {
    let transport = network.create_transport(id).await;
    let config = DatabaseConfig::default()
        .with_identity(format!("replica-{id}"))
        .with_actor_id(id.0 as u32);
    Ok(Database::new(store, config)
        .await?
        .with_transport(Arc::new(transport)))
}

/// Poll both sides until neither has anything left to handle.
async fn settle<A: Store, B: Store>(a: &Database<A>, b: &Database<B>) -> Result<()> {
    loop {
        let handled = a.poll_messages(IDLE).await? + b.poll_messages(IDLE).await?;
        if handled == 0 {
            return Ok(());
        }
    }
}

async fn commit_set<S: Store>(db: &Database<S>, key: &str, value: &str) -> Result<()> {
    let mut bundler = Bundler::new();
    bundler.set(Muid::ROOT, key, value.as_bytes().to_vec())?;
    db.add_bundler(&mut bundler).await?;
    Ok(())
}

#[tokio::test]
async fn test_peer_catches_up_through_greeting() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = open(&network, PeerId::new(1), MemoryStore::new()).await?;
    let b = open(&network, PeerId::new(2), MemoryStore::new()).await?;

    for i in 0..3 {
        commit_set(&a, "k", &format!("v{i}")).await?;
    }

    let peer = a.connect(PeerId::new(2)).await?;
    settle(&a, &b).await?;
    peer.ready().await?;

    assert!(verify_convergence(a.store(), b.store()).await?.is_converged());
    let value = b.store().get_value(Muid::ROOT, &"k".into(), AsOf::Latest).await?;
    assert_eq!(value, Some(Bytes::from_static(b"v2")));
    assert_eq!(b.get_chain_tracker().await, a.get_chain_tracker().await);

    // Everything we sent was acknowledged.
    assert!(!peer.has_sent_unacked_data().await);
    Ok(())
}

#[tokio::test]
async fn test_live_commits_fan_out() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = open(&network, PeerId::new(1), MemoryStore::new()).await?;
    let b = open(&network, PeerId::new(2), MemoryStore::new()).await?;

    a.connect(PeerId::new(2)).await?;
    settle(&a, &b).await?;

    let remote = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&remote);
    let seq = Muid::global(Behavior::Sequence);
    b.add_listener(Some(seq), true, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    })
    .await;

    let mut bundler = Bundler::new();
    bundler.push(seq, b"one".to_vec())?;
    a.add_bundler(&mut bundler).await?;
    commit_set(&a, "other", "x").await?;
    settle(&a, &b).await?;

    assert_eq!(remote.load(Ordering::SeqCst), 1);
    let values = b.store().get_ordered_values(seq, AsOf::Latest).await?;
    assert_eq!(values, vec![Bytes::from_static(b"one")]);
    assert!(verify_convergence(a.store(), b.store()).await?.is_converged());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_writers_converge() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = open(&network, PeerId::new(1), MemoryStore::new()).await?;
    let b = open(&network, PeerId::new(2), MemoryStore::new()).await?;

    commit_set(&a, "a", "1").await?;
    commit_set(&b, "b", "1").await?;
    commit_set(&a, "shared", "from-a").await?;
    commit_set(&b, "shared", "from-b").await?;

    b.connect(PeerId::new(1)).await?;
    settle(&a, &b).await?;

    assert!(verify_convergence(a.store(), b.store()).await?.is_converged());
    for key in ["a", "b", "shared"] {
        assert_eq!(
            a.store().get_entry_by_key(Muid::ROOT, &key.into(), AsOf::Latest).await?,
            b.store().get_entry_by_key(Muid::ROOT, &key.into(), AsOf::Latest).await?,
        );
    }
    // Last writer wins by entry timestamp.
    let shared = b.store().get_value(Muid::ROOT, &"shared".into(), AsOf::Latest).await?;
    assert_eq!(shared, Some(Bytes::from_static(b"from-b")));
    Ok(())
}

#[tokio::test]
async fn test_bundles_relay_through_middle_replica() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = open(&network, PeerId::new(1), MemoryStore::new()).await?;
    let b = open(&network, PeerId::new(2), MemoryStore::new()).await?;
    let c = open(&network, PeerId::new(3), MemoryStore::new()).await?;

    a.connect(PeerId::new(2)).await?;
    c.connect(PeerId::new(2)).await?;
    for _ in 0..3 {
        settle(&a, &b).await?;
        settle(&b, &c).await?;
    }

    commit_set(&a, "k", "relayed").await?;
    for _ in 0..3 {
        settle(&a, &b).await?;
        settle(&b, &c).await?;
    }

    assert!(verify_convergence(a.store(), c.store()).await?.is_converged());
    let value = c.store().get_value(Muid::ROOT, &"k".into(), AsOf::Latest).await?;
    assert_eq!(value, Some(Bytes::from_static(b"relayed")));
    Ok(())
}

#[tokio::test]
async fn test_log_backed_replica_survives_restart() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("b.db");
    let network = MemoryNetwork::new();
    let a = open(&network, PeerId::new(1), MemoryStore::new()).await?;

    {
        let b = open(&network, PeerId::new(2), LogBackedStore::open(&path)?).await?;
        commit_set(&a, "k", "durable").await?;
        a.connect(PeerId::new(2)).await?;
        settle(&a, &b).await?;
        b.close().await;
    }

    let reopened = LogBackedStore::open(&path)?;
    assert!(verify_convergence(a.store(), &reopened).await?.is_converged());
    let value = reopened.get_value(Muid::ROOT, &"k".into(), AsOf::Latest).await?;
    assert_eq!(value, Some(Bytes::from_static(b"durable")));
    Ok(())
}

#[tokio::test]
async fn test_handshake_times_out_without_greeting() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let transport = network.create_transport(PeerId::new(1)).await;
    let _silent = network.create_transport(PeerId::new(9)).await;
    let a = Database::new(
        MemoryStore::new(),
        DatabaseConfig::default().with_handshake_timeout(Duration::from_millis(30)),
    )
    .await?
    .with_transport(Arc::new(transport));

    let peer = a.connect(PeerId::new(9)).await?;
    let err = peer.ready().await.unwrap_err();
    assert!(matches!(err, SyncError::HandshakeTimeout { .. }));
    Ok(())
}

/// A hand-driven peer that speaks raw frames.
async fn raw_peer(network: &Arc<MemoryNetwork>, id: PeerId) -> MemoryTransport {
    network.create_transport(id).await
}

#[tokio::test]
async fn test_double_greeting_drops_peer() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = open(&network, PeerId::new(1), MemoryStore::new()).await?;
    let raw = raw_peer(&network, PeerId::new(7)).await;

    let greeting = SyncMessage::Greeting(Bytes::from(ChainTracker::new().greeting_bytes()?));
    raw.send(PeerId::new(1), greeting.encode()?).await?;
    a.poll_messages(IDLE).await?;
    assert_eq!(a.peer_ids().await, vec![PeerId::new(7)]);
    assert!(a.peer(PeerId::new(7)).await.map_or(false, |peer| peer.is_ready()));

    raw.send(PeerId::new(1), greeting.encode()?).await?;
    a.poll_messages(IDLE).await?;
    assert!(a.peer(PeerId::new(7)).await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_unreadable_greeting_drops_peer() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = open(&network, PeerId::new(1), MemoryStore::new()).await?;
    let raw = raw_peer(&network, PeerId::new(7)).await;

    let greeting = SyncMessage::Greeting(Bytes::from_static(b"\xff\x00"));
    raw.send(PeerId::new(1), greeting.encode()?).await?;
    a.poll_messages(IDLE).await?;

    assert!(a.peer(PeerId::new(7)).await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_run_sweeps_failed_handshakes() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let transport = network.create_transport(PeerId::new(1)).await;
    let _silent = network.create_transport(PeerId::new(9)).await;
    let config = DatabaseConfig::default()
        .with_handshake_timeout(Duration::from_millis(20))
        .with_message_timeout(Duration::from_millis(10));
    let a = Database::new(MemoryStore::new(), config)
        .await?
        .with_transport(Arc::new(transport));

    a.connect(PeerId::new(9)).await?;
    assert_eq!(a.peer_ids().await, vec![PeerId::new(9)]);

    // `run` only returns on transport failure.
    let _ = tokio::time::timeout(Duration::from_millis(150), a.run()).await;
    assert!(a.peer_ids().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_commits_during_catch_up_reach_peer() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = open(&network, PeerId::new(1), MemoryStore::new()).await?;
    let b = open(&network, PeerId::new(2), MemoryStore::new()).await?;

    commit_set(&a, "k", "before").await?;
    b.connect(PeerId::new(1)).await?;

    // `a` handles b's greeting while committing more.
    let (polled, committed) = tokio::join!(a.poll_messages(IDLE), async {
        for i in 0..5 {
            commit_set(&a, "k", &format!("during-{i}")).await?;
        }
        anyhow::Ok(())
    });
    polled?;
    committed?;
    settle(&a, &b).await?;

    assert!(verify_convergence(a.store(), b.store()).await?.is_converged());
    let value = b.store().get_value(Muid::ROOT, &"k".into(), AsOf::Latest).await?;
    assert_eq!(value, Some(Bytes::from_static(b"during-4")));
    Ok(())
}

#[tokio::test]
async fn test_chain_violation_drops_peer() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = open(&network, PeerId::new(1), MemoryStore::new()).await?;
    let raw = raw_peer(&network, PeerId::new(7)).await;

    let mut chain = ChainFixture::new(1 << 40, 100);
    let _start = chain.empty()?;
    let orphan = chain.empty()?;

    let greeting = SyncMessage::Greeting(Bytes::from(ChainTracker::new().greeting_bytes()?));
    raw.send(PeerId::new(1), greeting.encode()?).await?;
    raw.send(PeerId::new(1), SyncMessage::Bundle(orphan.bytes().clone()).encode()?)
        .await?;
    a.poll_messages(IDLE).await?;

    assert!(a.peer(PeerId::new(7)).await.is_none());
    assert!(a.store().get_bundles().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_acks_reach_sender() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = open(&network, PeerId::new(1), MemoryStore::new()).await?;
    let raw = raw_peer(&network, PeerId::new(7)).await;

    let mut chain = ChainFixture::new(1 << 40, 100);
    let start = chain.empty()?;
    let greeting = SyncMessage::Greeting(Bytes::from(ChainTracker::new().greeting_bytes()?));
    raw.send(PeerId::new(1), greeting.encode()?).await?;
    raw.send(PeerId::new(1), SyncMessage::Bundle(start.bytes().clone()).encode()?)
        .await?;
    a.poll_messages(IDLE).await?;

    let mut kinds = Vec::new();
    while let Some((_, frame)) = raw.recv_timeout(IDLE).await? {
        kinds.push(SyncMessage::decode(&frame)?);
    }
    assert!(matches!(kinds.first(), Some(SyncMessage::Greeting(_))));
    assert!(kinds.contains(&SyncMessage::ack(start.info())));
    // The sender already has the bundle, so it is not echoed back.
    assert!(!kinds.contains(&SyncMessage::Bundle(start.bytes().clone())));
    Ok(())
}
