//! In-memory implementation of the Store trait.
//!
//! Keeps the [`Index`] behind an async read-write lock. Nothing is
//! persisted; [`crate::LogBackedStore`] puts a durable log in front of it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::debug;

use gink_core::{
    ActorId, AsOf, Bundle, BundleInfo, ChainStart, ChainTracker, ContainerDef, Entry, Medallion,
    Muid, StorageKey,
};

use crate::error::Result;
use crate::index::Index;
use crate::traits::{ClaimedChain, Store};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Index>,
}

impl MemoryStore {
    /// Create a new empty in-memory store that keeps history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that physically drops superseded entries.
    pub fn without_history() -> Self {
        Self {
            inner: RwLock::new(Index::new(false)),
        }
    }

    pub(crate) fn from_index(index: Index) -> Self {
        Self {
            inner: RwLock::new(index),
        }
    }

    /// Run a closure against the index under the read lock.
    pub async fn with_index<T>(&self, f: impl FnOnce(&Index) -> T) -> T {
        let index = self.inner.read().await;
        f(&index)
    }

    /// Decide whether `info` would be applied, without applying it.
    pub(crate) async fn check(&self, info: &BundleInfo) -> Result<bool> {
        self.inner.read().await.check(info)
    }

    pub(crate) async fn claim(&self, medallion: Medallion, chain_start: ChainStart, actor_id: ActorId) {
        self.inner
            .write()
            .await
            .claim_chain(medallion, chain_start, actor_id);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn add_bundle(&self, bytes: Bytes) -> Result<(BundleInfo, bool)> {
        let bundle = Bundle::decode(bytes)?;
        let novel = self.add_decoded(&bundle).await?;
        Ok((bundle.info().clone(), novel))
    }

    async fn add_decoded(&self, bundle: &Bundle) -> Result<bool> {
        let novel = self.inner.write().await.add_bundle(bundle)?;
        if !novel {
            debug!(info = %bundle.info(), "already have bundle");
        }
        Ok(novel)
    }

    async fn get_bundles(&self) -> Result<Vec<Bundle>> {
        Ok(self.inner.read().await.get_bundles())
    }

    async fn get_chain_tracker(&self) -> Result<ChainTracker> {
        Ok(self.inner.read().await.get_chain_tracker())
    }

    async fn get_chain_identity(
        &self,
        medallion: Medallion,
        chain_start: ChainStart,
    ) -> Result<Option<String>> {
        Ok(self
            .inner
            .read()
            .await
            .get_chain_identity(medallion, chain_start))
    }

    async fn get_claimed_chains(&self) -> Result<Vec<ClaimedChain>> {
        Ok(self.inner.read().await.get_claimed_chains())
    }

    async fn claim_chain(
        &self,
        medallion: Medallion,
        chain_start: ChainStart,
        actor_id: ActorId,
    ) -> Result<()> {
        self.claim(medallion, chain_start, actor_id).await;
        Ok(())
    }

    async fn get_container(&self, address: Muid) -> Result<Option<ContainerDef>> {
        Ok(self.inner.read().await.get_container(address))
    }

    async fn get_entry_by_key(
        &self,
        container: Muid,
        key: &StorageKey,
        as_of: AsOf,
    ) -> Result<Option<Entry>> {
        self.inner.read().await.get_entry_by_key(container, key, as_of)
    }

    async fn get_entry_by_id(&self, entry_id: Muid, as_of: AsOf) -> Result<Option<Entry>> {
        self.inner.read().await.get_entry_by_id(entry_id, as_of)
    }

    async fn get_keyed_entries(
        &self,
        container: Muid,
        as_of: AsOf,
    ) -> Result<BTreeMap<StorageKey, Entry>> {
        self.inner.read().await.get_keyed_entries(container, as_of)
    }

    async fn get_ordered_entries(
        &self,
        container: Muid,
        limit: Option<i64>,
        as_of: AsOf,
    ) -> Result<Vec<Entry>> {
        self.inner
            .read()
            .await
            .get_ordered_entries(container, limit, as_of)
    }

    async fn get_entries_by_source_or_target(
        &self,
        vertex: Muid,
        source: bool,
        as_of: AsOf,
    ) -> Result<Vec<Entry>> {
        self.inner
            .read()
            .await
            .get_entries_by_source_or_target(vertex, source, as_of)
    }

    async fn get_back_refs(&self, target: Muid) -> Result<Vec<Entry>> {
        Ok(self.inner.read().await.get_back_refs(target))
    }

    async fn drop_history(&self, container: Option<Muid>, before: AsOf) -> Result<()> {
        self.inner.write().await.drop_history(container, before)?;
        Ok(())
    }

    async fn stop_history(&self) -> Result<()> {
        self.inner.write().await.stop_history()
    }

    async fn start_history(&self) -> Result<()> {
        self.inner.write().await.start_history();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::traits::StoreExt;
    use gink_core::{Behavior, Bundler};
    use gink_testkit::fixtures::{multi_chain_fixtures, ChainFixture};
    use gink_testkit::generators::directory_ops;
    use proptest::prelude::*;

    const M: Medallion = 1 << 40;

    #[tokio::test]
    async fn test_add_bundle_scenario() {
        let store = MemoryStore::new();
        let mut chain = ChainFixture::new(M, 1000);
        let first = chain.empty().unwrap();
        let second = chain.seal_at(1005, Bundler::new()).unwrap();
        let third = chain.seal_at(1010, Bundler::new()).unwrap();

        let (info, novel) = store.add_bundle(first.bytes().clone()).await.unwrap();
        assert!(novel);
        assert_eq!(info.timestamp, 1000);
        assert!(store.add_bundle(second.bytes().clone()).await.unwrap().1);
        assert!(!store.add_bundle(second.bytes().clone()).await.unwrap().1);

        let fresh = MemoryStore::new();
        let err = fresh.add_bundle(third.bytes().clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingChainStart { .. }));
    }

    #[tokio::test]
    async fn test_rejects_garbage_bytes() {
        let store = MemoryStore::new();
        let err = store
            .add_bundle(Bytes::from_static(b"\xa1\x00\x01"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Decode(_)));
    }

    #[tokio::test]
    async fn test_idempotent_state() {
        let store = MemoryStore::new();
        let mut chain = ChainFixture::new(M, 10);
        let mut bundler = Bundler::new();
        let dir = bundler.create_container(Behavior::Directory).unwrap();
        bundler.set(dir.relative(), "k", b"v".to_vec()).unwrap();
        let bundle = chain.seal(bundler).unwrap();

        store.add_bundle(bundle.bytes().clone()).await.unwrap();
        let before = store.with_index(|i| (i.entry_count(), i.removal_count())).await;
        store.add_bundle(bundle.bytes().clone()).await.unwrap();
        let after = store.with_index(|i| (i.entry_count(), i.removal_count())).await;
        assert_eq!(before, after);

        let dir = Muid::new(10, M, 1);
        let value = store.get_value(dir, &"k".into(), AsOf::Latest).await.unwrap();
        assert_eq!(value, Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn test_convergence_across_arrival_orders() {
        let mut chains = multi_chain_fixtures(2, 11);
        let shared = Muid::ROOT;
        let mut bundles = Vec::new();
        for (i, chain) in chains.iter_mut().enumerate() {
            for round in 0..3 {
                let mut bundler = Bundler::new();
                bundler
                    .set(shared, "k", format!("{i}-{round}").into_bytes())
                    .unwrap();
                bundler.push(Muid::global(Behavior::Sequence), vec![i as u8, round]).unwrap();
                bundles.push(chain.seal_at(1_000 * (round as i64 + 1) + i as i64 * 7, bundler).unwrap());
            }
        }

        // Same bundles, two causally valid interleavings.
        let a = MemoryStore::new();
        for bundle in &bundles {
            a.add_decoded(bundle).await.unwrap();
        }
        let b = MemoryStore::new();
        for bundle in bundles.iter().skip(3).chain(bundles.iter().take(3)) {
            b.add_decoded(bundle).await.unwrap();
        }

        let seq = Muid::global(Behavior::Sequence);
        for as_of in [AsOf::Latest, AsOf::Time(2_003), AsOf::Time(1_500)] {
            assert_eq!(
                a.get_entry_by_key(shared, &"k".into(), as_of).await.unwrap(),
                b.get_entry_by_key(shared, &"k".into(), as_of).await.unwrap()
            );
            assert_eq!(
                a.get_ordered_entries(seq, None, as_of).await.unwrap(),
                b.get_ordered_entries(seq, None, as_of).await.unwrap()
            );
        }
        assert_eq!(
            a.get_chain_tracker().await.unwrap(),
            b.get_chain_tracker().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_without_history_drops_superseded() {
        let store = MemoryStore::without_history();
        let mut chain = ChainFixture::new(M, 10);
        for v in [b"1", b"2", b"3"] {
            let mut bundler = Bundler::new();
            bundler.set(Muid::ROOT, "k", v.to_vec()).unwrap();
            store.add_decoded(&chain.seal(bundler).unwrap()).await.unwrap();
        }
        assert_eq!(store.with_index(Index::entry_count).await, 1);
        let value = store.get_value(Muid::ROOT, &"k".into(), AsOf::Latest).await.unwrap();
        assert_eq!(value, Some(Bytes::from_static(b"3")));
    }

    proptest! {
        #[test]
        fn prop_directory_last_write_wins(ops in directory_ops(20)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = MemoryStore::new();
                let mut chain = ChainFixture::new(M, 100);
                let mut expected: BTreeMap<u8, Option<Vec<u8>>> = BTreeMap::new();
                for op in &ops {
                    let mut bundler = Bundler::new();
                    match &op.value {
                        Some(v) => bundler.set(Muid::ROOT, i64::from(op.key), v.clone()).unwrap(),
                        None => bundler.delete(Muid::ROOT, i64::from(op.key)).unwrap(),
                    };
                    store.add_decoded(&chain.seal(bundler).unwrap()).await.unwrap();
                    expected.insert(op.key, op.value.clone());
                }
                for (key, value) in expected {
                    let key = StorageKey::Scalar(i64::from(key).into());
                    let got = store.get_value(Muid::ROOT, &key, AsOf::Latest).await.unwrap();
                    assert_eq!(got.map(|b| b.to_vec()), value);
                }
            });
        }
    }
}
