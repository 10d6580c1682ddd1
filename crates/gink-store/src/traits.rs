//! Store trait: the abstract interface for bundle persistence and indexing.
//!
//! This trait allows the database to be storage-agnostic. Implementations
//! include an in-memory index and a SQLite append log in front of it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use gink_core::{
    ActorId, AsOf, Bundle, BundleInfo, ChainStart, ChainTracker, ContainerDef, Entry, Medallion,
    Muid, StorageKey,
};

use crate::error::Result;

/// A chain this store's owner may append to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedChain {
    pub medallion: Medallion,
    pub chain_start: ChainStart,
    /// Process (or other actor) holding the claim.
    pub actor_id: ActorId,
}

/// The Store trait: async interface for bundle persistence and queries.
///
/// # Design Notes
///
/// - **Single gate**: every mutation of indexed state goes through
///   [`Store::add_bundle`], which checks chain rules fully before applying.
/// - **Idempotent re-delivery**: a bundle at or behind what is on record for
///   its chain returns `(info, false)` and changes nothing.
/// - **Point in time**: every query takes an [`AsOf`]; an entry placed at `T`
///   is visible at `as_of = T`.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Bundle Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Decode, check and apply a bundle.
    ///
    /// # Returns
    /// - `(info, true)` if the bundle was new and has been applied.
    /// - `(info, false)` if the chain already covers it.
    ///
    /// # Errors
    /// - `ChainMismatch` if the bundle does not extend the chain on record.
    /// - `MissingChainStart` if it extends a chain this store has never seen.
    async fn add_bundle(&self, bytes: Bytes) -> Result<(BundleInfo, bool)>;

    /// Same as [`Store::add_bundle`] for a bundle that is already decoded.
    async fn add_decoded(&self, bundle: &Bundle) -> Result<bool>;

    /// All stored bundles ordered by `(timestamp, medallion)`.
    async fn get_bundles(&self) -> Result<Vec<Bundle>>;

    /// A tracker reflecting every chain on record.
    async fn get_chain_tracker(&self) -> Result<ChainTracker>;

    /// The comment on a chain's first bundle, if any.
    async fn get_chain_identity(
        &self,
        medallion: Medallion,
        chain_start: ChainStart,
    ) -> Result<Option<String>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Chain Claims
    // ─────────────────────────────────────────────────────────────────────────

    /// Chains claimed through this store, oldest claim first.
    async fn get_claimed_chains(&self) -> Result<Vec<ClaimedChain>>;

    /// Record that `actor_id` now owns the chain. Replaces an earlier claim.
    async fn claim_chain(
        &self,
        medallion: Medallion,
        chain_start: ChainStart,
        actor_id: ActorId,
    ) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    async fn get_container(&self, address: Muid) -> Result<Option<ContainerDef>>;

    /// Latest live entry at `key` in `container`. Tombstones read as absent.
    async fn get_entry_by_key(
        &self,
        container: Muid,
        key: &StorageKey,
        as_of: AsOf,
    ) -> Result<Option<Entry>>;

    /// Latest placement of an entry, absent once removed.
    async fn get_entry_by_id(&self, entry_id: Muid, as_of: AsOf) -> Result<Option<Entry>>;

    /// Live key to entry map for a keyed container.
    async fn get_keyed_entries(
        &self,
        container: Muid,
        as_of: AsOf,
    ) -> Result<BTreeMap<StorageKey, Entry>>;

    /// Entries of an ordered container by position.
    ///
    /// `limit` of `None` returns everything, `Some(n)` the first `n`, and
    /// `Some(-n)` the last `n` in reverse order.
    async fn get_ordered_entries(
        &self,
        container: Muid,
        limit: Option<i64>,
        as_of: AsOf,
    ) -> Result<Vec<Entry>>;

    /// Live pair-keyed entries whose source (or target) is `vertex`.
    async fn get_entries_by_source_or_target(
        &self,
        vertex: Muid,
        source: bool,
        as_of: AsOf,
    ) -> Result<Vec<Entry>>;

    /// Every stored entry pointing at `target`, regardless of container.
    async fn get_back_refs(&self, target: Muid) -> Result<Vec<Entry>>;

    // ─────────────────────────────────────────────────────────────────────────
    // History
    // ─────────────────────────────────────────────────────────────────────────

    /// Physically delete removed placements and their removal records.
    async fn drop_history(&self, container: Option<Muid>, before: AsOf) -> Result<()>;

    /// Stop keeping history and drop what exists.
    async fn stop_history(&self) -> Result<()>;

    async fn start_history(&self) -> Result<()>;
}

/// Extension trait for common store patterns.
pub trait StoreExt: Store {
    /// The value payload at `key`, if a live entry carries one.
    fn get_value(
        &self,
        container: Muid,
        key: &StorageKey,
        as_of: AsOf,
    ) -> impl std::future::Future<Output = Result<Option<Bytes>>> + Send;

    /// Value payloads of an ordered container, front to back.
    fn get_ordered_values(
        &self,
        container: Muid,
        as_of: AsOf,
    ) -> impl std::future::Future<Output = Result<Vec<Bytes>>> + Send;
}

impl<S: Store + ?Sized> StoreExt for S {
    async fn get_value(&self, container: Muid, key: &StorageKey, as_of: AsOf) -> Result<Option<Bytes>> {
        let entry = self.get_entry_by_key(container, key, as_of).await?;
        Ok(entry.and_then(|entry| entry.value))
    }

    async fn get_ordered_values(&self, container: Muid, as_of: AsOf) -> Result<Vec<Bytes>> {
        let entries = self.get_ordered_entries(container, None, as_of).await?;
        Ok(entries.into_iter().filter_map(|entry| entry.value).collect())
    }
}
