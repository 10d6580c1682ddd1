//! Durable store: a SQLite append log in front of the in-memory index.
//!
//! The log holds raw bundle bytes in acceptance order plus a small log of
//! chain claims. Opening a log replays both into a fresh [`Index`], so the
//! index is never persisted itself. It uses rusqlite with bundled SQLite,
//! wrapped in async via `tokio::task::spawn_blocking`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use gink_core::{
    ActorId, AsOf, Bundle, BundleInfo, ChainStart, ChainTracker, ContainerDef, Entry, Medallion,
    Muid, StorageKey,
};

use crate::error::{Result, StoreError};
use crate::index::Index;
use crate::memory::MemoryStore;
use crate::migration::{self, now_millis};
use crate::traits::{ClaimedChain, Store};

const KEEP_HISTORY: &str = "keep_history";

/// Store that appends every accepted bundle to a SQLite log.
///
/// A bundle is appended only after the index confirms it is novel and
/// extends its chain, and applied only after the append succeeded. Appends
/// are serialized, so check-then-append-then-apply is atomic.
pub struct LogBackedStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
    index: MemoryStore,
    append_lock: AsyncMutex<()>,
}

impl LogBackedStore {
    /// Open (or create) a log at the given path and replay it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory SQLite log.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        migration::migrate(&mut conn)?;
        let index = replay(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            index: MemoryStore::from_index(index),
            append_lock: AsyncMutex::new(()),
        })
    }

    /// Number of bundles in the log.
    pub async fn log_len(&self) -> Result<usize> {
        self.blocking(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM bundles", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    /// The in-memory index this log feeds.
    pub fn index(&self) -> &MemoryStore {
        &self.index
    }

    /// Execute a blocking operation on the connection.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Task(format!("connection mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(format!("spawn_blocking failed: {e}")))?
    }

    async fn set_keep_history(&self, keep: bool) -> Result<()> {
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO settings (name, value) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET value = excluded.value",
                params![KEEP_HISTORY, keep as i64],
            )?;
            Ok(())
        })
        .await
    }
}

/// Rebuild the index from the logs.
fn replay(conn: &Connection) -> Result<Index> {
    let keep_history: bool = conn
        .query_row(
            "SELECT value FROM settings WHERE name = ?1",
            params![KEEP_HISTORY],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .map_or(true, |value| value != 0);
    let mut index = Index::new(keep_history);

    let mut stmt = conn.prepare("SELECT seq, bytes FROM bundles ORDER BY seq")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;
    let mut replayed = 0usize;
    for row in rows {
        let (seq, bytes) = row?;
        let bundle = Bundle::decode(bytes)
            .map_err(|e| StoreError::InvalidData(format!("log entry {seq}: {e}")))?;
        if !index.add_bundle(&bundle)? {
            return Err(StoreError::InvalidData(format!(
                "log entry {seq} duplicates an earlier bundle"
            )));
        }
        replayed += 1;
    }

    let mut stmt =
        conn.prepare("SELECT medallion, chain_start, actor_id FROM claims ORDER BY seq")?;
    let claims = stmt.query_map([], |row| {
        Ok((
            row.get::<_, Medallion>(0)?,
            row.get::<_, ChainStart>(1)?,
            row.get::<_, ActorId>(2)?,
        ))
    })?;
    for claim in claims {
        let (medallion, chain_start, actor_id) = claim?;
        index.claim_chain(medallion, chain_start, actor_id);
    }

    debug!(bundles = replayed, "replayed bundle log");
    Ok(index)
}

#[async_trait]
impl Store for LogBackedStore {
    async fn add_bundle(&self, bytes: Bytes) -> Result<(BundleInfo, bool)> {
        let bundle = Bundle::decode(bytes)?;
        let novel = self.add_decoded(&bundle).await?;
        Ok((bundle.info().clone(), novel))
    }

    async fn add_decoded(&self, bundle: &Bundle) -> Result<bool> {
        let _guard = self.append_lock.lock().await;
        if !self.index.check(bundle.info()).await? {
            return Ok(false);
        }

        let info = bundle.info().clone();
        let bytes = bundle.bytes().clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO bundles (timestamp, medallion, chain_start, bytes, appended_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    info.timestamp,
                    info.medallion,
                    info.chain_start,
                    bytes.as_ref(),
                    now_millis()
                ],
            )?;
            Ok(())
        })
        .await?;

        self.index.add_decoded(bundle).await
    }

    async fn get_bundles(&self) -> Result<Vec<Bundle>> {
        self.index.get_bundles().await
    }

    async fn get_chain_tracker(&self) -> Result<ChainTracker> {
        self.index.get_chain_tracker().await
    }

    async fn get_chain_identity(
        &self,
        medallion: Medallion,
        chain_start: ChainStart,
    ) -> Result<Option<String>> {
        self.index.get_chain_identity(medallion, chain_start).await
    }

    async fn get_claimed_chains(&self) -> Result<Vec<ClaimedChain>> {
        self.index.get_claimed_chains().await
    }

    async fn claim_chain(
        &self,
        medallion: Medallion,
        chain_start: ChainStart,
        actor_id: ActorId,
    ) -> Result<()> {
        let _guard = self.append_lock.lock().await;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO claims (medallion, chain_start, actor_id, claimed_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![medallion, chain_start, actor_id, now_millis()],
            )?;
            Ok(())
        })
        .await?;
        self.index.claim(medallion, chain_start, actor_id).await;
        info!(medallion, chain_start, actor_id, "claimed chain");
        Ok(())
    }

    async fn get_container(&self, address: Muid) -> Result<Option<ContainerDef>> {
        self.index.get_container(address).await
    }

    async fn get_entry_by_key(
        &self,
        container: Muid,
        key: &StorageKey,
        as_of: AsOf,
    ) -> Result<Option<Entry>> {
        self.index.get_entry_by_key(container, key, as_of).await
    }

    async fn get_entry_by_id(&self, entry_id: Muid, as_of: AsOf) -> Result<Option<Entry>> {
        self.index.get_entry_by_id(entry_id, as_of).await
    }

    async fn get_keyed_entries(
        &self,
        container: Muid,
        as_of: AsOf,
    ) -> Result<BTreeMap<StorageKey, Entry>> {
        self.index.get_keyed_entries(container, as_of).await
    }

    async fn get_ordered_entries(
        &self,
        container: Muid,
        limit: Option<i64>,
        as_of: AsOf,
    ) -> Result<Vec<Entry>> {
        self.index.get_ordered_entries(container, limit, as_of).await
    }

    async fn get_entries_by_source_or_target(
        &self,
        vertex: Muid,
        source: bool,
        as_of: AsOf,
    ) -> Result<Vec<Entry>> {
        self.index
            .get_entries_by_source_or_target(vertex, source, as_of)
            .await
    }

    async fn get_back_refs(&self, target: Muid) -> Result<Vec<Entry>> {
        self.index.get_back_refs(target).await
    }

    /// Compacts the in-memory index only; replaying the log restores what
    /// was dropped unless history is switched off.
    async fn drop_history(&self, container: Option<Muid>, before: AsOf) -> Result<()> {
        self.index.drop_history(container, before).await
    }

    async fn stop_history(&self) -> Result<()> {
        let _guard = self.append_lock.lock().await;
        self.set_keep_history(false).await?;
        self.index.stop_history().await
    }

    async fn start_history(&self) -> Result<()> {
        let _guard = self.append_lock.lock().await;
        self.set_keep_history(true).await?;
        self.index.start_history().await
    }
}
