//! Ordered in-memory index of bundles, entries, removals and clearances.
//!
//! ## Overview
//!
//! Everything is kept in B-tree maps and sets keyed by composite tuples, so
//! that point-in-time lookups are range scans:
//!
//! - `(container, storage_key, placement)` finds the latest value of a key
//!   as of a time with one reverse scan.
//! - `(entry_id, placement)` finds where an entry currently sits.
//! - `(removing, removal_id)` answers "was this placement removed by T?".
//! - `(container, clearance_id)` gives the latest clearance before T.
//!
//! [`Index`] is synchronous and single-threaded. Store implementations wrap
//! it in a lock; [`Index::add_bundle`] is the only mutation path for
//! indexed state.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Included};

use tracing::debug;

use gink_core::{
    ActorId, AsOf, Behavior, Bundle, BundleInfo, ChainKey, ChainStart, ChainTracker, Change,
    ClearanceRecord, ContainerDef, Entry, EntryChange, Medallion, MovementChange, Muid, Removal,
    StorageKey, Timestamp,
};

use crate::error::{Result, StoreError};
use crate::traits::ClaimedChain;

/// Synchronous point-in-time index.
#[derive(Debug)]
pub struct Index {
    keeping_history: bool,

    /// Latest bundle info per chain.
    chains: BTreeMap<ChainKey, BundleInfo>,

    /// Bundles by `(timestamp, medallion)`.
    bundles: BTreeMap<(Timestamp, Medallion), Bundle>,

    containers: BTreeMap<Muid, ContainerDef>,

    /// Entries by placement id.
    entries: BTreeMap<Muid, Entry>,

    /// `(container, storage_key, placement)`.
    by_key: BTreeSet<(Muid, StorageKey, Muid)>,

    /// `(entry_id, placement)`.
    by_location: BTreeSet<(Muid, Muid)>,

    /// `(pointee, placement)`.
    by_pointee: BTreeSet<(Muid, Muid)>,

    /// `(source, placement)` and `(target, placement)` for pair-keyed entries.
    by_source: BTreeSet<(Muid, Muid)>,
    by_target: BTreeSet<(Muid, Muid)>,

    /// Removals by `(removing, removal_id)`.
    removals: BTreeMap<(Muid, Muid), Removal>,

    /// `(container, removal_id, removing)`.
    removals_by_container: BTreeSet<(Muid, Muid, Muid)>,

    /// Clearances by `(container, clearance_id)`.
    clearances: BTreeMap<(Muid, Muid), ClearanceRecord>,

    claims: Vec<ClaimedChain>,
}

impl Default for Index {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Index {
    pub fn new(keeping_history: bool) -> Self {
        Self {
            keeping_history,
            chains: BTreeMap::new(),
            bundles: BTreeMap::new(),
            containers: BTreeMap::new(),
            entries: BTreeMap::new(),
            by_key: BTreeSet::new(),
            by_location: BTreeSet::new(),
            by_pointee: BTreeSet::new(),
            by_source: BTreeSet::new(),
            by_target: BTreeSet::new(),
            removals: BTreeMap::new(),
            removals_by_container: BTreeSet::new(),
            clearances: BTreeMap::new(),
            claims: Vec::new(),
        }
    }

    pub fn is_keeping_history(&self) -> bool {
        self.keeping_history
    }

    pub fn bundle_count(&self) -> usize {
        self.bundles.len()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn removal_count(&self) -> usize {
        self.removals.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bundle ingestion
    // ─────────────────────────────────────────────────────────────────────────

    /// Decide whether a bundle should be applied.
    ///
    /// Returns `Ok(false)` for a bundle the chain already covers, and an
    /// error for one that would fork the chain or skip its start.
    pub fn check(&self, info: &BundleInfo) -> Result<bool> {
        match self.chains.get(&info.chain()) {
            Some(prior) if prior.timestamp >= info.timestamp => Ok(false),
            Some(prior) if Some(prior.timestamp) != info.prior_time => {
                Err(StoreError::ChainMismatch {
                    medallion: info.medallion,
                    chain_start: info.chain_start,
                    timestamp: info.timestamp,
                    prior_time: info.prior_time,
                    seen_through: prior.timestamp,
                })
            }
            None if info.prior_time.is_some() => Err(StoreError::MissingChainStart {
                medallion: info.medallion,
                chain_start: info.chain_start,
                timestamp: info.timestamp,
            }),
            _ => Ok(true),
        }
    }

    /// Check and, if novel, apply a bundle. Nothing changes on error.
    pub fn add_bundle(&mut self, bundle: &Bundle) -> Result<bool> {
        if !self.check(bundle.info())? {
            return Ok(false);
        }
        self.apply(bundle)?;
        Ok(true)
    }

    /// Apply a bundle that [`Index::check`] accepted.
    fn apply(&mut self, bundle: &Bundle) -> Result<()> {
        let info = bundle.info();
        let (timestamp, medallion) = (info.timestamp, info.medallion);

        // Everything fallible happens before the first mutation.
        let mut keys = Vec::with_capacity(bundle.changes().len());
        for change in bundle.changes() {
            keys.push(match change {
                Change::Entry(entry) => Some(entry.storage_key(timestamp, medallion)?),
                _ => None,
            });
        }

        for ((id, change), key) in bundle.changes_with_ids().zip(keys) {
            match (change, key) {
                (Change::Container(def), _) => {
                    self.containers.insert(id, *def);
                }
                (Change::Entry(entry), Some(key)) => self.apply_entry(id, entry, key, info),
                (Change::Entry(_), None) => {}
                (Change::Movement(movement), _) => self.apply_movement(id, movement, info),
                (Change::Clearance(clearance), _) => {
                    let container = clearance.container.resolve(timestamp, medallion);
                    if clearance.purge {
                        self.purge_container(container, id);
                    }
                    self.clearances.insert(
                        (container, id),
                        ClearanceRecord {
                            container_id: container,
                            clearance_id: id,
                            purging: clearance.purge,
                        },
                    );
                }
            }
        }

        self.chains.insert(info.chain(), info.clone());
        self.bundles.insert((timestamp, medallion), bundle.clone());
        debug!(
            timestamp,
            medallion,
            changes = bundle.changes().len(),
            "applied bundle"
        );
        Ok(())
    }

    fn apply_entry(&mut self, id: Muid, change: &EntryChange, key: StorageKey, info: &BundleInfo) {
        let (timestamp, medallion) = (info.timestamp, info.medallion);
        let container_id = change.container_id(timestamp, medallion);
        if self.is_purged(container_id, id) {
            debug!(entry = %id, container = %container_id, "entry predates a purge");
            return;
        }

        if change.behavior.is_replacing() {
            let previous = self
                .by_key
                .range((container_id, key.clone(), Muid::MIN)..(container_id, key.clone(), id))
                .next_back()
                .map(|(_, _, placement)| *placement);
            if let Some(previous) = previous {
                if self.keeping_history {
                    let entry_id = self
                        .entries
                        .get(&previous)
                        .map_or(previous, |entry| entry.entry_id);
                    self.insert_removal(Removal {
                        removing: previous,
                        removal_id: id,
                        container_id,
                        dest: 0,
                        entry_id,
                    });
                } else {
                    self.delete_entry(previous);
                }
            }
        }

        self.insert_entry(Entry {
            behavior: change.behavior,
            container_id,
            entry_id: id,
            storage_key: key,
            pointee: change.pointee.map(|p| p.resolve(timestamp, medallion)),
            value: change.value.clone(),
            deletion: change.deletion,
            placement_id: id,
            pair: change.resolved_pair(timestamp, medallion),
        });
    }

    fn apply_movement(&mut self, id: Muid, movement: &MovementChange, info: &BundleInfo) {
        let (timestamp, medallion) = (info.timestamp, info.medallion);
        let entry_id = movement.entry.resolve(timestamp, medallion);

        let placements = (entry_id, Muid::MIN)..=(entry_id, Muid::MAX);
        let newest = self.by_location.range(placements.clone()).next_back();
        if let Some((_, newest)) = newest.filter(|(_, placement)| *placement > id) {
            debug!(%entry_id, movement = %id, placement = %newest, "movement older than current placement");
            return;
        }

        // Most recent placement that has not been removed already.
        let found = self
            .by_location
            .range(placements)
            .rev()
            .map(|(_, placement)| *placement)
            .find(|placement| !self.is_removed(*placement, Timestamp::MAX));
        let Some(found) = found.and_then(|placement| self.entries.get(&placement).cloned()) else {
            debug!(%entry_id, movement = %id, "movement target not found");
            return;
        };
        if self.is_purged(found.container_id, id) {
            debug!(%entry_id, movement = %id, "movement predates a purge");
            return;
        }

        let container_id = movement
            .container
            .map_or(found.container_id, |c| c.resolve(timestamp, medallion));

        if movement.dest != 0 {
            self.insert_entry(Entry {
                storage_key: StorageKey::Position(movement.dest),
                placement_id: id,
                ..found.clone()
            });
        }

        if movement.purge || !self.keeping_history {
            self.delete_entry(found.placement_id);
        } else {
            self.insert_removal(Removal {
                removing: found.placement_id,
                removal_id: id,
                container_id,
                dest: movement.dest,
                entry_id,
            });
        }
    }

    /// Delete what a purging clearance hides: placements, removals and
    /// clearances in `container` older than `clearance_id`.
    fn purge_container(&mut self, container: Muid, clearance_id: Muid) {
        let placements: Vec<Muid> = self
            .by_key
            .range((container, StorageKey::MIN, Muid::MIN)..=(container, StorageKey::MAX, Muid::MAX))
            .map(|(_, _, placement)| *placement)
            .filter(|placement| *placement < clearance_id)
            .collect();
        for placement in placements {
            self.delete_entry(placement);
        }

        let removals: Vec<(Muid, Muid, Muid)> = self
            .removals_by_container
            .range((container, Muid::MIN, Muid::MIN)..=(container, Muid::MAX, Muid::MAX))
            .filter(|(_, _, removing)| *removing < clearance_id)
            .copied()
            .collect();
        for (_, removal_id, removing) in removals {
            self.delete_removal(removing, removal_id);
        }

        let cleared: Vec<(Muid, Muid)> = self
            .clearances
            .range((container, Muid::MIN)..(container, clearance_id))
            .map(|(key, _)| *key)
            .collect();
        for key in cleared {
            self.clearances.remove(&key);
        }
    }

    /// Whether a purging clearance newer than `id` already covers `container`.
    fn is_purged(&self, container: Muid, id: Muid) -> bool {
        self.clearances
            .range((Excluded((container, id)), Included((container, Muid::MAX))))
            .any(|(_, clearance)| clearance.purging)
    }

    fn insert_entry(&mut self, entry: Entry) {
        let placement = entry.placement_id;
        self.by_key
            .insert((entry.container_id, entry.storage_key.clone(), placement));
        self.by_location.insert((entry.entry_id, placement));
        if let Some(pointee) = entry.pointee {
            self.by_pointee.insert((pointee, placement));
        }
        if let Some((source, target)) = entry.pair {
            self.by_source.insert((source, placement));
            self.by_target.insert((target, placement));
        }
        self.entries.insert(placement, entry);
    }

    fn delete_entry(&mut self, placement: Muid) {
        let Some(entry) = self.entries.remove(&placement) else {
            return;
        };
        self.by_key
            .remove(&(entry.container_id, entry.storage_key, placement));
        self.by_location.remove(&(entry.entry_id, placement));
        if let Some(pointee) = entry.pointee {
            self.by_pointee.remove(&(pointee, placement));
        }
        if let Some((source, target)) = entry.pair {
            self.by_source.remove(&(source, placement));
            self.by_target.remove(&(target, placement));
        }
    }

    fn insert_removal(&mut self, removal: Removal) {
        self.removals_by_container
            .insert((removal.container_id, removal.removal_id, removal.removing));
        self.removals
            .insert((removal.removing, removal.removal_id), removal);
    }

    fn delete_removal(&mut self, removing: Muid, removal_id: Muid) {
        if let Some(removal) = self.removals.remove(&(removing, removal_id)) {
            self.removals_by_container
                .remove(&(removal.container_id, removal_id, removing));
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Point-in-time helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Turn an [`AsOf`] into the latest timestamp that should be visible.
    pub fn resolve_as_of(&self, as_of: AsOf) -> Result<Timestamp> {
        match as_of {
            AsOf::Latest | AsOf::BundlesAgo(0) => Ok(Timestamp::MAX),
            AsOf::Time(timestamp) => Ok(timestamp),
            AsOf::BundlesAgo(n) => self
                .bundles
                .keys()
                .rev()
                .nth(n as usize - 1)
                .map(|(timestamp, _)| timestamp - 1)
                .ok_or(StoreError::AsOfOutOfRange {
                    requested: n,
                    available: self.bundles.len(),
                }),
        }
    }

    /// Id of the latest clearance of `container` visible at `as_of`.
    fn clearance_before(&self, container: Muid, as_of: Timestamp) -> Option<Muid> {
        self.clearances
            .range((container, Muid::MIN)..=(container, Muid::upper_bound_at(as_of)))
            .next_back()
            .map(|((_, clearance_id), _)| *clearance_id)
    }

    /// Whether `placement` has a removal that took effect by `as_of`.
    fn is_removed(&self, placement: Muid, as_of: Timestamp) -> bool {
        self.removals
            .range((placement, Muid::MIN)..=(placement, Muid::upper_bound_at(as_of)))
            .next()
            .is_some()
    }

    /// Whether a placement is visible at `as_of`, ignoring tombstones.
    fn is_live(&self, entry: &Entry, as_of: Timestamp) -> bool {
        let cleared = self
            .clearance_before(entry.container_id, as_of)
            .is_some_and(|clearance| entry.placement_id < clearance);
        entry.placed_at() <= as_of && !cleared && !self.is_removed(entry.placement_id, as_of)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_container(&self, address: Muid) -> Option<ContainerDef> {
        if address == Muid::ROOT {
            return Some(ContainerDef {
                behavior: Behavior::Directory,
            });
        }
        if address.timestamp == -1 && address.medallion == -1 {
            let behavior = u8::try_from(address.offset)
                .ok()
                .and_then(Behavior::from_u8)?;
            return Some(ContainerDef { behavior });
        }
        self.containers.get(&address).copied()
    }

    pub fn get_entry_by_key(&self, container: Muid, key: &StorageKey, as_of: AsOf) -> Result<Option<Entry>> {
        let as_of = self.resolve_as_of(as_of)?;
        let found = self
            .by_key
            .range(
                (container, key.clone(), Muid::MIN)
                    ..=(container, key.clone(), Muid::upper_bound_at(as_of)),
            )
            .next_back()
            .and_then(|(_, _, placement)| self.entries.get(placement));
        Ok(found
            .filter(|entry| !entry.is_deletion() && self.is_live(entry, as_of))
            .cloned())
    }

    pub fn get_entry_by_id(&self, entry_id: Muid, as_of: AsOf) -> Result<Option<Entry>> {
        let as_of = self.resolve_as_of(as_of)?;
        let found = self
            .by_location
            .range((entry_id, Muid::MIN)..=(entry_id, Muid::upper_bound_at(as_of)))
            .next_back()
            .and_then(|(_, placement)| self.entries.get(placement));
        Ok(found.filter(|entry| self.is_live(entry, as_of)).cloned())
    }

    pub fn get_keyed_entries(&self, container: Muid, as_of: AsOf) -> Result<BTreeMap<StorageKey, Entry>> {
        let as_of = self.resolve_as_of(as_of)?;
        let mut result = BTreeMap::new();
        let range = (container, StorageKey::MIN, Muid::MIN)..=(container, StorageKey::MAX, Muid::MAX);
        for (_, key, placement) in self.by_key.range(range) {
            if key.is_positional() {
                continue;
            }
            let Some(entry) = self.entries.get(placement) else {
                continue;
            };
            if !self.is_live(entry, as_of) {
                continue;
            }
            // Placements ascend within a key, so the last one seen wins.
            if entry.is_deletion() {
                result.remove(key);
            } else {
                result.insert(key.clone(), entry.clone());
            }
        }
        Ok(result)
    }

    pub fn get_ordered_entries(&self, container: Muid, limit: Option<i64>, as_of: AsOf) -> Result<Vec<Entry>> {
        let as_of = self.resolve_as_of(as_of)?;
        let range = (container, StorageKey::Position(Timestamp::MIN), Muid::MIN)
            ..=(container, StorageKey::Position(Timestamp::MAX), Muid::MAX);
        let live = |(_, _, placement): &(Muid, StorageKey, Muid)| {
            self.entries
                .get(placement)
                .filter(|entry| !entry.is_deletion() && self.is_live(entry, as_of))
                .cloned()
        };

        let entries = match limit {
            None => self.by_key.range(range).filter_map(live).collect(),
            Some(n) if n >= 0 => self
                .by_key
                .range(range)
                .filter_map(live)
                .take(n as usize)
                .collect(),
            Some(n) => self
                .by_key
                .range(range)
                .rev()
                .filter_map(live)
                .take(n.unsigned_abs() as usize)
                .collect(),
        };
        Ok(entries)
    }

    pub fn get_entries_by_source_or_target(&self, vertex: Muid, source: bool, as_of: AsOf) -> Result<Vec<Entry>> {
        let as_of = self.resolve_as_of(as_of)?;
        let index = if source { &self.by_source } else { &self.by_target };
        Ok(index
            .range((vertex, Muid::MIN)..=(vertex, Muid::MAX))
            .filter_map(|(_, placement)| self.entries.get(placement))
            .filter(|entry| !entry.is_deletion() && self.is_live(entry, as_of))
            .cloned()
            .collect())
    }

    pub fn get_back_refs(&self, target: Muid) -> Vec<Entry> {
        self.by_pointee
            .range((target, Muid::MIN)..=(target, Muid::MAX))
            .filter_map(|(_, placement)| self.entries.get(placement))
            .cloned()
            .collect()
    }

    pub fn get_bundles(&self) -> Vec<Bundle> {
        self.bundles.values().cloned().collect()
    }

    pub fn has_bundle(&self, timestamp: Timestamp, medallion: Medallion) -> bool {
        self.bundles.contains_key(&(timestamp, medallion))
    }

    pub fn get_chain_tracker(&self) -> ChainTracker {
        let mut tracker = ChainTracker::new();
        for info in self.chains.values() {
            let _ = tracker.mark_as_having(info, false);
        }
        tracker
    }

    pub fn get_chain_identity(&self, medallion: Medallion, chain_start: ChainStart) -> Option<String> {
        self.bundles
            .get(&(chain_start, medallion))
            .and_then(|bundle| bundle.info().comment.clone())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Claims
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_claimed_chains(&self) -> Vec<ClaimedChain> {
        self.claims.clone()
    }

    pub fn claim_chain(&mut self, medallion: Medallion, chain_start: ChainStart, actor_id: ActorId) {
        self.claims
            .retain(|c| !(c.medallion == medallion && c.chain_start == chain_start));
        self.claims.push(ClaimedChain {
            medallion,
            chain_start,
            actor_id,
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // History
    // ─────────────────────────────────────────────────────────────────────────

    /// Delete placements removed at or before `before`, with their removals.
    pub fn drop_history(&mut self, container: Option<Muid>, before: AsOf) -> Result<usize> {
        let before = self.resolve_as_of(before)?;
        let doomed: Vec<(Muid, Muid)> = match container {
            Some(container) => self
                .removals_by_container
                .range((container, Muid::MIN, Muid::MIN)..=(container, Muid::upper_bound_at(before), Muid::MAX))
                .map(|(_, removal_id, removing)| (*removing, *removal_id))
                .collect(),
            None => self
                .removals
                .keys()
                .filter(|(_, removal_id)| removal_id.timestamp <= before)
                .copied()
                .collect(),
        };
        for (removing, removal_id) in &doomed {
            self.delete_entry(*removing);
            self.delete_removal(*removing, *removal_id);
        }
        debug!(dropped = doomed.len(), "dropped history");
        Ok(doomed.len())
    }

    pub fn stop_history(&mut self) -> Result<()> {
        self.keeping_history = false;
        self.drop_history(None, AsOf::Latest)?;
        Ok(())
    }

    pub fn start_history(&mut self) {
        self.keeping_history = true;
    }
}
