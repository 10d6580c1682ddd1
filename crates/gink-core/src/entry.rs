//! Stored forms of entries, removals and clearances.
//!
//! These are what a store indexes after applying a bundle: every relative
//! muid has been resolved against the bundle that carried it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::change::{Behavior, StorageKey};
use crate::info::Timestamp;
use crate::muid::Muid;

/// An entry as placed in a container.
///
/// `entry_id` names the change that created the entry. `placement_id` names
/// where in time it currently sits: equal to `entry_id` for a fresh entry,
/// or the movement's muid for an entry that has been moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub behavior: Behavior,
    pub container_id: Muid,
    pub entry_id: Muid,
    pub storage_key: StorageKey,
    pub pointee: Option<Muid>,
    pub value: Option<Bytes>,
    pub deletion: bool,
    pub placement_id: Muid,
    /// Left and right members of a pair-keyed entry.
    pub pair: Option<(Muid, Muid)>,
}

impl Entry {
    /// Whether this entry is a tombstone.
    pub fn is_deletion(&self) -> bool {
        self.deletion
    }

    /// When this placement became visible.
    pub fn placed_at(&self) -> Timestamp {
        self.placement_id.timestamp
    }

    /// The source vertex of a pair-keyed entry.
    pub fn source(&self) -> Option<Muid> {
        self.pair.map(|(left, _)| left)
    }

    /// The target vertex of a pair-keyed entry.
    pub fn target(&self) -> Option<Muid> {
        self.pair.map(|(_, right)| right)
    }
}

/// Records that a placement was moved away or superseded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Removal {
    /// Placement being removed.
    pub removing: Muid,
    /// The movement (or replacing entry) doing the removing.
    pub removal_id: Muid,
    pub container_id: Muid,
    /// Position the entry moved to, zero for a plain removal.
    pub dest: Timestamp,
    pub entry_id: Muid,
}

/// Records that a container was cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearanceRecord {
    pub container_id: Muid,
    pub clearance_id: Muid,
    pub purging: bool,
}

/// Point in time for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AsOf {
    /// Everything currently stored.
    #[default]
    Latest,
    /// State including everything placed at or before this timestamp.
    Time(Timestamp),
    /// State just before the n-th most recent bundle (1 = without the last bundle).
    BundlesAgo(u32),
}

impl From<Timestamp> for AsOf {
    fn from(ts: Timestamp) -> Self {
        AsOf::Time(ts)
    }
}
