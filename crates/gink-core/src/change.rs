//! Changes: the contents of a bundle.
//!
//! A bundle carries an ordered list of changes. Offsets start at 1, so the
//! change at index `i` has the muid `(bundle.timestamp, bundle.medallion, i + 1)`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::info::{Medallion, Timestamp};
use crate::muid::Muid;

/// The kind of container an entry belongs to.
///
/// Determines how an entry's key is interpreted and whether a new entry
/// replaces the previous one at the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Behavior {
    Box = 1,
    Sequence = 2,
    KeySet = 3,
    Directory = 4,
    PairSet = 5,
    PairMap = 6,
    Vertex = 7,
    EdgeType = 8,
    Property = 9,
    Group = 10,
}

impl Behavior {
    /// Convert to the wire number.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Try to parse from the wire number.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Box),
            2 => Some(Self::Sequence),
            3 => Some(Self::KeySet),
            4 => Some(Self::Directory),
            5 => Some(Self::PairSet),
            6 => Some(Self::PairMap),
            7 => Some(Self::Vertex),
            8 => Some(Self::EdgeType),
            9 => Some(Self::Property),
            10 => Some(Self::Group),
            _ => None,
        }
    }

    /// Whether a new entry supersedes the previous one at the same key.
    pub fn is_replacing(self) -> bool {
        !self.is_ordered()
    }

    /// Whether entries are positioned in time rather than keyed.
    pub fn is_ordered(self) -> bool {
        matches!(self, Self::Sequence | Self::EdgeType)
    }
}

/// A user-level key for keyed containers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScalarKey {
    Integer(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<&str> for ScalarKey {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for ScalarKey {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for ScalarKey {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<Vec<u8>> for ScalarKey {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

/// The resolved key an entry is indexed under within its container.
///
/// Entries sort by `(container, storage_key, placement)`; a reverse scan of
/// that order from `(container, key, as_of)` finds the latest value of a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StorageKey {
    /// Box and Vertex containers hold a single slot.
    Unit,
    /// Directory and KeySet keys.
    Scalar(ScalarKey),
    /// Sequence and EdgeType positions.
    Position(Timestamp),
    /// Property and Group entries are keyed by the container they describe.
    Describing(Muid),
    /// PairSet and PairMap entries are keyed by an ordered pair.
    Pair(Muid, Muid),
}

impl StorageKey {
    pub const MIN: Self = Self::Unit;
    pub const MAX: Self = Self::Pair(Muid::MAX, Muid::MAX);

    /// Whether this is a position in an ordered container.
    pub fn is_positional(&self) -> bool {
        matches!(self, Self::Position(_))
    }
}

impl From<ScalarKey> for StorageKey {
    fn from(key: ScalarKey) -> Self {
        Self::Scalar(key)
    }
}

impl From<&str> for StorageKey {
    fn from(key: &str) -> Self {
        Self::Scalar(key.into())
    }
}

/// Defines a new container. Its address is the muid of the change itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDef {
    pub behavior: Behavior,
}

/// Associates a key or position in a container with a value, a pointer or a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryChange {
    pub behavior: Behavior,
    /// Owning container; `None` is the global root.
    pub container: Option<Muid>,
    pub key: Option<ScalarKey>,
    pub describing: Option<Muid>,
    pub pair: Option<(Muid, Muid)>,
    pub pointee: Option<Muid>,
    /// Opaque value payload.
    pub value: Option<Bytes>,
    pub deletion: bool,
    /// Explicit position for ordered containers; defaults to the bundle timestamp.
    pub effective: Option<Timestamp>,
}

impl EntryChange {
    /// Start an entry for `container` with the given behavior.
    pub fn new(behavior: Behavior, container: Muid) -> Self {
        Self {
            behavior,
            container: (container != Muid::ROOT).then_some(container),
            key: None,
            describing: None,
            pair: None,
            pointee: None,
            value: None,
            deletion: false,
            effective: None,
        }
    }

    pub fn key(mut self, key: impl Into<ScalarKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn describing(mut self, describing: Muid) -> Self {
        self.describing = Some(describing);
        self
    }

    pub fn pair(mut self, left: Muid, right: Muid) -> Self {
        self.pair = Some((left, right));
        self
    }

    pub fn pointee(mut self, pointee: Muid) -> Self {
        self.pointee = Some(pointee);
        self
    }

    pub fn value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn deletion(mut self) -> Self {
        self.deletion = true;
        self
    }

    pub fn effective(mut self, position: Timestamp) -> Self {
        self.effective = Some(position);
        self
    }

    /// Check that the key fields match what the behavior requires.
    pub fn validate(&self) -> Result<(), CoreError> {
        let missing = match self.behavior {
            Behavior::Directory | Behavior::KeySet => self.key.is_none(),
            Behavior::Property | Behavior::Group => self.describing.is_none(),
            Behavior::PairSet | Behavior::PairMap | Behavior::EdgeType => self.pair.is_none(),
            Behavior::Box | Behavior::Vertex | Behavior::Sequence => false,
        };
        if missing {
            return Err(CoreError::MalformedBundle(format!(
                "{:?} entry is missing its key",
                self.behavior
            )));
        }
        if self.deletion && (self.value.is_some() || self.pointee.is_some()) {
            return Err(CoreError::MalformedBundle(
                "deletion entries carry neither value nor pointee".into(),
            ));
        }
        Ok(())
    }

    /// The owning container with relative fields resolved.
    pub fn container_id(&self, timestamp: Timestamp, medallion: Medallion) -> Muid {
        self.container
            .map(|c| c.resolve(timestamp, medallion))
            .unwrap_or(Muid::ROOT)
    }

    /// Derive the storage key for this entry inside a bundle at `timestamp`.
    pub fn storage_key(&self, timestamp: Timestamp, medallion: Medallion) -> Result<StorageKey, CoreError> {
        self.validate()?;
        let key = match self.behavior {
            Behavior::Directory | Behavior::KeySet => {
                StorageKey::Scalar(self.key.clone().unwrap_or(ScalarKey::Integer(0)))
            }
            Behavior::Sequence | Behavior::EdgeType => {
                StorageKey::Position(self.effective.unwrap_or(timestamp))
            }
            Behavior::Box | Behavior::Vertex => StorageKey::Unit,
            Behavior::Property | Behavior::Group => StorageKey::Describing(
                self.describing
                    .unwrap_or(Muid::ROOT)
                    .resolve(timestamp, medallion),
            ),
            Behavior::PairSet | Behavior::PairMap => {
                let (left, right) = self.resolved_pair(timestamp, medallion).unwrap_or_default();
                StorageKey::Pair(left, right)
            }
        };
        Ok(key)
    }

    /// The pair with relative fields resolved.
    pub fn resolved_pair(&self, timestamp: Timestamp, medallion: Medallion) -> Option<(Muid, Muid)> {
        self.pair.map(|(left, right)| {
            (
                left.resolve(timestamp, medallion),
                right.resolve(timestamp, medallion),
            )
        })
    }
}

/// Relocates or removes a previously placed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementChange {
    pub container: Option<Muid>,
    pub entry: Muid,
    /// New position; zero removes the entry without placing it again.
    pub dest: Timestamp,
    pub purge: bool,
}

/// Marks every current entry in a container as removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearanceChange {
    pub container: Muid,
    pub purge: bool,
}

/// One change within a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    Container(ContainerDef),
    Entry(EntryChange),
    Movement(MovementChange),
    Clearance(ClearanceChange),
}

impl Change {
    /// Wire discriminator.
    pub fn kind(&self) -> u8 {
        match self {
            Change::Container(_) => 1,
            Change::Entry(_) => 2,
            Change::Movement(_) => 3,
            Change::Clearance(_) => 4,
        }
    }

    /// Structural checks that do not depend on store state.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Change::Entry(entry) => entry.validate(),
            Change::Movement(movement) if movement.entry == Muid::ROOT => Err(
                CoreError::MalformedBundle("movement must name an entry".into()),
            ),
            _ => Ok(()),
        }
    }

    /// The container whose contents this change affects, if any.
    ///
    /// Only entries and clearances count; movements are attributed to the
    /// container of the moved entry by the store.
    pub fn touched_container(&self, timestamp: Timestamp, medallion: Medallion) -> Option<Muid> {
        match self {
            Change::Entry(entry) => Some(entry.container_id(timestamp, medallion)),
            Change::Clearance(clearance) => Some(clearance.container.resolve(timestamp, medallion)),
            Change::Container(_) | Change::Movement(_) => None,
        }
    }
}
