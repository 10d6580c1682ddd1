//! Bundler: accumulates changes and seals them into a bundle.
//!
//! ## Overview
//!
//! A bundler collects changes until it is sealed with a [`BundleInfo`].
//! Sealing encodes the bundle once; after that the bundler is read-only.
//!
//! Changes are addressed before the bundle knows its timestamp or medallion.
//! [`Bundler::add_change`] hands back a [`PendingMuid`] whose offset is known
//! immediately and whose full address becomes available once sealed.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;

use crate::bundle::Bundle;
use crate::change::{
    Behavior, Change, ClearanceChange, ContainerDef, EntryChange, MovementChange, ScalarKey,
};
use crate::error::{CoreError, Result};
use crate::info::{BundleInfo, Medallion, Timestamp};
use crate::muid::Muid;

/// Address of a change inside a bundle that may not be sealed yet.
#[derive(Debug, Clone)]
pub struct PendingMuid {
    offset: u32,
    slot: Arc<OnceLock<BundleInfo>>,
}

impl PendingMuid {
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Address usable by later changes in the same bundle.
    pub fn relative(&self) -> Muid {
        Muid::new(0, 0, self.offset)
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        self.slot.get().map(|info| info.timestamp)
    }

    pub fn medallion(&self) -> Option<Medallion> {
        self.slot.get().map(|info| info.medallion)
    }

    /// The full muid, once the bundle has been sealed.
    pub fn resolve(&self) -> Option<Muid> {
        self.slot
            .get()
            .map(|info| Muid::new(info.timestamp, info.medallion, self.offset))
    }
}

/// Builds a bundle one change at a time.
#[derive(Debug, Default)]
pub struct Bundler {
    changes: Vec<Change>,
    comment: Option<String>,
    medallion: Option<Medallion>,
    slot: Arc<OnceLock<BundleInfo>>,
    sealed: Option<Bundle>,
}

impl Bundler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a comment that will be written into the bundle.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Pre-assign the medallion this bundle must be sealed under.
    pub fn with_medallion(mut self, medallion: Medallion) -> Self {
        self.medallion = Some(medallion);
        self
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.is_some()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn set_comment(&mut self, comment: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        self.comment = Some(comment.into());
        Ok(())
    }

    /// Append a change. Offsets start at 1.
    pub fn add_change(&mut self, change: Change) -> Result<PendingMuid> {
        self.ensure_open()?;
        change.validate()?;
        self.changes.push(change);
        Ok(PendingMuid {
            offset: self.changes.len() as u32,
            slot: Arc::clone(&self.slot),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Convenience builders
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_container(&mut self, behavior: Behavior) -> Result<PendingMuid> {
        self.add_change(Change::Container(ContainerDef { behavior }))
    }

    /// Set `key` in a directory.
    pub fn set(
        &mut self,
        directory: Muid,
        key: impl Into<ScalarKey>,
        value: impl Into<Bytes>,
    ) -> Result<PendingMuid> {
        self.add_change(Change::Entry(
            EntryChange::new(Behavior::Directory, directory)
                .key(key)
                .value(value),
        ))
    }

    /// Write a tombstone for `key` in a directory.
    pub fn delete(&mut self, directory: Muid, key: impl Into<ScalarKey>) -> Result<PendingMuid> {
        self.add_change(Change::Entry(
            EntryChange::new(Behavior::Directory, directory)
                .key(key)
                .deletion(),
        ))
    }

    /// Append a value to a sequence at the bundle's timestamp.
    pub fn push(&mut self, sequence: Muid, value: impl Into<Bytes>) -> Result<PendingMuid> {
        self.add_change(Change::Entry(
            EntryChange::new(Behavior::Sequence, sequence).value(value),
        ))
    }

    /// Insert a value into a sequence at an explicit position.
    pub fn push_at(
        &mut self,
        sequence: Muid,
        position: Timestamp,
        value: impl Into<Bytes>,
    ) -> Result<PendingMuid> {
        self.add_change(Change::Entry(
            EntryChange::new(Behavior::Sequence, sequence)
                .value(value)
                .effective(position),
        ))
    }

    /// Set the value a property holds for `describing`.
    pub fn set_property(
        &mut self,
        property: Muid,
        describing: Muid,
        value: impl Into<Bytes>,
    ) -> Result<PendingMuid> {
        self.add_change(Change::Entry(
            EntryChange::new(Behavior::Property, property)
                .describing(describing)
                .value(value),
        ))
    }

    /// Set the value stored for `(left, right)` in a pair map.
    pub fn set_pair(
        &mut self,
        pair_map: Muid,
        left: Muid,
        right: Muid,
        value: impl Into<Bytes>,
    ) -> Result<PendingMuid> {
        self.add_change(Change::Entry(
            EntryChange::new(Behavior::PairMap, pair_map)
                .pair(left, right)
                .value(value),
        ))
    }

    /// Move an entry of an ordered container to a new position.
    pub fn move_entry(&mut self, container: Muid, entry: Muid, dest: Timestamp) -> Result<PendingMuid> {
        self.add_change(Change::Movement(MovementChange {
            container: (container != Muid::ROOT).then_some(container),
            entry,
            dest,
            purge: false,
        }))
    }

    /// Remove an entry from an ordered container.
    pub fn remove_entry(&mut self, container: Muid, entry: Muid, purge: bool) -> Result<PendingMuid> {
        self.add_change(Change::Movement(MovementChange {
            container: (container != Muid::ROOT).then_some(container),
            entry,
            dest: 0,
            purge,
        }))
    }

    /// Remove everything currently in a container.
    pub fn clear(&mut self, container: Muid, purge: bool) -> Result<PendingMuid> {
        self.add_change(Change::Clearance(ClearanceChange { container, purge }))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sealing
    // ─────────────────────────────────────────────────────────────────────────

    /// Seal the bundle with the given metadata.
    ///
    /// The bundler's own comment is used when `info` carries none.
    pub fn seal(&mut self, mut info: BundleInfo) -> Result<&Bundle> {
        self.ensure_open()?;
        if let Some(expected) = self.medallion {
            if expected != info.medallion {
                return Err(CoreError::MedallionMismatch {
                    expected,
                    got: info.medallion,
                });
            }
        }
        if info.comment.is_none() {
            info.comment = self.comment.clone();
        }

        let bundle = Bundle::from_parts(info.clone(), self.changes.clone())?;
        let _ = self.slot.set(info);
        let bundle: &Bundle = self.sealed.insert(bundle);
        Ok(bundle)
    }

    pub fn bundle(&self) -> Result<&Bundle> {
        self.sealed.as_ref().ok_or(CoreError::NotSealed)
    }

    pub fn info(&self) -> Result<&BundleInfo> {
        self.bundle().map(Bundle::info)
    }

    pub fn bytes(&self) -> Result<&Bytes> {
        self.bundle().map(Bundle::bytes)
    }

    pub fn timestamp(&self) -> Result<Timestamp> {
        self.info().map(|info| info.timestamp)
    }

    /// The sealed medallion, or the pre-assigned one before sealing.
    pub fn medallion(&self) -> Result<Medallion> {
        match (&self.sealed, self.medallion) {
            (Some(bundle), _) => Ok(bundle.info().medallion),
            (None, Some(medallion)) => Ok(medallion),
            (None, None) => Err(CoreError::NotSealed),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.sealed.is_some() {
            Err(CoreError::AlreadySealed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_muid_resolves_after_seal() {
        let mut bundler = Bundler::new();
        let dir = bundler.create_container(Behavior::Directory).unwrap();
        let entry = bundler.set(dir.relative(), "a", b"1".to_vec()).unwrap();

        assert_eq!(dir.offset(), 1);
        assert_eq!(entry.offset(), 2);
        assert!(entry.resolve().is_none());
        assert!(entry.timestamp().is_none());

        bundler.seal(BundleInfo::chain_start(9, 1_000)).unwrap();
        assert_eq!(dir.resolve(), Some(Muid::new(1_000, 9, 1)));
        assert_eq!(entry.medallion(), Some(9));
        assert_eq!(entry.timestamp(), Some(1_000));
    }

    #[test]
    fn test_seal_twice_fails() {
        let mut bundler = Bundler::new();
        bundler.seal(BundleInfo::chain_start(9, 1_000)).unwrap();
        assert!(matches!(
            bundler.seal(BundleInfo::chain_start(9, 2_000)),
            Err(CoreError::AlreadySealed)
        ));
        assert!(matches!(
            bundler.push(Muid::ROOT, b"x".to_vec()),
            Err(CoreError::AlreadySealed)
        ));
        assert!(bundler.set_comment("late").is_err());
    }

    #[test]
    fn test_accessors_before_seal() {
        let bundler = Bundler::new();
        assert!(matches!(bundler.info(), Err(CoreError::NotSealed)));
        assert!(matches!(bundler.bytes(), Err(CoreError::NotSealed)));
        assert!(matches!(bundler.timestamp(), Err(CoreError::NotSealed)));
        assert!(matches!(bundler.medallion(), Err(CoreError::NotSealed)));

        let preassigned = Bundler::new().with_medallion(33);
        assert_eq!(preassigned.medallion().unwrap(), 33);
    }

    #[test]
    fn test_medallion_mismatch() {
        let mut bundler = Bundler::new().with_medallion(33);
        let err = bundler.seal(BundleInfo::chain_start(34, 1_000)).unwrap_err();
        assert!(matches!(
            err,
            CoreError::MedallionMismatch {
                expected: 33,
                got: 34
            }
        ));
        assert!(!bundler.is_sealed());
    }

    #[test]
    fn test_comment_carried_into_bundle() {
        let mut bundler = Bundler::new().with_comment("hello");
        bundler.set_comment("replaced").unwrap();
        let bundle = bundler.seal(BundleInfo::chain_start(9, 1_000)).unwrap();
        assert_eq!(bundle.info().comment.as_deref(), Some("replaced"));

        let decoded = Bundle::decode(bundle.bytes().clone()).unwrap();
        assert_eq!(decoded.info().comment.as_deref(), Some("replaced"));
    }

    #[test]
    fn test_invalid_change_rejected() {
        let mut bundler = Bundler::new();
        let missing_key = EntryChange::new(Behavior::Directory, Muid::ROOT);
        assert!(bundler.add_change(Change::Entry(missing_key)).is_err());
        assert!(bundler.is_empty());
    }
}
