//! Proptest generators for property-based testing.

use bytes::Bytes;
use proptest::prelude::*;

use gink_core::{
    Behavior, Change, ClearanceChange, ContainerDef, EntryChange, Medallion, MovementChange, Muid,
    ScalarKey, Timestamp,
};

/// Generate a medallion in the range a database mints from.
pub fn medallion() -> impl Strategy<Value = Medallion> {
    (1i64 << 40)..(1i64 << 41)
}

/// Generate a reasonable timestamp in microseconds.
pub fn timestamp() -> impl Strategy<Value = Timestamp> {
    1i64..=4_000_000_000_000_000
}

/// Generate a Behavior.
pub fn behavior() -> impl Strategy<Value = Behavior> {
    (1u8..=10).prop_map(|n| Behavior::from_u8(n).unwrap_or(Behavior::Box))
}

/// Generate a scalar key.
pub fn scalar_key() -> impl Strategy<Value = ScalarKey> {
    prop_oneof![
        any::<i64>().prop_map(ScalarKey::Integer),
        "[a-z]{1,8}".prop_map(ScalarKey::Text),
        prop::collection::vec(any::<u8>(), 0..8).prop_map(ScalarKey::Bytes),
    ]
}

/// Generate an absolute or bundle-relative muid.
pub fn muid() -> impl Strategy<Value = Muid> {
    prop_oneof![
        (timestamp(), medallion(), 1u32..100).prop_map(|(t, m, o)| Muid::new(t, m, o)),
        (1u32..100).prop_map(|o| Muid::new(0, 0, o)),
    ]
}

/// Generate value payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..=max_len).prop_map(Bytes::from)
}

/// Generate a structurally valid change.
pub fn change() -> impl Strategy<Value = Change> {
    prop_oneof![
        behavior().prop_map(|behavior| Change::Container(ContainerDef { behavior })),
        (muid(), scalar_key(), payload(32)).prop_map(|(container, key, value)| {
            Change::Entry(EntryChange::new(Behavior::Directory, container).key(key).value(value))
        }),
        (muid(), payload(32)).prop_map(|(container, value)| {
            Change::Entry(EntryChange::new(Behavior::Sequence, container).value(value))
        }),
        (muid(), muid(), muid()).prop_map(|(container, left, right)| {
            Change::Entry(EntryChange::new(Behavior::PairSet, container).pair(left, right))
        }),
        (muid(), muid(), 0i64..1_000_000, any::<bool>()).prop_map(|(container, entry, dest, purge)| {
            Change::Movement(MovementChange {
                container: Some(container),
                entry,
                dest,
                purge,
            })
        }),
        (muid(), any::<bool>())
            .prop_map(|(container, purge)| Change::Clearance(ClearanceChange { container, purge })),
    ]
}

/// One write to a directory: a value or, when `value` is `None`, a delete.
#[derive(Debug, Clone)]
pub struct DirectoryOp {
    pub key: u8,
    pub value: Option<Vec<u8>>,
}

/// A sequence of directory writes over a small key space.
pub fn directory_ops(max_len: usize) -> impl Strategy<Value = Vec<DirectoryOp>> {
    let op = (0u8..4, prop::option::weighted(0.8, prop::collection::vec(any::<u8>(), 1..8)))
        .prop_map(|(key, value)| DirectoryOp { key, value });
    prop::collection::vec(op, 1..=max_len)
}
