//! # Gink Core
//!
//! Primitives for Gink: addresses, changes, bundles and chain tracking.
//!
//! This crate does no storage and no networking. It defines what a bundle
//! is, how it is encoded, and how a replica keeps track of which bundles it
//! has seen.
//!
//! ## Key Types
//!
//! - [`Muid`] - Global address of a change
//! - [`BundleInfo`] - Metadata of a sealed bundle and its place on a chain
//! - [`Change`] - One container definition, entry, movement or clearance
//! - [`Bundler`] - Accumulates changes and seals them into a [`Bundle`]
//! - [`ChainTracker`] - Latest bundle seen per chain, with async waiters
//!
//! ## Canonicalization
//!
//! Bundles are encoded using deterministic CBOR. See [`codec`] module.

pub mod bundle;
pub mod bundler;
pub mod change;
pub mod codec;
pub mod entry;
pub mod error;
pub mod info;
pub mod muid;
pub mod tracker;

pub use bundle::Bundle;
pub use bundler::{Bundler, PendingMuid};
pub use change::{
    Behavior, Change, ClearanceChange, ContainerDef, EntryChange, MovementChange, ScalarKey,
    StorageKey,
};
pub use codec::{decode_bundle, encode_bundle};
pub use entry::{AsOf, ClearanceRecord, Entry, Removal};
pub use error::{CoreError, Result};
pub use info::{ActorId, BundleInfo, ChainKey, ChainStart, Medallion, Timestamp};
pub use muid::Muid;
pub use tracker::ChainTracker;
