//! # Gink Store
//!
//! Bundle storage and point-in-time indexes for Gink.
//!
//! ## Overview
//!
//! Every replica keeps the bundles it has accepted and an index over the
//! changes they carry. The [`Store`] trait hides how; the database only
//! talks to the trait. [`MemoryStore`] keeps everything in memory and
//! [`LogBackedStore`] appends accepted bundles to a SQLite log and replays
//! that log on open.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`Index`] - Synchronous point-in-time index shared by both stores
//! - [`MemoryStore`] - In-memory storage
//! - [`LogBackedStore`] - SQLite append log in front of the index
//! - [`ClaimedChain`] - A chain this replica's owner may extend
//!
//! ## Usage
//!
//! ```rust,no_run
//! use gink_store::{LogBackedStore, Store, StoreExt};
//! use gink_core::{AsOf, Muid};
//!
//! async fn example() {
//!     let store = LogBackedStore::open("gink.db").unwrap();
//!     let value = store
//!         .get_value(Muid::ROOT, &"greeting".into(), AsOf::Latest)
//!         .await
//!         .unwrap();
//!     println!("{value:?}");
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Chain rules first**: a bundle is checked against the chain on record
//!   before anything is written
//! - **Re-delivery is harmless**: bundles already covered return `false`
//! - **Replay**: the log is the source of truth, the index is rebuilt from it

pub mod error;
pub mod index;
pub mod log;
pub mod memory;
pub mod migration;
pub mod traits;

pub use error::{Result, StoreError};
pub use index::Index;
pub use log::LogBackedStore;
pub use memory::MemoryStore;
pub use traits::{ClaimedChain, Store, StoreExt};
