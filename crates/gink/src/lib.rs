//! # Gink
//!
//! A peer-to-peer, eventually consistent database built from append-only
//! chains of immutable bundles.
//!
//! ## Overview
//!
//! - **Bundles**: Batches of changes sealed onto a writer's chain
//! - **Chains**: One medallion, one start time, strictly increasing timestamps
//! - **Store**: Point-in-time index over every accepted bundle
//! - **Gossip**: Peers greet with what they have and receive what they lack
//!
//! ## Usage
//!
//! ```rust,no_run
//! use gink::{Database, DatabaseConfig};
//! use gink::core::{Bundler, Muid};
//! use gink::store::MemoryStore;
//!
//! async fn example() {
//!     let db = Database::new(MemoryStore::new(), DatabaseConfig::default())
//!         .await
//!         .unwrap();
//!
//!     let mut bundler = Bundler::new();
//!     bundler.set(Muid::ROOT, "greeting", b"hello".to_vec()).unwrap();
//!     let info = db.add_bundler(&mut bundler).await.unwrap();
//!     println!("committed {info}");
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `gink::core` - Muids, changes, bundles, chain tracking
//! - `gink::store` - Store trait, in-memory and log-backed stores
//! - `gink::sync` - Peers, wire messages, transports

pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod identity;
pub mod listener;

// Re-export component crates
pub use gink_core as core;
pub use gink_store as store;
pub use gink_sync as sync;

pub use clock::{Clock, ManualClock, SystemClock, TimestampGenerator};
pub use config::DatabaseConfig;
pub use database::Database;
pub use error::{DatabaseError, Result};
pub use identity::{LivenessOracle, MedallionSource, ProcessLiveness, RandomMedallions};
pub use listener::{BundleListener, ListenerId};

pub use gink_core::{AsOf, Bundle, BundleInfo, Bundler, ChainTracker, Muid};
