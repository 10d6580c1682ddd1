//! # Gink Testkit
//!
//! Testing utilities for Gink.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: a [`ChainFixture`] that seals bundles onto one chain with
//!   correct timestamps and prior links
//! - **Generators**: Proptest strategies for property-based testing
//!
//! ## Test Fixtures
//!
//! ```rust
//! use gink_core::{Behavior, Bundler};
//! use gink_testkit::fixtures::ChainFixture;
//!
//! let mut chain = ChainFixture::new(1 << 40, 1_000);
//! let mut bundler = Bundler::new();
//! bundler.create_container(Behavior::Directory).unwrap();
//! let first = chain.seal(bundler).unwrap();
//! assert!(first.info().is_chain_start());
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use gink_testkit::generators::directory_ops;
//!
//! proptest! {
//!     #[test]
//!     fn last_write_wins(ops in directory_ops(20)) {
//!         // ...
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{multi_chain_fixtures, ChainFixture};
pub use generators::{directory_ops, DirectoryOp};
