//! # Gink Sync
//!
//! Gossip replication between Gink replicas.
//!
//! ## Overview
//!
//! Peers exchange greetings (each side's [`gink_core::ChainTracker`]), then
//! push every bundle the other side is missing in timestamp order. Each
//! [`Peer`] keeps its own copy of what the remote side has, so a bundle is
//! sent to a given peer at most once and never ahead of its predecessor.
//!
//! ## Key Properties
//!
//! - **No resend**: a bundle the peer is known to have is skipped
//! - **No gaps**: a bundle is sent only if it extends what the peer has
//! - **Handshake deadline**: a peer that never greets fails its `ready` wait
//!
//! ## Message Flow
//!
//! ```text
//! Replica A                           Replica B
//!   |-------- Greeting --------------->|
//!   |<------- Greeting ----------------|
//!   |-------- Bundle ----------------->|
//!   |<------- Ack ---------------------|
//!   |<------- Bundle ------------------|
//!   |-------- Ack -------------------->|
//! ```

pub mod convergence;
pub mod error;
pub mod messages;
pub mod peer;
pub mod transport;

pub use convergence::{compute_state_hash, verify_convergence, ConvergenceResult, StateHash};
pub use error::{Result, SyncError};
pub use messages::{decode_auth_token, subprotocols, PeerId, SyncMessage, PROTOCOL};
pub use peer::{Peer, PeerState, DEFAULT_HANDSHAKE_TIMEOUT};
pub use transport::{memory::MemoryNetwork, memory::MemoryTransport, Transport};
