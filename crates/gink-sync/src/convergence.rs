//! Convergence verification for gossip.
//!
//! Two replicas that hold the same bundles answer every query the same way,
//! so comparing a hash over their bundle sets is enough to tell whether
//! gossip has finished.

use std::fmt;

use gink_core::{ChainStart, Medallion, Timestamp};
use gink_store::Store;

use crate::error::Result;

const DOMAIN: &[u8] = b"gink-state-v0:";

/// Blake3 digest over a replica's bundle set.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateHash(pub [u8; 32]);

impl fmt::Debug for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateHash({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Compute a deterministic state hash for a store.
///
/// Bundles come back ordered by `(timestamp, medallion)`, which does not
/// depend on arrival order. Each bundle contributes its length and bytes.
pub async fn compute_state_hash<S: Store + ?Sized>(store: &S) -> Result<StateHash> {
    let bundles = store.get_bundles().await?;

    let mut hasher = blake3::Hasher::new();
    hasher.update(DOMAIN);
    for bundle in &bundles {
        let bytes = bundle.bytes();
        hasher.update(&(bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    }
    Ok(StateHash(*hasher.finalize().as_bytes()))
}

/// Result of convergence verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceResult {
    /// Both replicas hold the same bundles.
    Converged,
    /// Chain progress differs.
    ChainsDiffer {
        local: Vec<(Medallion, ChainStart, Timestamp)>,
        remote: Vec<(Medallion, ChainStart, Timestamp)>,
    },
    /// Chains agree but bundle contents do not.
    HashMismatch { local: StateHash, remote: StateHash },
}

impl ConvergenceResult {
    /// Check if replicas have converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceResult::Converged)
    }
}

/// Compare two stores' chain progress and state hashes.
pub async fn verify_convergence<A, B>(local: &A, remote: &B) -> Result<ConvergenceResult>
where
    A: Store + ?Sized,
    B: Store + ?Sized,
{
    let local_chains = local.get_chain_tracker().await?.greeting_entries();
    let remote_chains = remote.get_chain_tracker().await?.greeting_entries();
    if local_chains != remote_chains {
        return Ok(ConvergenceResult::ChainsDiffer {
            local: local_chains,
            remote: remote_chains,
        });
    }

    let local_hash = compute_state_hash(local).await?;
    let remote_hash = compute_state_hash(remote).await?;
    if local_hash != remote_hash {
        return Ok(ConvergenceResult::HashMismatch {
            local: local_hash,
            remote: remote_hash,
        });
    }

    Ok(ConvergenceResult::Converged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gink_core::{Bundler, Muid};
    use gink_store::MemoryStore;
    use gink_testkit::fixtures::multi_chain_fixtures;

    async fn two_chain_bundles() -> Vec<gink_core::Bundle> {
        let mut bundles = Vec::new();
        for (i, chain) in multi_chain_fixtures(2, 5).iter_mut().enumerate() {
            for round in 0..2u8 {
                let mut bundler = Bundler::new();
                bundler.set(Muid::ROOT, i as i64, vec![round]).unwrap();
                bundles.push(chain.seal(bundler).unwrap());
            }
        }
        bundles
    }

    #[tokio::test]
    async fn test_converged_regardless_of_order() {
        let bundles = two_chain_bundles().await;
        let a = MemoryStore::new();
        let b = MemoryStore::new();
        for bundle in &bundles {
            a.add_decoded(bundle).await.unwrap();
        }
        for bundle in bundles.iter().skip(2).chain(bundles.iter().take(2)) {
            b.add_decoded(bundle).await.unwrap();
        }

        assert_eq!(
            compute_state_hash(&a).await.unwrap(),
            compute_state_hash(&b).await.unwrap()
        );
        assert!(verify_convergence(&a, &b).await.unwrap().is_converged());
    }

    #[tokio::test]
    async fn test_detects_missing_chain() {
        let bundles = two_chain_bundles().await;
        let a = MemoryStore::new();
        let b = MemoryStore::new();
        for bundle in &bundles {
            a.add_decoded(bundle).await.unwrap();
        }
        for bundle in bundles.iter().take(2) {
            b.add_decoded(bundle).await.unwrap();
        }

        let result = verify_convergence(&a, &b).await.unwrap();
        assert!(matches!(result, ConvergenceResult::ChainsDiffer { .. }));
        assert_ne!(
            compute_state_hash(&a).await.unwrap(),
            compute_state_hash(&MemoryStore::new()).await.unwrap()
        );
    }
}
