//! Test fixtures and helpers.
//!
//! Common setup code for tests that need well-formed chains.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gink_core::{Bundle, BundleInfo, Bundler, ChainStart, Medallion, Result, Timestamp};

/// Smallest medallion a database would mint.
pub const MEDALLION_FLOOR: Medallion = 1 << 40;

/// Spacing between bundles sealed with [`ChainFixture::seal`].
pub const DEFAULT_STEP: Timestamp = 10;

/// Seals bundles onto a single chain.
#[derive(Debug, Clone)]
pub struct ChainFixture {
    pub medallion: Medallion,
    identity: Option<String>,
    last: Option<BundleInfo>,
    next_timestamp: Timestamp,
}

impl ChainFixture {
    /// A fixture whose first bundle will be sealed at `start`.
    pub fn new(medallion: Medallion, start: Timestamp) -> Self {
        Self {
            medallion,
            identity: None,
            last: None,
            next_timestamp: start,
        }
    }

    /// Comment written on the chain-start bundle.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Seal at the next timestamp.
    pub fn seal(&mut self, bundler: Bundler) -> Result<Bundle> {
        self.seal_at(self.next_timestamp, bundler)
    }

    /// Seal at an explicit timestamp.
    ///
    /// The first bundle starts the chain; every later one extends the last.
    pub fn seal_at(&mut self, timestamp: Timestamp, mut bundler: Bundler) -> Result<Bundle> {
        let info = match &self.last {
            None => {
                let info = BundleInfo::chain_start(self.medallion, timestamp);
                match &self.identity {
                    Some(identity) => info.with_comment(identity.clone()),
                    None => info,
                }
            }
            Some(prev) => prev.extend(timestamp),
        };
        let bundle = bundler.seal(info)?.clone();
        self.last = Some(bundle.info().clone());
        self.next_timestamp = timestamp + DEFAULT_STEP;
        Ok(bundle)
    }

    /// Seal an empty bundle.
    pub fn empty(&mut self) -> Result<Bundle> {
        self.seal(Bundler::new())
    }

    /// A run of `count` empty bundles.
    pub fn empties(&mut self, count: usize) -> Result<Vec<Bundle>> {
        (0..count).map(|_| self.empty()).collect()
    }

    pub fn last(&self) -> Option<&BundleInfo> {
        self.last.as_ref()
    }

    pub fn chain_start(&self) -> Option<ChainStart> {
        self.last.as_ref().map(|info| info.chain_start)
    }

    pub fn next_timestamp(&self) -> Timestamp {
        self.next_timestamp
    }
}

/// Fixtures for several independent writers with distinct medallions.
///
/// Deterministic for a given `seed`. Chain `i` starts at `1_000 * (i + 1)`.
pub fn multi_chain_fixtures(count: usize, seed: u64) -> Vec<ChainFixture> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut medallions: Vec<Medallion> = Vec::with_capacity(count);
    while medallions.len() < count {
        let candidate = rng.gen_range(MEDALLION_FLOOR..2 * MEDALLION_FLOOR);
        if !medallions.contains(&candidate) {
            medallions.push(candidate);
        }
    }
    medallions
        .into_iter()
        .enumerate()
        .map(|(i, medallion)| ChainFixture::new(medallion, 1_000 * (i as Timestamp + 1)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gink_core::{Behavior, ChainTracker};

    #[test]
    fn test_fixture_chain() {
        let mut chain = ChainFixture::new(MEDALLION_FLOOR, 500).with_identity("alice");
        let mut bundler = Bundler::new();
        bundler.create_container(Behavior::Box).unwrap();
        let first = chain.seal(bundler).unwrap();
        let second = chain.empty().unwrap();
        let third = chain.seal_at(900, Bundler::new()).unwrap();

        assert!(first.info().is_chain_start());
        assert_eq!(first.info().comment.as_deref(), Some("alice"));
        assert_eq!(second.info().prior_time, Some(500));
        assert_eq!(second.info().timestamp, 510);
        assert_eq!(third.info().prior_time, Some(510));
        assert_eq!(chain.next_timestamp(), 910);

        let mut tracker = ChainTracker::new();
        for bundle in [&first, &second, &third] {
            assert!(tracker.mark_as_having(bundle.info(), true).unwrap());
        }
    }

    #[test]
    fn test_multi_chain() {
        let chains = multi_chain_fixtures(3, 7);
        assert_ne!(chains[0].medallion, chains[1].medallion);
        assert_ne!(chains[1].medallion, chains[2].medallion);
        assert_ne!(chains[0].medallion, chains[2].medallion);

        let again = multi_chain_fixtures(3, 7);
        assert_eq!(chains[0].medallion, again[0].medallion);
    }
}
