//! Chain tracking: how far along each chain a replica has seen.
//!
//! ## Overview
//!
//! A [`ChainTracker`] maps `(medallion, chain_start)` to the info of the
//! latest bundle seen on that chain. It is the "has map" exchanged in
//! greetings, and it answers "do we already have this bundle?" for both the
//! local database and each remote peer.
//!
//! Tasks can wait for a given `(medallion, timestamp)` to arrive. Waiters are
//! resolved from inside [`ChainTracker::mark_as_having`], so whoever owns the
//! tracker never has to poll.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::codec;
use crate::error::{CoreError, Result};
use crate::info::{BundleInfo, ChainKey, ChainStart, Medallion, Timestamp};

struct Waiter {
    medallion: Medallion,
    timestamp: Timestamp,
    tx: oneshot::Sender<()>,
}

/// Latest bundle seen per chain, plus tasks waiting for more.
#[derive(Default)]
pub struct ChainTracker {
    chains: BTreeMap<Medallion, BTreeMap<ChainStart, BundleInfo>>,
    waiters: Vec<Waiter>,
}

impl ChainTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tracker from a peer's greeting payload.
    pub fn from_greeting(bytes: &[u8]) -> Result<Self> {
        let mut tracker = Self::new();
        for (medallion, chain_start, seen_through) in codec::decode_greeting(bytes)? {
            tracker.chains.entry(medallion).or_default().insert(
                chain_start,
                BundleInfo {
                    timestamp: seen_through,
                    medallion,
                    chain_start,
                    prior_time: None,
                    comment: None,
                },
            );
        }
        Ok(tracker)
    }

    /// The greeting payload describing everything this tracker has seen.
    pub fn greeting_bytes(&self) -> Result<Vec<u8>> {
        codec::encode_greeting(&self.greeting_entries())
    }

    /// `(medallion, chain_start, seen_through)` for every chain, in order.
    pub fn greeting_entries(&self) -> Vec<(Medallion, ChainStart, Timestamp)> {
        self.chains
            .iter()
            .flat_map(|(medallion, starts)| {
                starts
                    .iter()
                    .map(move |(chain_start, info)| (*medallion, *chain_start, info.timestamp))
            })
            .collect()
    }

    /// Record that the bundle described by `info` has been seen.
    ///
    /// Returns `true` if this advanced the chain. With `check` set, a bundle
    /// that does not directly extend what has been seen is rejected with
    /// [`CoreError::InvalidExtension`] and nothing changes.
    pub fn mark_as_having(&mut self, info: &BundleInfo, check: bool) -> Result<bool> {
        let seen_through = self
            .get_seen_to(info.medallion, info.chain_start)
            .unwrap_or(0);
        if info.timestamp <= seen_through {
            return Ok(false);
        }

        if check {
            let orphan_start = info.timestamp != info.chain_start && info.prior_time.is_none();
            if orphan_start || info.prior_time.unwrap_or(0) != seen_through {
                return Err(CoreError::InvalidExtension {
                    medallion: info.medallion,
                    chain_start: info.chain_start,
                    timestamp: info.timestamp,
                    seen_through,
                });
            }
        }

        self.chains
            .entry(info.medallion)
            .or_default()
            .insert(info.chain_start, info.clone());
        self.notify_waiters(info);
        Ok(true)
    }

    fn notify_waiters(&mut self, info: &BundleInfo) {
        let waiters = std::mem::take(&mut self.waiters);
        for waiter in waiters {
            let reached = waiter.medallion == info.medallion
                && info.chain_start <= waiter.timestamp
                && waiter.timestamp <= info.timestamp;
            if reached {
                let _ = waiter.tx.send(());
            } else if !waiter.tx.is_closed() {
                self.waiters.push(waiter);
            }
        }
    }

    /// Wait until a bundle at or after `timestamp` on some chain of
    /// `medallion` covering that time has been seen.
    ///
    /// The returned future does not borrow the tracker.
    pub fn wait_till_has(
        &mut self,
        medallion: Medallion,
        timestamp: Timestamp,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let receiver = if self.has(medallion, timestamp) {
            None
        } else {
            let (tx, rx) = oneshot::channel();
            self.waiters.push(Waiter {
                medallion,
                timestamp,
                tx,
            });
            Some(rx)
        };

        async move {
            let Some(rx) = receiver else {
                return Ok(());
            };
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, rx).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(CoreError::WaitAbandoned),
                    Err(_) => Err(CoreError::Timeout {
                        medallion,
                        timestamp,
                    }),
                },
                None => rx.await.map_err(|_| CoreError::WaitAbandoned),
            }
        }
    }

    /// Whether any chain of `medallion` covers `timestamp`.
    pub fn has(&self, medallion: Medallion, timestamp: Timestamp) -> bool {
        self.chains.get(&medallion).is_some_and(|starts| {
            starts
                .range(..=timestamp)
                .any(|(_, info)| timestamp <= info.timestamp)
        })
    }

    pub fn get_bundle_info(&self, medallion: Medallion, chain_start: ChainStart) -> Option<&BundleInfo> {
        self.chains.get(&medallion)?.get(&chain_start)
    }

    pub fn get_seen_to(&self, medallion: Medallion, chain_start: ChainStart) -> Option<Timestamp> {
        self.get_bundle_info(medallion, chain_start)
            .map(|info| info.timestamp)
    }

    /// Chains known to the tracker, optionally restricted to one medallion.
    pub fn chains(&self, medallion: Option<Medallion>) -> Vec<ChainKey> {
        self.chains
            .iter()
            .filter(|(m, _)| medallion.map_or(true, |wanted| wanted == **m))
            .flat_map(|(m, starts)| starts.keys().map(move |cs| ChainKey::new(*m, *cs)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Number of tasks currently waiting.
    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }
}

impl Clone for ChainTracker {
    /// Clones the seen state; waiters stay with the original.
    fn clone(&self) -> Self {
        Self {
            chains: self.chains.clone(),
            waiters: Vec::new(),
        }
    }
}

impl PartialEq for ChainTracker {
    /// Trackers are equal when they have seen the same chains to the same point.
    fn eq(&self, other: &Self) -> bool {
        self.greeting_entries() == other.greeting_entries()
    }
}

impl Eq for ChainTracker {}

impl fmt::Debug for ChainTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainTracker")
            .field("chains", &self.greeting_entries())
            .field("waiters", &self.waiters.len())
            .finish()
    }
}
