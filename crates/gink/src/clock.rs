//! Time sources.
//!
//! Bundle timestamps are microseconds since the Unix epoch and must strictly
//! increase along a chain even if the wall clock stalls or steps back.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use gink_core::Timestamp;

/// Step taken when the clock has not moved past the last issued timestamp.
pub const REPEAT_STEP: Timestamp = 20;

/// A source of wall-clock time in microseconds.
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> Timestamp;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as Timestamp)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self(AtomicI64::new(start))
    }

    pub fn set(&self, now: Timestamp) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Timestamp) {
        self.0.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> Timestamp {
        self.0.load(Ordering::SeqCst)
    }
}

/// Issues timestamps that never repeat and never go backwards.
pub struct TimestampGenerator {
    clock: Arc<dyn Clock>,
    last: AtomicI64,
}

impl TimestampGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: AtomicI64::new(0),
        }
    }

    /// Next timestamp: the clock reading, or the last issued plus
    /// [`REPEAT_STEP`] when the clock has not moved past it.
    pub fn next(&self) -> Timestamp {
        self.next_after(Timestamp::MIN)
    }

    /// Next timestamp that is also strictly greater than `floor`.
    pub fn next_after(&self, floor: Timestamp) -> Timestamp {
        let now = self.clock.now_micros();
        let advance = |last: Timestamp| {
            let candidate = now.max(floor.saturating_add(1));
            if last >= candidate {
                last + REPEAT_STEP
            } else {
                candidate
            }
        };
        let previous = match self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(advance(last)))
        {
            Ok(previous) | Err(previous) => previous,
        };
        advance(previous)
    }
}

impl std::fmt::Debug for TimestampGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimestampGenerator")
            .field("last", &self.last.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
