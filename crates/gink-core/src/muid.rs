//! Muid: the global address of a change.
//!
//! A muid names a change by the bundle that carries it (timestamp and
//! medallion) plus its 1-based offset within that bundle. Inside a bundle a
//! zero timestamp or medallion means "the enclosing bundle" and is resolved
//! once the bundle is sealed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::change::Behavior;
use crate::error::CoreError;
use crate::info::{Medallion, Timestamp};

const TIMESTAMP_HEX_DIGITS: usize = 13;
const MEDALLION_HEX_DIGITS: usize = 11;
const OFFSET_HEX_DIGITS: usize = 8;

/// Address of a change: `(timestamp, medallion, offset)`.
///
/// The derived ordering compares timestamp first, then medallion, then
/// offset. Two chains that write at the same microsecond are therefore
/// ordered by medallion, which keeps replicas deterministic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Muid {
    pub timestamp: Timestamp,
    pub medallion: Medallion,
    pub offset: u32,
}

impl Muid {
    /// The global root container.
    pub const ROOT: Self = Self::new(0, 0, 0);

    /// Smallest possible muid; useful as a range bound.
    pub const MIN: Self = Self::new(i64::MIN, i64::MIN, 0);

    /// Largest possible muid; useful as a range bound.
    pub const MAX: Self = Self::new(i64::MAX, i64::MAX, u32::MAX);

    pub const fn new(timestamp: Timestamp, medallion: Medallion, offset: u32) -> Self {
        Self {
            timestamp,
            medallion,
            offset,
        }
    }

    /// The well-known global container for a behavior.
    pub const fn global(behavior: Behavior) -> Self {
        Self::new(-1, -1, behavior as u32)
    }

    /// Whether this muid is relative to an enclosing bundle.
    pub fn is_relative(&self) -> bool {
        self.timestamp == 0 || self.medallion == 0
    }

    /// Fill in a zero timestamp or medallion from the enclosing bundle.
    pub fn resolve(&self, timestamp: Timestamp, medallion: Medallion) -> Self {
        Self {
            timestamp: if self.timestamp == 0 { timestamp } else { self.timestamp },
            medallion: if self.medallion == 0 { medallion } else { self.medallion },
            offset: self.offset,
        }
    }

    /// Upper bound for "anything placed at or before `timestamp`".
    pub const fn upper_bound_at(timestamp: Timestamp) -> Self {
        Self::new(timestamp, i64::MAX, u32::MAX)
    }
}

fn field_to_hex(value: i64, digits: usize) -> String {
    if value < 0 {
        "F".repeat(digits)
    } else {
        format!("{:0width$X}", value, width = digits)
    }
}

fn hex_to_field(part: &str, digits: usize) -> Result<i64, CoreError> {
    if part.len() == digits && part.chars().all(|c| c == 'F' || c == 'f') {
        return Ok(-1);
    }
    i64::from_str_radix(part, 16).map_err(|e| CoreError::MalformedMuid(format!("{part}: {e}")))
}

impl fmt::Display for Muid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{:0width$X}",
            field_to_hex(self.timestamp, TIMESTAMP_HEX_DIGITS),
            field_to_hex(self.medallion, MEDALLION_HEX_DIGITS),
            self.offset,
            width = OFFSET_HEX_DIGITS
        )
    }
}

impl fmt::Debug for Muid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Muid({self})")
    }
}

impl FromStr for Muid {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        let [timestamp, medallion, offset] = parts.as_slice() else {
            return Err(CoreError::MalformedMuid(format!("expected 3 parts in {s:?}")));
        };
        let offset = u32::from_str_radix(offset, 16)
            .map_err(|e| CoreError::MalformedMuid(format!("{offset}: {e}")))?;
        Ok(Self {
            timestamp: hex_to_field(timestamp, TIMESTAMP_HEX_DIGITS)?,
            medallion: hex_to_field(medallion, MEDALLION_HEX_DIGITS)?,
            offset,
        })
    }
}

impl From<(Timestamp, Medallion, u32)> for Muid {
    fn from((timestamp, medallion, offset): (Timestamp, Medallion, u32)) -> Self {
        Self::new(timestamp, medallion, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_muid_string_form() {
        let muid = Muid::new(1_700_000_000_000_000, 0x4_0000_0001, 7);
        let s = muid.to_string();
        assert_eq!(s.len(), 34);
        assert_eq!(s, "60A24181E4000-00400000001-00000007");
        assert_eq!(s.parse::<Muid>().unwrap(), muid);
    }

    #[test]
    fn test_global_container_string() {
        let muid = Muid::global(Behavior::Directory);
        assert_eq!(muid.to_string(), "FFFFFFFFFFFFF-FFFFFFFFFFF-00000004");
        assert_eq!(muid.to_string().parse::<Muid>().unwrap(), muid);
    }

    #[test]
    fn test_malformed_muid() {
        assert!("abc".parse::<Muid>().is_err());
        assert!("1-2".parse::<Muid>().is_err());
        assert!("zz-1-1".parse::<Muid>().is_err());
    }

    #[test]
    fn test_resolve_fills_only_zero_fields() {
        let relative = Muid::new(0, 0, 3);
        assert!(relative.is_relative());
        assert_eq!(relative.resolve(100, 55), Muid::new(100, 55, 3));

        let absolute = Muid::new(90, 44, 1);
        assert_eq!(absolute.resolve(100, 55), absolute);

        let global = Muid::global(Behavior::Box);
        assert_eq!(global.resolve(100, 55), global);
    }

    #[test]
    fn test_ordering_breaks_ties_by_medallion() {
        let a = Muid::new(100, 5, 9);
        let b = Muid::new(100, 6, 1);
        let c = Muid::new(101, 1, 1);
        assert!(a < b);
        assert!(b < c);
        assert!(Muid::upper_bound_at(100) > b);
        assert!(Muid::upper_bound_at(100) < c);
    }
}
