//! Sealed bundles: canonical bytes plus their decoded form.

use bytes::Bytes;

use crate::change::Change;
use crate::codec;
use crate::error::Result;
use crate::info::BundleInfo;
use crate::muid::Muid;

/// An immutable, sealed bundle.
///
/// `bytes` is authoritative: it is what gets stored and sent to peers.
/// `info` and `changes` are decoded from it once, up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    bytes: Bytes,
    info: BundleInfo,
    changes: Vec<Change>,
}

impl Bundle {
    /// Decode and validate bundle bytes received from elsewhere.
    pub fn decode(bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        let (info, changes) = codec::decode_bundle(&bytes)?;
        Ok(Self {
            bytes,
            info,
            changes,
        })
    }

    /// Encode a bundle from its parts.
    pub fn from_parts(info: BundleInfo, changes: Vec<Change>) -> Result<Self> {
        info.validate()?;
        for change in &changes {
            change.validate()?;
        }
        let bytes = Bytes::from(codec::encode_bundle(&info, &changes)?);
        Ok(Self {
            bytes,
            info,
            changes,
        })
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn info(&self) -> &BundleInfo {
        &self.info
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    /// Iterate changes together with their resolved muids.
    pub fn changes_with_ids(&self) -> impl Iterator<Item = (Muid, &Change)> + '_ {
        let (timestamp, medallion) = (self.info.timestamp, self.info.medallion);
        self.changes
            .iter()
            .enumerate()
            .map(move |(i, change)| (Muid::new(timestamp, medallion, i as u32 + 1), change))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{Behavior, ContainerDef, EntryChange};

    #[test]
    fn test_decode_matches_from_parts() {
        let info = BundleInfo::chain_start(77, 500);
        let changes = vec![
            Change::Container(ContainerDef {
                behavior: Behavior::Sequence,
            }),
            Change::Entry(EntryChange::new(Behavior::Sequence, Muid::new(0, 0, 1)).value(b"x".to_vec())),
        ];
        let built = Bundle::from_parts(info, changes).unwrap();
        let decoded = Bundle::decode(built.bytes().clone()).unwrap();
        assert_eq!(decoded, built);

        let ids: Vec<Muid> = decoded.changes_with_ids().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![Muid::new(500, 77, 1), Muid::new(500, 77, 2)]);
    }

    #[test]
    fn test_from_parts_rejects_invalid_info() {
        let mut info = BundleInfo::chain_start(77, 500);
        info.prior_time = Some(400);
        assert!(Bundle::from_parts(info, vec![]).is_err());
    }
}
