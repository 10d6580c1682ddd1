//! Sync protocol message types.
//!
//! Every frame on the wire is a CBOR map with exactly one entry; the key
//! names the message kind. Bundle and greeting payloads travel as opaque
//! byte strings and are decoded by the receiver.

use std::fmt;

use bytes::Bytes;
use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use gink_core::{BundleInfo, ChainStart, Medallion, Timestamp};

use crate::error::{Result, SyncError};

/// Subprotocol every Gink connection negotiates.
pub const PROTOCOL: &str = "gink";

const AUTH_PREFIX: &str = "token ";

/// Envelope keys.
mod kind {
    pub const BUNDLE: u64 = 1;
    pub const GREETING: u64 = 2;
    pub const ACK: u64 = 3;
}

/// Identifier of a connected peer, local to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl PeerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Generate a random peer ID.
    pub fn random() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Sync protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Raw bytes of a sealed bundle.
    Bundle(Bytes),

    /// Serialized chain tracker of the sender.
    Greeting(Bytes),

    /// The sender now has this bundle.
    Ack {
        medallion: Medallion,
        chain_start: ChainStart,
        timestamp: Timestamp,
    },
}

impl SyncMessage {
    /// Ack for a bundle.
    pub fn ack(info: &BundleInfo) -> Self {
        Self::Ack {
            medallion: info.medallion,
            chain_start: info.chain_start,
            timestamp: info.timestamp,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bundle(_) => "bundle",
            Self::Greeting(_) => "greeting",
            Self::Ack { .. } => "ack",
        }
    }

    /// Serialize to a frame.
    pub fn encode(&self) -> Result<Bytes> {
        let (key, value) = match self {
            Self::Bundle(bytes) => (kind::BUNDLE, Value::Bytes(bytes.to_vec())),
            Self::Greeting(bytes) => (kind::GREETING, Value::Bytes(bytes.to_vec())),
            Self::Ack {
                medallion,
                chain_start,
                timestamp,
            } => (
                kind::ACK,
                Value::Array(vec![
                    Value::Integer((*medallion).into()),
                    Value::Integer((*chain_start).into()),
                    Value::Integer((*timestamp).into()),
                ]),
            ),
        };
        let envelope = Value::Map(vec![(Value::Integer(key.into()), value)]);
        let mut buf = Vec::new();
        ciborium::into_writer(&envelope, &mut buf)
            .map_err(|e| SyncError::InvalidMessage(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    /// Parse a frame.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let value: Value = ciborium::from_reader(frame)
            .map_err(|e| SyncError::InvalidMessage(e.to_string()))?;
        let Value::Map(mut entries) = value else {
            return Err(SyncError::InvalidMessage("envelope is not a map".into()));
        };
        if entries.len() != 1 {
            return Err(SyncError::InvalidMessage(format!(
                "envelope has {} entries, expected 1",
                entries.len()
            )));
        }
        let (key, value) = entries.remove(0);
        let key = match key {
            Value::Integer(n) => u64::try_from(n).ok(),
            _ => None,
        };

        match (key, value) {
            (Some(kind::BUNDLE), Value::Bytes(bytes)) => Ok(Self::Bundle(Bytes::from(bytes))),
            (Some(kind::GREETING), Value::Bytes(bytes)) => Ok(Self::Greeting(Bytes::from(bytes))),
            (Some(kind::ACK), Value::Array(parts)) if parts.len() == 3 => Ok(Self::Ack {
                medallion: int(&parts[0])?,
                chain_start: int(&parts[1])?,
                timestamp: int(&parts[2])?,
            }),
            (key, _) => Err(SyncError::InvalidMessage(format!(
                "unrecognized message kind {key:?}"
            ))),
        }
    }
}

fn int(value: &Value) -> Result<i64> {
    match value {
        Value::Integer(n) => i64::try_from(*n)
            .map_err(|_| SyncError::InvalidMessage("integer out of range".into())),
        _ => Err(SyncError::InvalidMessage("expected integer".into())),
    }
}

/// Subprotocols a client offers: always [`PROTOCOL`], plus the auth token
/// hex-encoded behind `0x` when one is given.
pub fn subprotocols(auth_token: Option<&str>) -> Vec<String> {
    let mut protocols = vec![PROTOCOL.to_string()];
    if let Some(token) = auth_token {
        let token = if token.starts_with(AUTH_PREFIX) {
            token.to_string()
        } else {
            format!("{AUTH_PREFIX}{token}")
        };
        protocols.push(format!("0x{}", hex::encode(token)));
    }
    protocols
}

/// Recover the bearer token from offered subprotocols, if any carries one.
pub fn decode_auth_token<S: AsRef<str>>(protocols: &[S]) -> Option<String> {
    protocols.iter().find_map(|protocol| {
        let encoded = protocol.as_ref().strip_prefix("0x")?;
        let decoded = String::from_utf8(hex::decode(encoded).ok()?).ok()?;
        decoded.strip_prefix(AUTH_PREFIX).map(str::to_string)
    })
}
