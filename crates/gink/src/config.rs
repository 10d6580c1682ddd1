//! Database configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use gink_core::ActorId;

use crate::identity::default_identity;

/// Configuration for the Database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Written as the comment of every chain this database starts.
    /// Defaults to `user@host`.
    pub identity: Option<String>,
    /// Actor recorded on chain claims. Defaults to the process id.
    pub actor_id: Option<ActorId>,
    /// How long a new peer has to send its greeting.
    pub handshake_timeout_ms: u64,
    /// Keep superseded entries for point-in-time reads.
    pub keep_history: bool,
    /// How long `run` waits for a frame before sweeping failed handshakes.
    pub message_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            identity: None,
            actor_id: None,
            handshake_timeout_ms: 1000,
            keep_history: true,
            message_timeout_ms: 100,
        }
    }
}

impl DatabaseConfig {
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_actor_id(mut self, actor_id: ActorId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = millis(timeout);
        self
    }

    pub fn with_keep_history(mut self, keep: bool) -> Self {
        self.keep_history = keep;
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout_ms = millis(timeout);
        self
    }

    pub fn identity(&self) -> String {
        self.identity.clone().unwrap_or_else(default_identity)
    }

    pub fn actor_id(&self) -> ActorId {
        self.actor_id.unwrap_or_else(std::process::id)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
