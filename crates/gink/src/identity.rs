//! Who writes: medallions, actors and chain identities.

use std::path::Path;

use rand::Rng;

use gink_core::{ActorId, Medallion};

/// Smallest medallion handed out: `16^10`.
pub const MEDALLION_MIN: Medallion = 1 << 40;

/// Largest medallion handed out: `2 * 16^10 - 1`.
pub const MEDALLION_MAX: Medallion = (1 << 41) - 1;

/// A source of fresh medallions.
pub trait MedallionSource: Send + Sync {
    fn next_medallion(&self) -> Medallion;
}

/// Uniform random medallions in `[MEDALLION_MIN, MEDALLION_MAX]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomMedallions;

impl MedallionSource for RandomMedallions {
    fn next_medallion(&self) -> Medallion {
        rand::thread_rng().gen_range(MEDALLION_MIN..=MEDALLION_MAX)
    }
}

/// Decides whether the actor holding a chain claim is still running.
pub trait LivenessOracle: Send + Sync {
    fn is_alive(&self, actor: ActorId) -> bool;
}

/// Treats actor ids as process ids.
///
/// Where `/proc` is available a missing `/proc/<pid>` means dead. Elsewhere
/// every actor is reported alive, so chains are never reused by mistake.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLiveness;

impl LivenessOracle for ProcessLiveness {
    fn is_alive(&self, actor: ActorId) -> bool {
        if actor == std::process::id() {
            return true;
        }
        let proc_root = Path::new("/proc");
        if !proc_root.is_dir() {
            return true;
        }
        proc_root.join(actor.to_string()).exists()
    }
}

/// `user@host` for the current process, used as the default chain identity.
pub fn default_identity() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|name| name.trim().to_string())
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{user}@{host}")
}
