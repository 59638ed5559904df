//! Engine configuration.

use std::time::Duration;

use peerlock_crypto::RatchetLimits;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Tunables for the engine. `Default` gives production values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Largest gap accepted inside one receiving chain
    pub max_skip: u32,
    /// Skipped message keys cached per session
    pub max_skipped_keys: usize,
    /// Messages sent without any reply before a fresh session is bootstrapped
    pub max_sending_chain: u32,
    /// Previous sessions kept per peer for late messages
    pub max_stale_sessions: usize,
    /// Age at which the signed prekey is replaced
    pub spk_lifetime: Duration,
    /// How long a replaced signed prekey still accepts initial messages
    pub spk_limbo: Duration,
    /// How long a one-time prekey gone from the server is kept locally
    pub opk_limbo: Duration,
    /// Idle time after which a stale session is dropped
    pub session_retention: Duration,
    /// Server-side one-time prekey count below which `update` tops up
    pub opk_server_low_limit: usize,
    /// One-time prekeys generated per top-up
    pub opk_batch_size: usize,
    /// One-time prekeys published by `create_user` when no count is given
    pub default_opk_batch: u16,
    /// Refuse peer bundles that carry no one-time prekey
    pub require_one_time_prekey: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_skip: 1024,
            max_skipped_keys: 2048,
            max_sending_chain: 1000,
            max_stale_sessions: 4,
            spk_lifetime: 7 * DAY,
            spk_limbo: 30 * DAY,
            opk_limbo: 37 * DAY,
            session_retention: 30 * DAY,
            opk_server_low_limit: 100,
            opk_batch_size: 25,
            default_opk_batch: 100,
            require_one_time_prekey: false,
        }
    }
}

impl EngineConfig {
    /// Ratchet bounds derived from this configuration.
    #[must_use]
    pub fn limits(&self) -> RatchetLimits {
        RatchetLimits { max_skip: self.max_skip, max_skipped_keys: self.max_skipped_keys }
    }
}
