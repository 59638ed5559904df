//! [`Environment`] for real deployments: the OS clock, the OS RNG and Tokio
//! timers.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use peerlock_core::Environment;

/// System clock plus `getrandom`.
///
/// Identity keys, prekeys, ephemeral keys, ratchet keys and content keys
/// all draw from the OS generator.
///
/// # Panics
///
/// `random_bytes` panics if the OS generator fails. Keys cannot be produced
/// without it, so there is nothing sensible to continue with.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// System environment handle.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Instant {
        Instant::now()
    }

    #[allow(clippy::disallowed_methods)]
    fn wall_clock_secs(&self) -> u64 {
        // A clock set before 1970 reads as the epoch.
        SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |since| since.as_secs())
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("OS RNG unavailable, no keys can be generated");
    }
}
