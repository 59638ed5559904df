//! Seeded, virtual-clock Environment for deterministic tests.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use peerlock_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Wall clock every simulation starts at (2023-11-14).
pub const SIM_EPOCH_SECS: u64 = 1_700_000_000;

/// Simulation environment with a virtual clock and seeded RNG.
///
/// - **Virtual time**: the clock only moves through [`SimEnv::advance`] or
///   `sleep`, so prekey rotation and limbo periods can be crossed instantly.
///
/// - **Seeded RNG**: `random_bytes()` draws from a ChaCha20 stream, so the
///   same seed yields the same keys on every run.
///
/// Clones share both the clock and the RNG stream. Give every simulated
/// device the same `SimEnv` to keep their clocks in step.
#[derive(Clone)]
pub struct SimEnv {
    rng: Arc<Mutex<ChaCha20Rng>>,
    clock: Arc<AtomicU64>,
}

impl SimEnv {
    /// Environment with seed 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment with a specific seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            clock: Arc::new(AtomicU64::new(SIM_EPOCH_SECS)),
        }
    }

    /// Move the virtual clock forward.
    pub fn advance(&self, by: Duration) {
        self.clock.fetch_add(by.as_secs(), Ordering::SeqCst);
    }

    /// Seconds elapsed since the simulation started.
    pub fn elapsed(&self) -> Duration {
        Duration::from_secs(self.clock.load(Ordering::SeqCst) - SIM_EPOCH_SECS)
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SimEnv {
    /// Virtual time since the simulation started.
    type Instant = Duration;

    fn now(&self) -> Self::Instant {
        self.elapsed()
    }

    fn wall_clock_secs(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }

    fn random_bytes(&self, dest: &mut [u8]) {
        // A panic while holding the lock cannot leave the RNG half-updated.
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(dest);
    }
}
