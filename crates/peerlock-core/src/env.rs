//! Time and randomness, injected.
//!
//! The engine never reads the system clock or the OS RNG directly. Every key
//! it generates and every timestamp it persists comes through an
//! [`Environment`], so a simulation with a virtual clock and a seeded RNG
//! replays a run byte for byte.

use std::time::Duration;

/// Source of time and randomness for an engine.
///
/// Implementations must keep `now()` monotonic and must back
/// `random_bytes()` with a cryptographically secure generator outside of
/// tests. Key generation has no fallback when randomness is unavailable.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic instant. `std::time::Instant` in production, a virtual
    /// clock reading in simulation.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current monotonic time.
    fn now(&self) -> Self::Instant;

    /// Seconds since the Unix epoch.
    ///
    /// Used for everything that is persisted (prekey creation, limbo start,
    /// session activity), since those values must stay meaningful across
    /// restarts.
    fn wall_clock_secs(&self) -> u64;

    /// Wait for `duration`. A simulation may just advance its clock.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Random prekey id material.
    fn random_u32(&self) -> u32 {
        let mut bytes = [0u8; 4];
        self.random_bytes(&mut bytes);
        u32::from_be_bytes(bytes)
    }

    /// Random session id.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// 32 random bytes, the seed size of every key pair and content key.
    fn random_seed(&self) -> [u8; 32] {
        let mut seed = [0u8; 32];
        self.random_bytes(&mut seed);
        seed
    }
}
