//! Deterministic helpers for unit tests.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use peerlock_core::Environment;

/// Counter-based environment: deterministic, distinct outputs, frozen clock.
#[derive(Clone, Default)]
pub(crate) struct CounterEnv {
    counter: Arc<AtomicU64>,
}

impl Environment for CounterEnv {
    type Instant = Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_clock_secs(&self) -> u64 {
        1_700_000_000
    }

    async fn sleep(&self, _duration: Duration) {}

    fn random_bytes(&self, buffer: &mut [u8]) {
        for chunk in buffer.chunks_mut(8) {
            let value = self
                .counter
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_mul(0x9E37_79B9_7F4A_7C15)
                .to_be_bytes();
            chunk.copy_from_slice(&value[..chunk.len()]);
        }
    }
}
