//! Deterministic simulation harness for peerlock.
//!
//! Implementations of the Environment and key server transport traits for
//! reproducible engine tests:
//!
//! - [`SimEnv`]: seeded ChaCha20 randomness and a virtual clock that tests
//!   move forward to cross prekey lifetimes and limbo periods
//! - [`LoopbackTransport`]: routes requests to in-process key servers, with
//!   switches for an unreachable server and forged bundles
//! - [`World`]: one key server plus any number of engines sharing a clock
//!
//! The cross-crate scenario tests live in this crate's `tests/`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod loopback;
pub mod sim_env;
pub mod world;

pub use loopback::LoopbackTransport;
pub use sim_env::{SIM_EPOCH_SECS, SimEnv};
pub use world::{KEY_SERVER_URL, SimManager, World};

/// Install a tracing subscriber for tests.
///
/// Honours `RUST_LOG`, defaulting to `warn`. Output goes through the test
/// writer so it is captured per test. Safe to call from every test.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry().with(fmt::layer().with_test_writer()).with(filter).try_init();
}
