//! Simulated deployment: one key server, any number of engines.

use peerlock_client::{EngineConfig, Manager};
use peerlock_core::{MemoryStorage, Storage};
use peerlock_server::KeyServer;

use crate::{loopback::LoopbackTransport, sim_env::SimEnv};

/// URL the default key server is mounted at.
pub const KEY_SERVER_URL: &str = "https://keys.peerlock.test";

/// Engine wired to the simulated key server.
pub type SimManager<S = MemoryStorage> = Manager<S, LoopbackTransport, SimEnv>;

/// A key server, the transport reaching it and a shared environment.
///
/// Engines built from the same `World` share the virtual clock and see the
/// same server.
#[derive(Clone)]
pub struct World {
    /// Shared environment
    pub env: SimEnv,
    /// Transport every engine uses
    pub transport: LoopbackTransport,
    /// Key server mounted at [`KEY_SERVER_URL`]
    pub server: KeyServer,
}

impl World {
    /// World with seeded randomness.
    pub fn new(seed: u64) -> Self {
        let server = KeyServer::default();
        let transport = LoopbackTransport::new();
        transport.mount(KEY_SERVER_URL, server.clone());
        Self { env: SimEnv::with_seed(seed), transport, server }
    }

    /// Engine over fresh in-memory storage with default configuration.
    pub fn manager(&self) -> SimManager {
        self.manager_with(MemoryStorage::new(), EngineConfig::default())
    }

    /// Engine over `storage` with `config`.
    pub fn manager_with<S: Storage>(&self, storage: S, config: EngineConfig) -> SimManager<S> {
        Manager::new(storage, self.transport.clone(), self.env.clone(), config)
    }
}
