//! Peerlock Client
//!
//! Multi-device end-to-end encryption engine. A [`Manager`] owns any number
//! of local users (devices), each with an identity key published to a key
//! server, and keeps one Double Ratchet session per peer device.
//!
//! # Architecture
//!
//! ```text
//!              Manager ──submit──▶ dispatcher (one task per operation)
//!                 │
//!   ┌─────────────┼──────────────┬───────────────┐
//!   ▼             ▼              ▼               ▼
//! provisioner  encryptor     decryptor      maintenance
//!   │             │  │           │  │            │
//!   │             │  └─session───┘  │            │
//!   ▼             ▼                 ▼            ▼
//! KeyServerTransport           Storage (peerlock-core)
//! ```
//!
//! - [`Manager`]: async API over the whole engine
//! - [`KeyServerTransport`]: request/response channel to the key server
//! - [`EngineConfig`]: skip windows, rotation periods, prekey counts
//! - [`SystemEnv`]: production time and randomness
//!
//! # Atomicity
//!
//! Every operation reads what it needs, works on copies, and writes the
//! result in one storage batch. A failed operation leaves stored state as
//! it found it, with one exception: a failed decrypt marks the attempted
//! message key consumed.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod config;
mod decryptor;
pub mod dispatcher;
mod encryptor;
mod identity;
mod locks;
mod maintenance;
mod manager;
mod provisioner;
mod session;
mod system_env;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use decryptor::Decrypted;
pub use dispatcher::{Completion, dispatch};
pub use encryptor::{EncryptOutput, OutputSizeBound, RecipientResult, max_output_size};
pub use maintenance::{UpdateReport, UserUpdate};
pub use manager::Manager;
pub use peerlock_core::{
    CallbackOutcome, CurveId, EncryptionPolicy, EngineError, Environment, PeerDeviceStatus,
    ProvisioningError, Storage,
};
pub use system_env::SystemEnv;
pub use transport::{KeyServerTransport, TransportError};
