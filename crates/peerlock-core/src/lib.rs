//! Peerlock core: the engine's shared vocabulary and durable state.
//!
//! - [`types`]: enumerations exposed at the engine boundary
//! - [`env`]: time and randomness, injected so simulations are deterministic
//! - [`error`]: the error taxonomy every engine operation reports through
//! - [`records`]: what gets persisted
//! - [`storage`]: where it gets persisted, with atomic batched writes
//! - [`trust`]: peer device status transitions

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod env;
pub mod error;
pub mod records;
pub mod storage;
pub mod trust;
pub mod types;

pub use env::Environment;
pub use error::{EngineError, ProvisioningError};
pub use peerlock_proto::CurveId;
pub use records::{
    LocalUserRecord, OneTimePreKeyRecord, PeerDeviceRecord, SessionRecord, SessionSet,
    SignedPreKeyRecord,
};
pub use storage::{
    ChaoticStorage, MemoryStorage, RedbStorage, Storage, StorageError, WriteBatch, WriteOp,
};
pub use types::{CallbackOutcome, EncryptionPolicy, PeerDeviceStatus};
