//! Storage abstraction for the engine's durable state.
//!
//! Trait-based abstraction for persisting identities, prekeys, peer records
//! and sessions. The trait is synchronous (no async); engine operations load
//! what they need, compute the new state in memory, and hand every resulting
//! write to a single `commit` so an operation lands completely or not at all.

mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;

pub use self::redb::RedbStorage;
use crate::records::{
    LocalUserRecord, OneTimePreKeyRecord, PeerDeviceRecord, SessionSet, SignedPreKeyRecord,
};

/// One write inside a `WriteBatch`.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Create a local user; fails with `Conflict` if it exists
    InsertUser(LocalUserRecord),
    /// Overwrite an existing local user
    PutUser(LocalUserRecord),
    /// Remove a local user and everything it owns
    DeleteUser(String),
    /// Insert or overwrite a signed prekey
    PutSignedPreKey {
        /// Owning local user
        owner: String,
        /// Record
        record: SignedPreKeyRecord,
    },
    /// Remove a signed prekey
    DeleteSignedPreKey {
        /// Owning local user
        owner: String,
        /// Prekey id
        id: u32,
    },
    /// Insert or overwrite a one-time prekey
    PutOneTimePreKey {
        /// Owning local user
        owner: String,
        /// Record
        record: OneTimePreKeyRecord,
    },
    /// Remove a one-time prekey
    DeleteOneTimePreKey {
        /// Owning local user
        owner: String,
        /// Prekey id
        id: u32,
    },
    /// Insert or overwrite a peer device record
    PutPeer {
        /// Owning local user
        owner: String,
        /// Record
        record: PeerDeviceRecord,
    },
    /// Remove a peer device record and its sessions
    DeletePeer {
        /// Owning local user
        owner: String,
        /// Peer device id
        peer: String,
    },
    /// Replace the session set for a peer. An empty set removes it.
    PutSessions {
        /// Owning local user
        owner: String,
        /// Peer device id
        peer: String,
        /// Sessions
        sessions: SessionSet,
    },
}

impl WriteOp {
    /// Local user this write belongs to.
    #[must_use]
    pub fn owner(&self) -> &str {
        match self {
            Self::InsertUser(record) | Self::PutUser(record) => &record.device_id,
            Self::DeleteUser(owner)
            | Self::PutSignedPreKey { owner, .. }
            | Self::DeleteSignedPreKey { owner, .. }
            | Self::PutOneTimePreKey { owner, .. }
            | Self::DeleteOneTimePreKey { owner, .. }
            | Self::PutPeer { owner, .. }
            | Self::DeletePeer { owner, .. }
            | Self::PutSessions { owner, .. } => owner,
        }
    }
}

/// Ordered writes applied atomically by `Storage::commit`.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Empty batch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a write
    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Append a session set write
    pub fn put_sessions(&mut self, owner: &str, peer: &str, sessions: SessionSet) -> &mut Self {
        self.push(WriteOp::PutSessions {
            owner: owner.to_string(),
            peer: peer.to_string(),
            sessions,
        })
    }

    /// Append a peer record write
    pub fn put_peer(&mut self, owner: &str, record: PeerDeviceRecord) -> &mut Self {
        self.push(WriteOp::PutPeer { owner: owner.to_string(), record })
    }

    /// Writes in order
    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// True if nothing was queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of queued writes
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

impl Extend<WriteOp> for WriteBatch {
    fn extend<T: IntoIterator<Item = WriteOp>>(&mut self, iter: T) {
        self.ops.extend(iter);
    }
}

/// Storage abstraction for engine state.
///
/// Must be Clone (shared by every engine task), Send + Sync (thread-safe),
/// and synchronous (no async methods). Implementations typically share
/// internal state via Arc, so clones access the same underlying storage.
///
/// Device ids are opaque strings without NUL bytes; the engine validates
/// this before anything reaches storage.
///
/// # Panics
///
/// Implementations may panic if internal synchronization primitives are
/// poisoned (a thread panicked while holding a lock).
pub trait Storage: Clone + Send + Sync + 'static {
    /// Load a local user. `None` if it does not exist.
    fn load_user(&self, device_id: &str) -> Result<Option<LocalUserRecord>, StorageError>;

    /// List all local user device ids. Order is not guaranteed.
    fn list_users(&self) -> Result<Vec<String>, StorageError>;

    /// All signed prekeys of a local user, current and retired.
    fn load_signed_prekeys(&self, owner: &str) -> Result<Vec<SignedPreKeyRecord>, StorageError>;

    /// All one-time prekeys of a local user.
    fn load_one_time_prekeys(&self, owner: &str)
    -> Result<Vec<OneTimePreKeyRecord>, StorageError>;

    /// One one-time prekey by id.
    fn load_one_time_prekey(
        &self,
        owner: &str,
        id: u32,
    ) -> Result<Option<OneTimePreKeyRecord>, StorageError>;

    /// Peer device record. `None` if the pair has never interacted.
    fn load_peer(&self, owner: &str, peer: &str) -> Result<Option<PeerDeviceRecord>, StorageError>;

    /// Session set for a peer. `None` if no session exists.
    fn load_sessions(&self, owner: &str, peer: &str) -> Result<Option<SessionSet>, StorageError>;

    /// Peers the local user holds sessions with.
    fn list_session_peers(&self, owner: &str) -> Result<Vec<String>, StorageError>;

    /// Apply every write in `batch` atomically.
    ///
    /// # Invariants
    ///
    /// - Pre: every write other than `InsertUser` targets a user that exists
    ///   (or is inserted earlier in the same batch); otherwise `NotFound`
    /// - Post: either all writes are visible or none is
    fn commit(&self, batch: &WriteBatch) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_of_each_write() {
        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::DeleteSignedPreKey { owner: "alice".into(), id: 1 })
            .put_sessions("bob", "carol", SessionSet::default());

        let owners: Vec<&str> = batch.ops().iter().map(WriteOp::owner).collect();
        assert_eq!(owners, vec!["alice", "bob"]);
        assert_eq!(batch.len(), 2);
    }
}
