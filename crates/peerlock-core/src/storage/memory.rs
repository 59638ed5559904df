#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use super::{Storage, StorageError, WriteBatch, WriteOp};
use crate::records::{
    LocalUserRecord, OneTimePreKeyRecord, PeerDeviceRecord, SessionSet, SignedPreKeyRecord,
};

/// Engine store held in process memory.
///
/// Everything a local user owns lives in one `UserState`, so deleting a user
/// drops all of it at once. Clones share the same state. A poisoned mutex
/// panics.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<HashMap<String, UserState>>>,
}

#[derive(Clone)]
struct UserState {
    record: LocalUserRecord,
    signed_prekeys: BTreeMap<u32, SignedPreKeyRecord>,
    one_time_prekeys: BTreeMap<u32, OneTimePreKeyRecord>,
    peers: HashMap<String, PeerDeviceRecord>,
    sessions: HashMap<String, SessionSet>,
}

impl UserState {
    fn new(record: LocalUserRecord) -> Self {
        Self {
            record,
            signed_prekeys: BTreeMap::new(),
            one_time_prekeys: BTreeMap::new(),
            peers: HashMap::new(),
            sessions: HashMap::new(),
        }
    }
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Number of stored session sets across all local users.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn session_count(&self) -> usize {
        let inner = self.inner.lock().expect("Mutex poisoned");
        inner.values().map(|user| user.sessions.len()).sum()
    }

    #[allow(clippy::expect_used)]
    fn with_user<T>(&self, owner: &str, f: impl FnOnce(&UserState) -> T) -> Option<T> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        inner.get(owner).map(f)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply one write to the staged copy of the users it touches.
fn apply(
    staged: &mut HashMap<String, Option<UserState>>,
    op: &WriteOp,
) -> Result<(), StorageError> {
    let owner = op.owner().to_string();
    let slot = staged.get_mut(&owner).ok_or_else(|| StorageError::Io("unstaged owner".into()))?;

    match op {
        WriteOp::InsertUser(record) => {
            if slot.is_some() {
                return Err(StorageError::Conflict { device_id: owner });
            }
            *slot = Some(UserState::new(record.clone()));
            return Ok(());
        },
        WriteOp::DeleteUser(_) => {
            *slot = None;
            return Ok(());
        },
        _ => {},
    }

    let user = slot.as_mut().ok_or(StorageError::NotFound { device_id: owner })?;
    match op {
        WriteOp::PutUser(record) => user.record = record.clone(),
        WriteOp::PutSignedPreKey { record, .. } => {
            user.signed_prekeys.insert(record.id, record.clone());
        },
        WriteOp::DeleteSignedPreKey { id, .. } => {
            user.signed_prekeys.remove(id);
        },
        WriteOp::PutOneTimePreKey { record, .. } => {
            user.one_time_prekeys.insert(record.id, record.clone());
        },
        WriteOp::DeleteOneTimePreKey { id, .. } => {
            user.one_time_prekeys.remove(id);
        },
        WriteOp::PutPeer { record, .. } => {
            user.peers.insert(record.device_id.clone(), record.clone());
        },
        WriteOp::DeletePeer { peer, .. } => {
            user.peers.remove(peer);
            user.sessions.remove(peer);
        },
        WriteOp::PutSessions { peer, sessions, .. } => {
            if sessions.is_empty() {
                user.sessions.remove(peer);
            } else {
                user.sessions.insert(peer.clone(), sessions.clone());
            }
        },
        WriteOp::InsertUser(_) | WriteOp::DeleteUser(_) => {},
    }
    Ok(())
}

impl Storage for MemoryStorage {
    fn load_user(&self, device_id: &str) -> Result<Option<LocalUserRecord>, StorageError> {
        Ok(self.with_user(device_id, |user| user.record.clone()))
    }

    #[allow(clippy::expect_used)]
    fn list_users(&self) -> Result<Vec<String>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.keys().cloned().collect())
    }

    fn load_signed_prekeys(&self, owner: &str) -> Result<Vec<SignedPreKeyRecord>, StorageError> {
        Ok(self
            .with_user(owner, |user| user.signed_prekeys.values().cloned().collect())
            .unwrap_or_default())
    }

    fn load_one_time_prekeys(
        &self,
        owner: &str,
    ) -> Result<Vec<OneTimePreKeyRecord>, StorageError> {
        Ok(self
            .with_user(owner, |user| user.one_time_prekeys.values().cloned().collect())
            .unwrap_or_default())
    }

    fn load_one_time_prekey(
        &self,
        owner: &str,
        id: u32,
    ) -> Result<Option<OneTimePreKeyRecord>, StorageError> {
        Ok(self.with_user(owner, |user| user.one_time_prekeys.get(&id).cloned()).flatten())
    }

    fn load_peer(&self, owner: &str, peer: &str) -> Result<Option<PeerDeviceRecord>, StorageError> {
        Ok(self.with_user(owner, |user| user.peers.get(peer).cloned()).flatten())
    }

    fn load_sessions(&self, owner: &str, peer: &str) -> Result<Option<SessionSet>, StorageError> {
        Ok(self.with_user(owner, |user| user.sessions.get(peer).cloned()).flatten())
    }

    fn list_session_peers(&self, owner: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .with_user(owner, |user| user.sessions.keys().cloned().collect())
            .unwrap_or_default())
    }

    #[allow(clippy::expect_used)]
    fn commit(&self, batch: &WriteBatch) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        // Stage copies of every touched user; apply to the copies, then swap
        // them in only if every write succeeded.
        let mut staged: HashMap<String, Option<UserState>> = HashMap::new();
        for op in batch.ops() {
            let owner = op.owner();
            if !staged.contains_key(owner) {
                staged.insert(owner.to_string(), inner.get(owner).cloned());
            }
        }

        for op in batch.ops() {
            apply(&mut staged, op)?;
        }

        for (owner, state) in staged {
            match state {
                Some(state) => {
                    inner.insert(owner, state);
                },
                None => {
                    inner.remove(&owner);
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use peerlock_proto::CurveId;

    use super::*;
    use crate::types::PeerDeviceStatus;

    fn user(device_id: &str) -> LocalUserRecord {
        LocalUserRecord {
            device_id: device_id.to_string(),
            server_url: "https://keys.example".into(),
            curve: CurveId::C25519,
            identity_seed: [1; 32],
            identity_public: [2; 32],
            initial_opk_count: 10,
            created_at: 0,
        }
    }

    fn peer(device_id: &str) -> PeerDeviceRecord {
        PeerDeviceRecord {
            device_id: device_id.to_string(),
            identity_key: [3; 32],
            status: PeerDeviceStatus::Untrusted,
            updated_at: 0,
        }
    }

    #[test]
    fn insert_then_load() {
        let storage = MemoryStorage::new();
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::InsertUser(user("alice"))).put_peer("alice", peer("bob"));
        storage.commit(&batch).unwrap();

        assert_eq!(storage.load_user("alice").unwrap(), Some(user("alice")));
        assert_eq!(storage.load_peer("alice", "bob").unwrap(), Some(peer("bob")));
        assert_eq!(storage.list_users().unwrap(), vec!["alice".to_string()]);
    }

    #[test]
    fn insert_existing_user_conflicts() {
        let storage = MemoryStorage::new();
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::InsertUser(user("alice")));
        storage.commit(&batch).unwrap();

        let result = storage.commit(&batch);
        assert_eq!(result, Err(StorageError::Conflict { device_id: "alice".into() }));
    }

    #[test]
    fn write_for_missing_user_is_rejected_atomically() {
        let storage = MemoryStorage::new();
        let mut setup = WriteBatch::new();
        setup.push(WriteOp::InsertUser(user("alice")));
        storage.commit(&setup).unwrap();

        let mut batch = WriteBatch::new();
        batch.put_peer("alice", peer("bob")).put_peer("ghost", peer("bob"));
        let result = storage.commit(&batch);

        assert_eq!(result, Err(StorageError::NotFound { device_id: "ghost".into() }));
        assert_eq!(storage.load_peer("alice", "bob").unwrap(), None);
    }

    #[test]
    fn delete_user_cascades() {
        let storage = MemoryStorage::new();
        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::InsertUser(user("alice")))
            .put_peer("alice", peer("bob"))
            .push(WriteOp::DeleteUser("alice".into()));
        storage.commit(&batch).unwrap();

        assert_eq!(storage.load_user("alice").unwrap(), None);
        assert_eq!(storage.load_peer("alice", "bob").unwrap(), None);
        assert!(storage.list_users().unwrap().is_empty());
    }
}
