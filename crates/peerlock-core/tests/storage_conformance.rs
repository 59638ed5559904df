//! Behaviour every `Storage` backend must share.

use peerlock_core::{
    CurveId, LocalUserRecord, MemoryStorage, OneTimePreKeyRecord, PeerDeviceRecord,
    PeerDeviceStatus, RedbStorage, SessionSet, SignedPreKeyRecord, Storage, StorageError,
    WriteBatch, WriteOp,
};
use proptest::prelude::*;

fn user(device_id: &str) -> LocalUserRecord {
    LocalUserRecord {
        device_id: device_id.to_string(),
        server_url: "https://keys.example".into(),
        curve: CurveId::C25519,
        identity_seed: [1; 32],
        identity_public: [2; 32],
        initial_opk_count: 3,
        created_at: 100,
    }
}

fn signed_prekey(id: u32) -> SignedPreKeyRecord {
    SignedPreKeyRecord {
        id,
        seed: [4; 32],
        public: [5; 32],
        signature: vec![6; 64],
        created_at: 100,
        retired_at: None,
        accepted_ephemerals: Vec::new(),
    }
}

fn one_time_prekey(id: u32) -> OneTimePreKeyRecord {
    OneTimePreKeyRecord { id, seed: [7; 32], public: [8; 32], dispatched_at: None }
}

fn peer(device_id: &str) -> PeerDeviceRecord {
    PeerDeviceRecord {
        device_id: device_id.to_string(),
        identity_key: [9; 32],
        status: PeerDeviceStatus::Untrusted,
        updated_at: 100,
    }
}

fn owner(device_id: &str, opks: u32) -> WriteBatch {
    let mut batch = WriteBatch::new();
    batch.push(WriteOp::InsertUser(user(device_id))).push(WriteOp::PutSignedPreKey {
        owner: device_id.to_string(),
        record: signed_prekey(1),
    });
    batch.extend((0..opks).map(|id| WriteOp::PutOneTimePreKey {
        owner: device_id.to_string(),
        record: one_time_prekey(id),
    }));
    batch
}

fn with_backends(check: impl Fn(&dyn Fn() -> Box<dyn Backend>)) {
    check(&|| -> Box<dyn Backend> { Box::new(MemoryStorage::new()) });

    let dir = tempfile::tempdir().unwrap();
    let counter = std::cell::Cell::new(0);
    check(&|| -> Box<dyn Backend> {
        counter.set(counter.get() + 1);
        let path = dir.path().join(format!("db-{}.redb", counter.get()));
        Box::new(RedbStorage::open(path).unwrap())
    });
}

/// Object-safe view of the parts of `Storage` these tests use.
trait Backend {
    fn commit(&self, batch: &WriteBatch) -> Result<(), StorageError>;
    fn load_user(&self, device_id: &str) -> Option<LocalUserRecord>;
    fn one_time_prekey_ids(&self, owner: &str) -> Vec<u32>;
    fn load_peer(&self, owner: &str, peer: &str) -> Option<PeerDeviceRecord>;
    fn session_peers(&self, owner: &str) -> Vec<String>;
    fn has_sessions(&self, owner: &str, peer: &str) -> bool;
}

impl<S: Storage> Backend for S {
    fn commit(&self, batch: &WriteBatch) -> Result<(), StorageError> {
        Storage::commit(self, batch)
    }

    fn load_user(&self, device_id: &str) -> Option<LocalUserRecord> {
        Storage::load_user(self, device_id).unwrap()
    }

    fn one_time_prekey_ids(&self, owner: &str) -> Vec<u32> {
        let mut ids: Vec<u32> =
            self.load_one_time_prekeys(owner).unwrap().iter().map(|k| k.id).collect();
        ids.sort_unstable();
        ids
    }

    fn load_peer(&self, owner: &str, peer: &str) -> Option<PeerDeviceRecord> {
        Storage::load_peer(self, owner, peer).unwrap()
    }

    fn session_peers(&self, owner: &str) -> Vec<String> {
        self.list_session_peers(owner).unwrap()
    }

    fn has_sessions(&self, owner: &str, peer: &str) -> bool {
        self.load_sessions(owner, peer).unwrap().is_some()
    }
}

#[test]
fn failed_batch_applies_nothing() {
    with_backends(|open| {
        let storage = open();
        storage.commit(&owner("alice", 2)).unwrap();

        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::DeleteOneTimePreKey { owner: "alice".into(), id: 0 })
            .put_peer("alice", peer("bob"))
            .push(WriteOp::InsertUser(user("alice")));

        assert_eq!(storage.commit(&batch), Err(StorageError::Conflict { device_id: "alice".into() }));
        assert_eq!(storage.one_time_prekey_ids("alice"), vec![0, 1]);
        assert!(storage.load_peer("alice", "bob").is_none());
    });
}

#[test]
fn writes_for_unknown_users_are_refused() {
    with_backends(|open| {
        let storage = open();
        let mut batch = WriteBatch::new();
        batch.put_peer("ghost", peer("bob"));

        assert_eq!(storage.commit(&batch), Err(StorageError::NotFound { device_id: "ghost".into() }));
    });
}

#[test]
fn deleting_a_user_drops_what_it_owns() {
    with_backends(|open| {
        let storage = open();
        storage.commit(&owner("alice", 2)).unwrap();
        storage.commit(&owner("carol", 1)).unwrap();
        let mut batch = WriteBatch::new();
        batch.put_peer("alice", peer("bob")).put_sessions("alice", "bob", SessionSet::default());
        storage.commit(&batch).unwrap();

        let mut delete = WriteBatch::new();
        delete.push(WriteOp::DeleteUser("alice".into()));
        storage.commit(&delete).unwrap();

        assert!(storage.load_user("alice").is_none());
        assert!(storage.one_time_prekey_ids("alice").is_empty());
        assert!(storage.load_peer("alice", "bob").is_none());
        assert!(storage.session_peers("alice").is_empty());
        assert_eq!(storage.one_time_prekey_ids("carol"), vec![0]);
    });
}

#[test]
fn deleting_a_peer_drops_its_sessions() {
    with_backends(|open| {
        let storage = open();
        storage.commit(&owner("alice", 0)).unwrap();
        let mut batch = WriteBatch::new();
        batch
            .put_peer("alice", peer("bob"))
            .put_sessions("alice", "bob", SessionSet::default())
            .put_sessions("alice", "bobby", SessionSet::default());
        storage.commit(&batch).unwrap();

        let mut delete = WriteBatch::new();
        delete.push(WriteOp::DeletePeer { owner: "alice".into(), peer: "bob".into() });
        storage.commit(&delete).unwrap();

        assert!(storage.load_peer("alice", "bob").is_none());
        assert!(!storage.has_sessions("alice", "bob"));
        assert!(storage.has_sessions("alice", "bobby"));
    });
}

#[test]
fn user_ids_sharing_a_prefix_stay_apart() {
    with_backends(|open| {
        let storage = open();
        storage.commit(&owner("al", 1)).unwrap();
        storage.commit(&owner("alice", 3)).unwrap();

        let mut delete = WriteBatch::new();
        delete.push(WriteOp::DeleteUser("al".into()));
        storage.commit(&delete).unwrap();

        assert_eq!(storage.one_time_prekey_ids("alice"), vec![0, 1, 2]);
        assert!(storage.load_user("alice").is_some());
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn backends_agree_on_prekey_churn(
        ops in prop::collection::vec((any::<bool>(), 0u32..16), 1..40),
    ) {
        let memory = MemoryStorage::new();
        let dir = tempfile::tempdir().unwrap();
        let redb = RedbStorage::open(dir.path().join("churn.redb")).unwrap();
        Storage::commit(&memory, &owner("alice", 0)).unwrap();
        Storage::commit(&redb, &owner("alice", 0)).unwrap();

        for (put, id) in ops {
            let mut batch = WriteBatch::new();
            if put {
                batch.push(WriteOp::PutOneTimePreKey { owner: "alice".into(), record: one_time_prekey(id) });
            } else {
                batch.push(WriteOp::DeleteOneTimePreKey { owner: "alice".into(), id });
            }
            Storage::commit(&memory, &batch).unwrap();
            Storage::commit(&redb, &batch).unwrap();
        }

        prop_assert_eq!(memory.one_time_prekey_ids("alice"), redb.one_time_prekey_ids("alice"));
    }
}
