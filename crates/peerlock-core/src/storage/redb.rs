//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. A
//! `commit` is one write transaction, so a batch is either fully durable or
//! absent after a crash. All state survives process restarts.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, Table, TableDefinition, WriteTransaction};
use serde::{Serialize, de::DeserializeOwned};

use super::{Storage, StorageError, WriteBatch, WriteOp};
use crate::records::{
    LocalUserRecord, OneTimePreKeyRecord, PeerDeviceRecord, SessionSet, SignedPreKeyRecord,
};

/// Table: users
/// Key: device id bytes
/// Value: CBOR-encoded LocalUserRecord
const USERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("users");

/// Table: signed_prekeys
/// Key: owner || 0x00 || prekey id (4 bytes BE)
/// Value: CBOR-encoded SignedPreKeyRecord
const SIGNED_PREKEYS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("signed_prekeys");

/// Table: one_time_prekeys
/// Key: owner || 0x00 || prekey id (4 bytes BE)
/// Value: CBOR-encoded OneTimePreKeyRecord
const ONE_TIME_PREKEYS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("one_time_prekeys");

/// Table: peers
/// Key: owner || 0x00 || peer device id
/// Value: CBOR-encoded PeerDeviceRecord
const PEERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("peers");

/// Table: sessions
/// Key: owner || 0x00 || peer device id
/// Value: CBOR-encoded SessionSet
const SESSIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("sessions");

/// Tables keyed by owner prefix, wiped when a user is deleted.
const OWNED_TABLES: [TableDefinition<&[u8], &[u8]>; 4] =
    [SIGNED_PREKEYS, ONE_TIME_PREKEYS, PEERS, SESSIONS];

type BytesTable<'txn> = Table<'txn, &'static [u8], &'static [u8]>;

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let db = Database::create(path).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(USERS).map_err(|e| StorageError::Io(e.to_string()))?;
            for table in OWNED_TABLES {
                let _ = txn.open_table(table).map_err(|e| StorageError::Io(e.to_string()))?;
            }
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        tracing::debug!("opened engine store at {}", path.display());
        Ok(Self { db: Arc::new(db) })
    }

    fn read_one<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        key: &[u8],
    ) -> Result<Option<T>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(table).map_err(|e| StorageError::Io(e.to_string()))?;
        get_record(&table, key)
    }

    fn read_owned<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        owner: &str,
    ) -> Result<Vec<(Vec<u8>, T)>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(table).map_err(|e| StorageError::Io(e.to_string()))?;

        let (start, end) = owner_range(owner);
        let results = table
            .range(start.as_slice()..end.as_slice())
            .map_err(|e| StorageError::Io(e.to_string()))?;

        let mut records = Vec::new();
        for result in results {
            let (key, value) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            let record: T = ciborium::from_reader(value.value())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            records.push((key.value()[start.len()..].to_vec(), record));
        }
        Ok(records)
    }
}

impl Storage for RedbStorage {
    fn load_user(&self, device_id: &str) -> Result<Option<LocalUserRecord>, StorageError> {
        self.read_one(USERS, device_id.as_bytes())
    }

    fn list_users(&self) -> Result<Vec<String>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(USERS).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut users = Vec::new();
        for result in table.iter().map_err(|e| StorageError::Io(e.to_string()))? {
            let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            let device_id = String::from_utf8(key.value().to_vec())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            users.push(device_id);
        }
        Ok(users)
    }

    fn load_signed_prekeys(&self, owner: &str) -> Result<Vec<SignedPreKeyRecord>, StorageError> {
        Ok(self.read_owned(SIGNED_PREKEYS, owner)?.into_iter().map(|(_, r)| r).collect())
    }

    fn load_one_time_prekeys(
        &self,
        owner: &str,
    ) -> Result<Vec<OneTimePreKeyRecord>, StorageError> {
        Ok(self.read_owned(ONE_TIME_PREKEYS, owner)?.into_iter().map(|(_, r)| r).collect())
    }

    fn load_one_time_prekey(
        &self,
        owner: &str,
        id: u32,
    ) -> Result<Option<OneTimePreKeyRecord>, StorageError> {
        self.read_one(ONE_TIME_PREKEYS, &owned_key(owner, &id.to_be_bytes()))
    }

    fn load_peer(&self, owner: &str, peer: &str) -> Result<Option<PeerDeviceRecord>, StorageError> {
        self.read_one(PEERS, &owned_key(owner, peer.as_bytes()))
    }

    fn load_sessions(&self, owner: &str, peer: &str) -> Result<Option<SessionSet>, StorageError> {
        self.read_one(SESSIONS, &owned_key(owner, peer.as_bytes()))
    }

    fn list_session_peers(&self, owner: &str) -> Result<Vec<String>, StorageError> {
        self.read_owned::<SessionSet>(SESSIONS, owner)?
            .into_iter()
            .map(|(suffix, _)| {
                String::from_utf8(suffix).map_err(|e| StorageError::Serialization(e.to_string()))
            })
            .collect()
    }

    fn commit(&self, batch: &WriteBatch) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        match apply_batch(&txn, batch) {
            Ok(()) => txn.commit().map_err(|e| StorageError::Io(e.to_string())),
            Err(err) => {
                txn.abort().map_err(|e| StorageError::Io(e.to_string()))?;
                Err(err)
            },
        }
    }
}

/// Apply every write inside one transaction. Tables are closed on return so
/// the caller can commit or abort.
fn apply_batch(txn: &WriteTransaction, batch: &WriteBatch) -> Result<(), StorageError> {
    let mut users = txn.open_table(USERS).map_err(|e| StorageError::Io(e.to_string()))?;

    for op in batch.ops() {
        let owner = op.owner();
        let exists = users
            .get(owner.as_bytes())
            .map_err(|e| StorageError::Io(e.to_string()))?
            .is_some();

        match op {
            WriteOp::InsertUser(record) => {
                if exists {
                    return Err(StorageError::Conflict { device_id: owner.to_string() });
                }
                put_record(&mut users, owner.as_bytes(), record)?;
                continue;
            },
            WriteOp::DeleteUser(_) => {
                users.remove(owner.as_bytes()).map_err(|e| StorageError::Io(e.to_string()))?;
                for table in OWNED_TABLES {
                    let mut table =
                        txn.open_table(table).map_err(|e| StorageError::Io(e.to_string()))?;
                    remove_owned(&mut table, owner)?;
                }
                continue;
            },
            _ => {},
        }

        if !exists {
            return Err(StorageError::NotFound { device_id: owner.to_string() });
        }

        match op {
            WriteOp::PutUser(record) => put_record(&mut users, owner.as_bytes(), record)?,
            WriteOp::PutSignedPreKey { record, .. } => {
                let mut table =
                    txn.open_table(SIGNED_PREKEYS).map_err(|e| StorageError::Io(e.to_string()))?;
                put_record(&mut table, &owned_key(owner, &record.id.to_be_bytes()), record)?;
            },
            WriteOp::DeleteSignedPreKey { id, .. } => {
                let mut table =
                    txn.open_table(SIGNED_PREKEYS).map_err(|e| StorageError::Io(e.to_string()))?;
                remove_key(&mut table, &owned_key(owner, &id.to_be_bytes()))?;
            },
            WriteOp::PutOneTimePreKey { record, .. } => {
                let mut table = txn
                    .open_table(ONE_TIME_PREKEYS)
                    .map_err(|e| StorageError::Io(e.to_string()))?;
                put_record(&mut table, &owned_key(owner, &record.id.to_be_bytes()), record)?;
            },
            WriteOp::DeleteOneTimePreKey { id, .. } => {
                let mut table = txn
                    .open_table(ONE_TIME_PREKEYS)
                    .map_err(|e| StorageError::Io(e.to_string()))?;
                remove_key(&mut table, &owned_key(owner, &id.to_be_bytes()))?;
            },
            WriteOp::PutPeer { record, .. } => {
                let mut table =
                    txn.open_table(PEERS).map_err(|e| StorageError::Io(e.to_string()))?;
                put_record(&mut table, &owned_key(owner, record.device_id.as_bytes()), record)?;
            },
            WriteOp::DeletePeer { peer, .. } => {
                let key = owned_key(owner, peer.as_bytes());
                for definition in [PEERS, SESSIONS] {
                    let mut table =
                        txn.open_table(definition).map_err(|e| StorageError::Io(e.to_string()))?;
                    remove_key(&mut table, &key)?;
                }
            },
            WriteOp::PutSessions { peer, sessions, .. } => {
                let mut table =
                    txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;
                let key = owned_key(owner, peer.as_bytes());
                if sessions.is_empty() {
                    remove_key(&mut table, &key)?;
                } else {
                    put_record(&mut table, &key, sessions)?;
                }
            },
            WriteOp::InsertUser(_) | WriteOp::DeleteUser(_) => {},
        }
    }
    Ok(())
}

fn get_record<T, R>(table: &R, key: &[u8]) -> Result<Option<T>, StorageError>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static [u8], &'static [u8]>,
{
    match table.get(key).map_err(|e| StorageError::Io(e.to_string()))? {
        Some(value) => {
            let record: T = ciborium::from_reader(value.value())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            Ok(Some(record))
        },
        None => Ok(None),
    }
}

fn put_record<T: Serialize>(
    table: &mut BytesTable<'_>,
    key: &[u8],
    record: &T,
) -> Result<(), StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(record, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    table.insert(key, bytes.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
    Ok(())
}

fn remove_key(table: &mut BytesTable<'_>, key: &[u8]) -> Result<(), StorageError> {
    table.remove(key).map_err(|e| StorageError::Io(e.to_string()))?;
    Ok(())
}

fn remove_owned(table: &mut BytesTable<'_>, owner: &str) -> Result<(), StorageError> {
    let (start, end) = owner_range(owner);
    let mut keys = Vec::new();
    for result in
        table.range(start.as_slice()..end.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?
    {
        let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
        keys.push(key.value().to_vec());
    }
    for key in keys {
        remove_key(table, &key)?;
    }
    Ok(())
}

/// Encode an owner-scoped key.
///
/// Layout: [owner bytes][0x00][suffix]. Device ids never contain NUL, so
/// every key of one owner sorts inside `owner_range(owner)`.
fn owned_key(owner: &str, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(owner.len() + 1 + suffix.len());
    key.extend_from_slice(owner.as_bytes());
    key.push(0x00);
    key.extend_from_slice(suffix);
    key
}

/// Half-open key range `[owner || 0x00, owner || 0x01)`.
fn owner_range(owner: &str) -> (Vec<u8>, Vec<u8>) {
    let start = owned_key(owner, &[]);
    let mut end = owner.as_bytes().to_vec();
    end.push(0x01);
    (start, end)
}
