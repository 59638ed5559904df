//! Lock tables for per-user and per-session serialization.
//!
//! - Lifecycle gate, one `RwLock` per local user. Every operation on a user
//!   holds it shared; `delete_user` holds it exclusively, so deletion waits
//!   for in-flight work and later work observes the deletion.
//! - Prekey lock, one `Mutex` per local user, around read-modify-write of
//!   prekey records (one-time prekey consumption, `update`).
//! - Session lock, one `Mutex` per (local user, peer device). At most one
//!   ratchet-advancing operation runs per session.
//!
//! Lock order is gate, then session locks (sorted), then prekey lock.
//! Independent pairs never contend. Session entries are dropped as soon as
//! the last guard or waiter lets go; user entries are pruned by `update`.

#![allow(clippy::disallowed_types, reason = "Map guards are never held across await")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::{
    Mutex as AsyncMutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
};

#[derive(Default)]
struct UserLocks {
    gate: Arc<RwLock<()>>,
    prekeys: Arc<AsyncMutex<()>>,
}

type SessionLocks = Mutex<HashMap<(String, String), Arc<AsyncMutex<()>>>>;

/// Lock tables shared by every engine task.
#[derive(Default)]
pub(crate) struct LockTable {
    users: Mutex<HashMap<String, Arc<UserLocks>>>,
    sessions: Arc<SessionLocks>,
}

/// Guards for every session an operation touches.
///
/// Dropping them releases the locks and removes the table entries nobody
/// else holds or waits on.
pub(crate) struct SessionGuards {
    guards: Vec<OwnedMutexGuard<()>>,
    keys: Vec<(String, String)>,
    table: Arc<SessionLocks>,
}

impl Drop for SessionGuards {
    #[allow(clippy::expect_used)]
    fn drop(&mut self) {
        // Each guard owns a reference to its lock; release them first.
        self.guards.clear();

        let mut sessions = self.table.lock().expect("lock table poisoned");
        for key in &self.keys {
            if sessions.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                sessions.remove(key);
            }
        }
    }
}

impl LockTable {
    #[allow(clippy::expect_used)]
    fn user(&self, device_id: &str) -> Arc<UserLocks> {
        let mut users = self.users.lock().expect("lock table poisoned");
        Arc::clone(users.entry(device_id.to_string()).or_default())
    }

    #[allow(clippy::expect_used)]
    fn session(&self, owner: &str, peer: &str) -> Arc<AsyncMutex<()>> {
        let mut sessions = self.sessions.lock().expect("lock table poisoned");
        Arc::clone(sessions.entry((owner.to_string(), peer.to_string())).or_default())
    }

    /// Shared hold on a user's lifecycle gate.
    pub(crate) async fn read_user(&self, device_id: &str) -> OwnedRwLockReadGuard<()> {
        Arc::clone(&self.user(device_id).gate).read_owned().await
    }

    /// Exclusive hold on a user's lifecycle gate.
    pub(crate) async fn write_user(&self, device_id: &str) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.user(device_id).gate).write_owned().await
    }

    /// Exclusive hold on a user's prekey records.
    pub(crate) async fn prekeys(&self, device_id: &str) -> OwnedMutexGuard<()> {
        Arc::clone(&self.user(device_id).prekeys).lock_owned().await
    }

    /// Exclusive hold on the sessions between `owner` and each of `peers`.
    ///
    /// Locks are taken in sorted order so concurrent multi-recipient calls
    /// cannot deadlock.
    pub(crate) async fn sessions(&self, owner: &str, peers: &[String]) -> SessionGuards {
        let mut sorted: Vec<&String> = peers.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut guards = SessionGuards {
            guards: Vec::with_capacity(sorted.len()),
            keys: Vec::with_capacity(sorted.len()),
            table: Arc::clone(&self.sessions),
        };
        for peer in sorted {
            let lock = self.session(owner, peer);
            guards.keys.push((owner.to_string(), peer.clone()));
            guards.guards.push(lock.lock_owned().await);
        }
        guards
    }

    /// Drop table entries nobody holds or waits on.
    #[allow(clippy::expect_used)]
    pub(crate) fn prune(&self) {
        self.users
            .lock()
            .expect("lock table poisoned")
            .retain(|_, locks| Arc::strong_count(locks) > 1 || is_busy(locks));
        self.sessions
            .lock()
            .expect("lock table poisoned")
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

fn is_busy(locks: &UserLocks) -> bool {
    Arc::strong_count(&locks.gate) > 1 || Arc::strong_count(&locks.prekeys) > 1
}
