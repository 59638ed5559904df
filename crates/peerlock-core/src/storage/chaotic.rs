//! Fault injection for storage.
//!
//! An engine operation that sees a failed read or a failed commit must leave
//! stored state exactly as it found it. Chaos tests run whole conversations
//! through [`ChaoticStorage`] and then check the inner storage is coherent.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use super::{Storage, StorageError, WriteBatch};
use crate::records::{
    LocalUserRecord, OneTimePreKeyRecord, PeerDeviceRecord, SessionSet, SignedPreKeyRecord,
};

/// Storage wrapper that fails a seeded fraction of calls.
///
/// A failing call never reaches the inner storage, so an injected `commit`
/// failure means the whole batch was dropped. Clones share the RNG and the
/// call counter.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Probability in [0.0, 1.0] that a call fails
    failure_rate: f64,
    /// Only `commit` is subject to failure
    writes_only: bool,
    rng: Arc<Mutex<FaultDice>>,
    calls: Arc<AtomicUsize>,
}

/// SplitMix64, enough for reproducible fault schedules.
struct FaultDice {
    state: u64,
}

impl FaultDice {
    fn roll(&mut self) -> f64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        // 53 high bits give a uniform f64 in [0, 1)
        (z >> 11) as f64 / (1u64 << 53) as f64
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Wrap `inner` with a fixed default seed.
    ///
    /// # Panics
    ///
    /// If `failure_rate` is outside [0.0, 1.0].
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x5EED_0FC4_A05D_0001)
    }

    /// Wrap `inner`; the same seed yields the same failure schedule.
    ///
    /// # Panics
    ///
    /// If `failure_rate` is outside [0.0, 1.0].
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            writes_only: false,
            rng: Arc::new(Mutex::new(FaultDice { state: seed })),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Restrict failures to `commit`; reads always succeed.
    #[must_use]
    pub fn writes_only(mut self) -> Self {
        self.writes_only = true;
        self
    }

    /// The wrapped storage, for inspecting what actually landed.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Calls made through this wrapper, failed ones included.
    pub fn operation_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn inject(&self, is_write: bool) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.writes_only && !is_write {
            return Ok(());
        }

        let roll = self.rng.lock().unwrap_or_else(PoisonError::into_inner).roll();
        if roll < self.failure_rate {
            let kind = if is_write { "write" } else { "read" };
            return Err(StorageError::Io(format!("injected {kind} failure")));
        }
        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn load_user(&self, device_id: &str) -> Result<Option<LocalUserRecord>, StorageError> {
        self.inject(false)?;
        self.inner.load_user(device_id)
    }

    fn list_users(&self) -> Result<Vec<String>, StorageError> {
        self.inject(false)?;
        self.inner.list_users()
    }

    fn load_signed_prekeys(&self, owner: &str) -> Result<Vec<SignedPreKeyRecord>, StorageError> {
        self.inject(false)?;
        self.inner.load_signed_prekeys(owner)
    }

    fn load_one_time_prekeys(
        &self,
        owner: &str,
    ) -> Result<Vec<OneTimePreKeyRecord>, StorageError> {
        self.inject(false)?;
        self.inner.load_one_time_prekeys(owner)
    }

    fn load_one_time_prekey(
        &self,
        owner: &str,
        id: u32,
    ) -> Result<Option<OneTimePreKeyRecord>, StorageError> {
        self.inject(false)?;
        self.inner.load_one_time_prekey(owner, id)
    }

    fn load_peer(&self, owner: &str, peer: &str) -> Result<Option<PeerDeviceRecord>, StorageError> {
        self.inject(false)?;
        self.inner.load_peer(owner, peer)
    }

    fn load_sessions(&self, owner: &str, peer: &str) -> Result<Option<SessionSet>, StorageError> {
        self.inject(false)?;
        self.inner.load_sessions(owner, peer)
    }

    fn list_session_peers(&self, owner: &str) -> Result<Vec<String>, StorageError> {
        self.inject(false)?;
        self.inner.list_session_peers(owner)
    }

    fn commit(&self, batch: &WriteBatch) -> Result<(), StorageError> {
        self.inject(true)?;
        self.inner.commit(batch)
    }
}
