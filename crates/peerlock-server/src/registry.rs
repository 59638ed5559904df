//! Bundle registry for storing and handing out device prekey bundles.
//!
//! One entry per registered device: identity key, current signed prekey and
//! a queue of one-time prekeys. Each one-time prekey is handed out at most
//! once; a bundle fetched after the queue runs dry carries none. The queue is
//! capped per device, evicting the oldest keys first.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use peerlock_crypto::{IdentityPublicKey, keys::signed_prekey_message};
use peerlock_proto::{OneTimePreKeyData, PeerBundle, SignedPreKeyData, key_server::fixed_bytes};

use crate::error::RegistryError;

/// Default maximum number of one-time prekeys held per device.
pub const DEFAULT_MAX_ONE_TIME_PREKEYS: usize = 10_000;

/// Result of a one-time prekey upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResult {
    /// Every key was stored.
    Success,
    /// Keys were stored and this many older ones were evicted.
    Evicted(usize),
}

/// Registration of one device.
#[derive(Debug, Clone)]
struct DeviceEntry {
    identity_key: [u8; 32],
    signed_prekey: SignedPreKeyData,
    /// Oldest at the front; bundles hand out from the front
    one_time_prekeys: VecDeque<OneTimePreKeyData>,
}

/// In-memory registry of device bundles.
///
/// Thread-safe via Arc<Mutex<_>>. Clone shares the same underlying storage.
#[derive(Clone)]
pub struct BundleRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

struct RegistryInner {
    devices: HashMap<String, DeviceEntry>,
    max_one_time_prekeys: usize,
}

impl Default for BundleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BundleRegistry {
    /// Create an empty registry with the default per-device cap.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ONE_TIME_PREKEYS)
    }

    /// Create an empty registry holding at most `max_one_time_prekeys` per
    /// device.
    pub fn with_capacity(max_one_time_prekeys: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                devices: HashMap::new(),
                max_one_time_prekeys,
            })),
        }
    }

    /// Register a device.
    ///
    /// # Errors
    ///
    /// - `AlreadyRegistered` if the device exists
    /// - `InvalidSignature` if the signed prekey is not signed by
    ///   `identity_key`
    /// - `BadRequest` for keys of the wrong length
    pub fn register(
        &self,
        device_id: &str,
        identity_key: &[u8],
        signed_prekey: SignedPreKeyData,
        one_time_prekeys: Vec<OneTimePreKeyData>,
    ) -> Result<StoreResult, RegistryError> {
        let identity_key: [u8; 32] = fixed_bytes("identity_key", identity_key)
            .map_err(|e| RegistryError::BadRequest(e.to_string()))?;
        verify_signed_prekey(device_id, &identity_key, &signed_prekey)?;
        check_one_time_prekeys(&one_time_prekeys)?;

        let mut inner = self.inner.lock().expect("BundleRegistry mutex poisoned");
        if inner.devices.contains_key(device_id) {
            return Err(RegistryError::AlreadyRegistered { device_id: device_id.to_string() });
        }

        let mut entry =
            DeviceEntry { identity_key, signed_prekey, one_time_prekeys: VecDeque::new() };
        let result = push_capped(&mut entry, one_time_prekeys, inner.max_one_time_prekeys);
        inner.devices.insert(device_id.to_string(), entry);
        Ok(result)
    }

    /// Remove a device and all its keys.
    ///
    /// # Errors
    ///
    /// `NotRegistered` if the device does not exist.
    pub fn remove(&self, device_id: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().expect("BundleRegistry mutex poisoned");
        if inner.devices.remove(device_id).is_none() {
            return Err(RegistryError::NotRegistered { device_id: device_id.to_string() });
        }
        Ok(())
    }

    /// Replace a device's signed prekey.
    ///
    /// # Errors
    ///
    /// `NotRegistered` or `InvalidSignature`.
    pub fn replace_signed_prekey(
        &self,
        device_id: &str,
        signed_prekey: SignedPreKeyData,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().expect("BundleRegistry mutex poisoned");
        let entry = registered_mut(inner.devices.get_mut(device_id), device_id)?;
        verify_signed_prekey(device_id, &entry.identity_key, &signed_prekey)?;
        entry.signed_prekey = signed_prekey;
        Ok(())
    }

    /// Append one-time prekeys to a device's queue.
    ///
    /// # Errors
    ///
    /// `NotRegistered` or `BadRequest` for malformed keys.
    pub fn add_one_time_prekeys(
        &self,
        device_id: &str,
        one_time_prekeys: Vec<OneTimePreKeyData>,
    ) -> Result<StoreResult, RegistryError> {
        check_one_time_prekeys(&one_time_prekeys)?;

        let mut inner = self.inner.lock().expect("BundleRegistry mutex poisoned");
        let max = inner.max_one_time_prekeys;
        let entry = registered_mut(inner.devices.get_mut(device_id), device_id)?;
        Ok(push_capped(entry, one_time_prekeys, max))
    }

    /// Bundle for `device_id`, consuming one one-time prekey if any is left.
    ///
    /// `None` if the device is not registered.
    pub fn take_bundle(&self, device_id: &str) -> Option<PeerBundle> {
        let mut inner = self.inner.lock().expect("BundleRegistry mutex poisoned");
        let entry = inner.devices.get_mut(device_id)?;

        Some(PeerBundle {
            device_id: device_id.to_string(),
            identity_key: entry.identity_key.to_vec(),
            signed_prekey: entry.signed_prekey.clone(),
            one_time_prekey: entry.one_time_prekeys.pop_front(),
        })
    }

    /// Ids of the one-time prekeys a device still has on the server.
    ///
    /// # Errors
    ///
    /// `NotRegistered`.
    pub fn one_time_prekey_ids(&self, device_id: &str) -> Result<Vec<u32>, RegistryError> {
        let inner = self.inner.lock().expect("BundleRegistry mutex poisoned");
        let entry = registered(inner.devices.get(device_id), device_id)?;
        Ok(entry.one_time_prekeys.iter().map(|opk| opk.id).collect())
    }

    /// Whether a device is registered.
    pub fn is_registered(&self, device_id: &str) -> bool {
        let inner = self.inner.lock().expect("BundleRegistry mutex poisoned");
        inner.devices.contains_key(device_id)
    }

    /// Number of registered devices.
    pub fn device_count(&self) -> usize {
        let inner = self.inner.lock().expect("BundleRegistry mutex poisoned");
        inner.devices.len()
    }

    /// Signed prekey id currently served for a device.
    pub fn signed_prekey_id(&self, device_id: &str) -> Option<u32> {
        let inner = self.inner.lock().expect("BundleRegistry mutex poisoned");
        inner.devices.get(device_id).map(|entry| entry.signed_prekey.id)
    }
}

fn verify_signed_prekey(
    device_id: &str,
    identity_key: &[u8; 32],
    signed_prekey: &SignedPreKeyData,
) -> Result<(), RegistryError> {
    let public: [u8; 32] = fixed_bytes("signed_prekey", &signed_prekey.public_key)
        .map_err(|e| RegistryError::BadRequest(e.to_string()))?;
    let signature: [u8; 64] = fixed_bytes("signature", &signed_prekey.signature)
        .map_err(|e| RegistryError::BadRequest(e.to_string()))?;

    IdentityPublicKey(*identity_key)
        .verify(&signed_prekey_message(signed_prekey.id, &public), &signature)
        .map_err(|_| RegistryError::InvalidSignature { device_id: device_id.to_string() })
}

fn check_one_time_prekeys(keys: &[OneTimePreKeyData]) -> Result<(), RegistryError> {
    for key in keys {
        fixed_bytes::<32>("one_time_prekey", &key.public_key)
            .map_err(|e| RegistryError::BadRequest(e.to_string()))?;
    }
    Ok(())
}

fn registered<'a>(
    entry: Option<&'a DeviceEntry>,
    device_id: &str,
) -> Result<&'a DeviceEntry, RegistryError> {
    entry.ok_or_else(|| RegistryError::NotRegistered { device_id: device_id.to_string() })
}

fn registered_mut<'a>(
    entry: Option<&'a mut DeviceEntry>,
    device_id: &str,
) -> Result<&'a mut DeviceEntry, RegistryError> {
    entry.ok_or_else(|| RegistryError::NotRegistered { device_id: device_id.to_string() })
}

/// Append keys, replacing same-id keys and evicting the oldest over `max`.
fn push_capped(entry: &mut DeviceEntry, keys: Vec<OneTimePreKeyData>, max: usize) -> StoreResult {
    for key in keys {
        entry.one_time_prekeys.retain(|existing| existing.id != key.id);
        entry.one_time_prekeys.push_back(key);
    }

    let mut evicted = 0;
    while entry.one_time_prekeys.len() > max {
        entry.one_time_prekeys.pop_front();
        evicted += 1;
    }

    if evicted == 0 { StoreResult::Success } else { StoreResult::Evicted(evicted) }
}
