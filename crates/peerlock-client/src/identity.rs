//! Local identity material and prekey generation.

use peerlock_core::{
    EngineError, Environment, LocalUserRecord, OneTimePreKeyRecord, SignedPreKeyRecord, Storage,
};
use peerlock_crypto::{DhKeyPair, IdentityKeyPair, keys::signed_prekey_message};
use peerlock_proto::{OneTimePreKeyData, SignedPreKeyData};

/// A loaded local user with its identity key pair.
pub(crate) struct LocalIdentity {
    pub(crate) record: LocalUserRecord,
    pub(crate) keys: IdentityKeyPair,
}

impl LocalIdentity {
    /// Load a local user.
    ///
    /// # Errors
    ///
    /// `UserNotFound` if no such user exists.
    pub(crate) fn load<S: Storage>(storage: &S, device_id: &str) -> Result<Self, EngineError> {
        let record = storage
            .load_user(device_id)?
            .ok_or_else(|| EngineError::UserNotFound { device_id: device_id.to_string() })?;
        let keys = IdentityKeyPair::from_seed(&record.identity_seed);
        Ok(Self { record, keys })
    }

    pub(crate) fn device_id(&self) -> &str {
        &self.record.device_id
    }

    pub(crate) fn public(&self) -> [u8; 32] {
        self.record.identity_public
    }
}

/// Generate a signed prekey whose id is not in `taken`.
pub(crate) fn generate_signed_prekey<E: Environment>(
    env: &E,
    identity: &IdentityKeyPair,
    taken: &[u32],
    now: u64,
) -> SignedPreKeyRecord {
    let id = fresh_id(env, taken);
    let pair = DhKeyPair::from_seed(env.random_seed());
    let public = pair.public();
    let signature = identity.sign(&signed_prekey_message(id, &public));

    SignedPreKeyRecord {
        id,
        seed: pair.secret_bytes(),
        public,
        signature: signature.to_vec(),
        created_at: now,
        retired_at: None,
        accepted_ephemerals: Vec::new(),
    }
}

/// Generate `count` one-time prekeys with ids not in `taken`.
pub(crate) fn generate_one_time_prekeys<E: Environment>(
    env: &E,
    taken: &[u32],
    count: usize,
) -> Vec<OneTimePreKeyRecord> {
    let mut used: Vec<u32> = taken.to_vec();
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let id = fresh_id(env, &used);
        used.push(id);
        let pair = DhKeyPair::from_seed(env.random_seed());
        records.push(OneTimePreKeyRecord {
            id,
            seed: pair.secret_bytes(),
            public: pair.public(),
            dispatched_at: None,
        });
    }
    records
}

/// Wire form of a signed prekey.
pub(crate) fn signed_prekey_data(record: &SignedPreKeyRecord) -> SignedPreKeyData {
    SignedPreKeyData {
        id: record.id,
        public_key: record.public.to_vec(),
        signature: record.signature.clone(),
    }
}

/// Wire form of a one-time prekey.
pub(crate) fn one_time_prekey_data(record: &OneTimePreKeyRecord) -> OneTimePreKeyData {
    OneTimePreKeyData { id: record.id, public_key: record.public.to_vec() }
}

/// Random non-zero prekey id not in `taken`.
fn fresh_id<E: Environment>(env: &E, taken: &[u32]) -> u32 {
    loop {
        let id = env.random_u32() & 0x7FFF_FFFF;
        if id != 0 && !taken.contains(&id) {
            return id;
        }
    }
}

/// Reject device ids storage keys cannot represent.
pub(crate) fn validate_device_id(device_id: &str) -> Result<(), EngineError> {
    if device_id.is_empty() {
        return Err(EngineError::invalid_input("device id is empty"));
    }
    if device_id.len() > 255 {
        return Err(EngineError::invalid_input("device id longer than 255 bytes"));
    }
    if device_id.contains('\0') {
        return Err(EngineError::invalid_input("device id contains a NUL byte"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use peerlock_crypto::IdentityPublicKey;

    use super::*;
    use crate::test_support::CounterEnv;

    #[test]
    fn signed_prekey_signature_verifies() {
        let env = CounterEnv::default();
        let identity = IdentityKeyPair::from_seed(&[9; 32]);
        let spk = generate_signed_prekey(&env, &identity, &[], 1_000);

        let signature: [u8; 64] = spk.signature.as_slice().try_into().unwrap();
        let public: IdentityPublicKey = identity.public();
        public.verify(&signed_prekey_message(spk.id, &spk.public), &signature).unwrap();
        assert!(spk.is_current());
    }

    #[test]
    fn one_time_prekey_ids_are_unique() {
        let env = CounterEnv::default();
        let keys = generate_one_time_prekeys(&env, &[], 50);

        let mut ids: Vec<u32> = keys.iter().map(|k| k.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 50);
        assert!(ids.iter().all(|&id| id != 0));
    }

    #[test]
    fn device_id_validation() {
        assert!(validate_device_id("alice.dev1").is_ok());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("a\0b").is_err());
        assert!(validate_device_id(&"x".repeat(256)).is_err());
    }
}
