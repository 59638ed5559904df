//! X3DH key agreement
//!
//! Asynchronous bootstrap of a session secret from a peer's published bundle.
//!
//! ```text
//! DH1 = DH(IK_A, SPK_B)
//! DH2 = DH(EK_A, IK_B)
//! DH3 = DH(EK_A, SPK_B)
//! DH4 = DH(EK_A, OPK_B)      (only when the bundle carried a one-time prekey)
//! SK  = HKDF(0xFF*32 || DH1 || DH2 || DH3 [|| DH4])
//! ```
//!
//! The initiator verifies the signed prekey signature before any agreement.
//! The responder recomputes the same outputs from the ids referenced in the
//! initial message.

use std::fmt;

use zeroize::Zeroize;

use crate::{
    CryptoError,
    kdf::derive_x3dh_secret,
    keys::{DhKeyPair, IdentityKeyPair, IdentityPublicKey, PUBLIC_KEY_SIZE, SIGNATURE_SIZE, signed_prekey_message},
};

/// A peer's published key bundle, as fetched from the key server.
#[derive(Clone, PartialEq, Eq)]
pub struct PreKeyBundle {
    /// Peer's identity key
    pub identity_key: IdentityPublicKey,
    /// Id of the signed prekey
    pub signed_prekey_id: u32,
    /// Signed prekey public bytes
    pub signed_prekey: [u8; PUBLIC_KEY_SIZE],
    /// Identity signature over [`signed_prekey_message`]
    pub signed_prekey_signature: [u8; SIGNATURE_SIZE],
    /// One-time prekey, absent when the server ran out
    pub one_time_prekey: Option<(u32, [u8; PUBLIC_KEY_SIZE])>,
}

impl fmt::Debug for PreKeyBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreKeyBundle")
            .field("identity_key", &self.identity_key)
            .field("signed_prekey_id", &self.signed_prekey_id)
            .field("one_time_prekey_id", &self.one_time_prekey.map(|(id, _)| id))
            .finish_non_exhaustive()
    }
}

/// Values the initiator sends so the responder can rebuild the secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialKeys {
    /// Initiator's identity key
    pub identity_key: IdentityPublicKey,
    /// Initiator's ephemeral public key
    pub ephemeral_key: [u8; PUBLIC_KEY_SIZE],
    /// Responder's signed prekey used
    pub signed_prekey_id: u32,
    /// Responder's one-time prekey used, if any
    pub one_time_prekey_id: Option<u32>,
}

/// Initial session secret.
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    /// Secret bytes, fed into the Double Ratchet root chain.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Verify a bundle's signed prekey against its identity key.
pub fn verify_bundle(bundle: &PreKeyBundle) -> Result<(), CryptoError> {
    let message = signed_prekey_message(bundle.signed_prekey_id, &bundle.signed_prekey);
    bundle.identity_key.verify(&message, &bundle.signed_prekey_signature)
}

/// Initiator side: agree on a secret with a peer's bundle.
///
/// # Errors
///
/// - `InvalidSignature`: the signed prekey is not signed by the bundle's
///   identity key
/// - `InvalidKey`: a bundle key does not decode or yields a non-contributory
///   agreement
pub fn initiate(
    identity: &IdentityKeyPair,
    ephemeral: &DhKeyPair,
    bundle: &PreKeyBundle,
) -> Result<(SharedSecret, InitialKeys), CryptoError> {
    verify_bundle(bundle)?;

    let peer_identity = bundle.identity_key.to_x25519()?;

    let mut outputs = Vec::with_capacity(4);
    outputs.push(identity.agree(&bundle.signed_prekey)?);
    outputs.push(ephemeral.agree(&peer_identity)?);
    outputs.push(ephemeral.agree(&bundle.signed_prekey)?);
    if let Some((_, opk)) = &bundle.one_time_prekey {
        outputs.push(ephemeral.agree(opk)?);
    }

    let secret = SharedSecret(derive_x3dh_secret(&outputs));
    outputs.zeroize();

    let init = InitialKeys {
        identity_key: identity.public(),
        ephemeral_key: ephemeral.public(),
        signed_prekey_id: bundle.signed_prekey_id,
        one_time_prekey_id: bundle.one_time_prekey.map(|(id, _)| id),
    };

    Ok((secret, init))
}

/// Responder side: rebuild the initiator's secret from its initial keys.
///
/// The caller looks up the signed and one-time prekeys referenced by `init`;
/// `one_time_prekey` must be present exactly when `init` references one.
pub fn respond(
    identity: &IdentityKeyPair,
    signed_prekey: &DhKeyPair,
    one_time_prekey: Option<&DhKeyPair>,
    init: &InitialKeys,
) -> Result<SharedSecret, CryptoError> {
    if init.one_time_prekey_id.is_some() != one_time_prekey.is_some() {
        return Err(CryptoError::InvalidKey {
            reason: "one-time prekey presence does not match initial message".to_string(),
        });
    }

    let peer_identity = init.identity_key.to_x25519()?;

    let mut outputs = Vec::with_capacity(4);
    outputs.push(signed_prekey.agree(&peer_identity)?);
    outputs.push(identity.agree(&init.ephemeral_key)?);
    outputs.push(signed_prekey.agree(&init.ephemeral_key)?);
    if let Some(opk) = one_time_prekey {
        outputs.push(opk.agree(&init.ephemeral_key)?);
    }

    let secret = SharedSecret(derive_x3dh_secret(&outputs));
    outputs.zeroize();
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Responder {
        identity: IdentityKeyPair,
        spk: DhKeyPair,
        opk: DhKeyPair,
    }

    fn responder() -> Responder {
        Responder {
            identity: IdentityKeyPair::from_seed(&[0xB0; 32]),
            spk: DhKeyPair::from_seed([0xB1; 32]),
            opk: DhKeyPair::from_seed([0xB2; 32]),
        }
    }

    fn bundle(responder: &Responder, with_opk: bool) -> PreKeyBundle {
        let spk_public = responder.spk.public();
        PreKeyBundle {
            identity_key: responder.identity.public(),
            signed_prekey_id: 7,
            signed_prekey: spk_public,
            signed_prekey_signature: responder.identity.sign(&signed_prekey_message(7, &spk_public)),
            one_time_prekey: with_opk.then(|| (42, responder.opk.public())),
        }
    }

    #[test]
    fn both_sides_agree_with_one_time_prekey() {
        let bob = responder();
        let alice = IdentityKeyPair::from_seed(&[0xA0; 32]);
        let ephemeral = DhKeyPair::from_seed([0xA1; 32]);

        let (alice_secret, init) = initiate(&alice, &ephemeral, &bundle(&bob, true)).unwrap();
        assert_eq!(init.one_time_prekey_id, Some(42));
        assert_eq!(init.signed_prekey_id, 7);

        let bob_secret = respond(&bob.identity, &bob.spk, Some(&bob.opk), &init).unwrap();
        assert_eq!(alice_secret.as_bytes(), bob_secret.as_bytes());
    }

    #[test]
    fn both_sides_agree_without_one_time_prekey() {
        let bob = responder();
        let alice = IdentityKeyPair::from_seed(&[0xA0; 32]);
        let ephemeral = DhKeyPair::from_seed([0xA1; 32]);

        let (alice_secret, init) = initiate(&alice, &ephemeral, &bundle(&bob, false)).unwrap();
        assert_eq!(init.one_time_prekey_id, None);

        let bob_secret = respond(&bob.identity, &bob.spk, None, &init).unwrap();
        assert_eq!(alice_secret.as_bytes(), bob_secret.as_bytes());
    }

    #[test]
    fn one_time_prekey_changes_secret() {
        let bob = responder();
        let alice = IdentityKeyPair::from_seed(&[0xA0; 32]);
        let ephemeral = DhKeyPair::from_seed([0xA1; 32]);

        let (with, _) = initiate(&alice, &ephemeral, &bundle(&bob, true)).unwrap();
        let (without, _) = initiate(&alice, &ephemeral, &bundle(&bob, false)).unwrap();
        assert_ne!(with.as_bytes(), without.as_bytes());
    }

    #[test]
    fn forged_signature_is_rejected() {
        let bob = responder();
        let alice = IdentityKeyPair::from_seed(&[0xA0; 32]);
        let ephemeral = DhKeyPair::from_seed([0xA1; 32]);

        let mut forged = bundle(&bob, true);
        forged.signed_prekey = DhKeyPair::from_seed([0xEE; 32]).public();

        let result = initiate(&alice, &ephemeral, &forged);
        assert!(matches!(result, Err(CryptoError::InvalidSignature)));
    }

    #[test]
    fn signature_from_other_identity_is_rejected() {
        let bob = responder();
        let mallory = IdentityKeyPair::from_seed(&[0xCC; 32]);

        let mut forged = bundle(&bob, false);
        forged.identity_key = mallory.public();

        assert_eq!(verify_bundle(&forged), Err(CryptoError::InvalidSignature));
    }

    #[test]
    fn responder_rejects_missing_one_time_prekey() {
        let bob = responder();
        let alice = IdentityKeyPair::from_seed(&[0xA0; 32]);
        let ephemeral = DhKeyPair::from_seed([0xA1; 32]);

        let (_, init) = initiate(&alice, &ephemeral, &bundle(&bob, true)).unwrap();
        let result = respond(&bob.identity, &bob.spk, None, &init);
        assert!(matches!(result, Err(CryptoError::InvalidKey { .. })));
    }

    #[test]
    fn wrong_signed_prekey_gives_different_secret() {
        let bob = responder();
        let alice = IdentityKeyPair::from_seed(&[0xA0; 32]);
        let ephemeral = DhKeyPair::from_seed([0xA1; 32]);

        let (alice_secret, init) = initiate(&alice, &ephemeral, &bundle(&bob, false)).unwrap();
        let rotated = DhKeyPair::from_seed([0xB9; 32]);
        let bob_secret = respond(&bob.identity, &rotated, None, &init).unwrap();

        assert_ne!(alice_secret.as_bytes(), bob_secret.as_bytes());
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let secret = SharedSecret([0xAB; 32]);
        assert_eq!(format!("{secret:?}"), "SharedSecret(..)");
    }
}
