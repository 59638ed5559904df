//! Identity and Diffie-Hellman key pairs
//!
//! A device identity is a single Ed25519 key. It signs prekeys and, through
//! the birational map between Edwards and Montgomery forms, also takes part in
//! X25519 key agreement. Prekeys and ratchet keys are plain X25519 key pairs.
//!
//! Key generation takes a caller-provided 32-byte seed so that tests can run
//! against a seeded environment.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::CryptoError;

/// Size of every public key handled by this crate
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature
pub const SIGNATURE_SIZE: usize = 64;

/// Long-term device identity (Ed25519).
pub struct IdentityKeyPair {
    signing: SigningKey,
}

impl IdentityKeyPair {
    /// Derive an identity from a 32-byte secret seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self { signing: SigningKey::from_bytes(seed) }
    }

    /// Secret seed, for persistence.
    pub fn to_seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Public half, published to the key server.
    pub fn public(&self) -> IdentityPublicKey {
        IdentityPublicKey(self.signing.verifying_key().to_bytes())
    }

    /// Sign a message with the identity key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }

    /// X25519 agreement using the Montgomery form of the identity key.
    pub fn agree(&self, peer: &[u8; PUBLIC_KEY_SIZE]) -> Result<[u8; 32], CryptoError> {
        let mut scalar = self.signing.to_scalar_bytes();
        let secret = StaticSecret::from(scalar);
        scalar.zeroize();
        agree_with(&secret, peer)
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair").field("public", &self.public()).finish_non_exhaustive()
    }
}

/// Public identity key bytes (Ed25519, compressed Edwards form).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityPublicKey(pub [u8; PUBLIC_KEY_SIZE]);

impl IdentityPublicKey {
    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Verify an identity signature.
    ///
    /// Uses strict verification: small-order keys and malleable signatures are
    /// rejected.
    pub fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_SIZE]) -> Result<(), CryptoError> {
        let key = self.verifying_key()?;
        key.verify_strict(message, &Signature::from_bytes(signature))
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// Montgomery (X25519) form of this identity key.
    pub fn to_x25519(&self) -> Result<[u8; PUBLIC_KEY_SIZE], CryptoError> {
        Ok(self.verifying_key()?.to_montgomery().to_bytes())
    }

    fn verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        VerifyingKey::from_bytes(&self.0).map_err(|e| CryptoError::InvalidKey {
            reason: format!("identity key does not decode: {e}"),
        })
    }
}

impl fmt::Debug for IdentityPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityPublicKey({:02x}{:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// X25519 key pair used for prekeys, ephemeral keys and ratchet keys.
#[derive(Clone)]
pub struct DhKeyPair {
    secret: StaticSecret,
    public: [u8; PUBLIC_KEY_SIZE],
}

impl DhKeyPair {
    /// Build a key pair from 32 secret bytes (clamped by X25519).
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let secret = StaticSecret::from(seed);
        let public = PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// Public key bytes.
    pub fn public(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public
    }

    /// Secret bytes, for persistence.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// X25519 agreement with a peer public key.
    pub fn agree(&self, peer: &[u8; PUBLIC_KEY_SIZE]) -> Result<[u8; 32], CryptoError> {
        agree_with(&self.secret, peer)
    }
}

impl fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhKeyPair").field("public", &self.public[..4].to_vec()).finish_non_exhaustive()
    }
}

/// Signature payload binding a signed prekey to its identity.
///
/// Both sides build the same bytes, so the signature also commits to the
/// prekey id.
pub fn signed_prekey_message(prekey_id: u32, prekey: &[u8; PUBLIC_KEY_SIZE]) -> [u8; 36] {
    let mut message = [0u8; 36];
    message[..4].copy_from_slice(&prekey_id.to_be_bytes());
    message[4..].copy_from_slice(prekey);
    message
}

fn agree_with(secret: &StaticSecret, peer: &[u8; PUBLIC_KEY_SIZE]) -> Result<[u8; 32], CryptoError> {
    let shared = secret.diffie_hellman(&PublicKey::from(*peer));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey { reason: "non-contributory key agreement".to_string() });
    }
    Ok(shared.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    #[test]
    fn identity_sign_and_verify() {
        let identity = IdentityKeyPair::from_seed(&seed(1));
        let signature = identity.sign(b"prekey bytes");

        identity.public().verify(b"prekey bytes", &signature).unwrap();
        assert_eq!(
            identity.public().verify(b"other bytes", &signature),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn identity_seed_roundtrip() {
        let identity = IdentityKeyPair::from_seed(&seed(7));
        let restored = IdentityKeyPair::from_seed(&identity.to_seed());
        assert_eq!(identity.public(), restored.public());
    }

    #[test]
    fn identity_agreement_matches_converted_public_key() {
        let alice = IdentityKeyPair::from_seed(&seed(2));
        let bob = DhKeyPair::from_seed(seed(3));

        let alice_side = alice.agree(&bob.public()).unwrap();
        let bob_side = bob.agree(&alice.public().to_x25519().unwrap()).unwrap();

        assert_eq!(alice_side, bob_side);
    }

    #[test]
    fn identity_to_identity_agreement() {
        let alice = IdentityKeyPair::from_seed(&seed(4));
        let bob = IdentityKeyPair::from_seed(&seed(5));

        let a = alice.agree(&bob.public().to_x25519().unwrap()).unwrap();
        let b = bob.agree(&alice.public().to_x25519().unwrap()).unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn dh_agreement_is_symmetric() {
        let a = DhKeyPair::from_seed(seed(8));
        let b = DhKeyPair::from_seed(seed(9));
        assert_eq!(a.agree(&b.public()).unwrap(), b.agree(&a.public()).unwrap());
    }

    #[test]
    fn low_order_point_is_rejected() {
        let a = DhKeyPair::from_seed(seed(10));
        let result = a.agree(&[0u8; 32]);
        assert!(matches!(result, Err(CryptoError::InvalidKey { .. })));
    }

    #[test]
    fn dh_secret_roundtrip() {
        let a = DhKeyPair::from_seed(seed(11));
        let restored = DhKeyPair::from_seed(a.secret_bytes());
        assert_eq!(a.public(), restored.public());
    }

    #[test]
    fn signed_prekey_message_commits_to_id() {
        let key = [0x42; 32];
        assert_ne!(signed_prekey_message(1, &key), signed_prekey_message(2, &key));
    }
}
