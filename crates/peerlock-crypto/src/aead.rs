//! Authenticated encryption using `XChaCha20-Poly1305`
//!
//! Keys and nonces are always derived from a single-use secret (a ratchet
//! message key or a random content key), so a (key, nonce) pair is never
//! reused. All functions are pure.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};

use crate::{
    CryptoError,
    chain::MessageKey,
    kdf::{AeadMaterial, derive_content_material, derive_message_material},
};

/// Poly1305 tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Size of a random content key carried in ratchet messages
pub const CONTENT_KEY_SIZE: usize = 32;

/// Encrypt with a ratchet message key.
pub fn seal_with_message_key(message_key: &MessageKey, plaintext: &[u8], ad: &[u8]) -> Vec<u8> {
    seal(&derive_message_material(message_key.key()), plaintext, ad)
}

/// Decrypt with a ratchet message key.
///
/// # Errors
///
/// - `DecryptionFailed`: authentication tag does not verify (wrong key,
///   tampered ciphertext or associated data)
pub fn open_with_message_key(
    message_key: &MessageKey,
    ciphertext: &[u8],
    ad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    open(&derive_message_material(message_key.key()), ciphertext, ad)
}

/// Encrypt a shared ciphertext with a random content key.
pub fn seal_with_content_key(content_key: &[u8; CONTENT_KEY_SIZE], plaintext: &[u8], ad: &[u8]) -> Vec<u8> {
    seal(&derive_content_material(content_key), plaintext, ad)
}

/// Decrypt a shared ciphertext with its content key.
pub fn open_with_content_key(
    content_key: &[u8; CONTENT_KEY_SIZE],
    ciphertext: &[u8],
    ad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    open(&derive_content_material(content_key), ciphertext, ad)
}

fn seal(material: &AeadMaterial, plaintext: &[u8], ad: &[u8]) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new((&material.key).into());

    let Ok(ciphertext) =
        cipher.encrypt(XNonce::from_slice(&material.nonce), Payload { msg: plaintext, aad: ad })
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };
    ciphertext
}

fn open(material: &AeadMaterial, ciphertext: &[u8], ad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::DecryptionFailed {
            reason: format!("ciphertext shorter than tag: {} bytes", ciphertext.len()),
        });
    }

    let cipher = XChaCha20Poly1305::new((&material.key).into());
    cipher
        .decrypt(XNonce::from_slice(&material.nonce), Payload { msg: ciphertext, aad: ad })
        .map_err(|_| CryptoError::DecryptionFailed { reason: "authentication failed".to_string() })
}
