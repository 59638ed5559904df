//! Key derivation using HKDF-SHA512

use hkdf::Hkdf;
use sha2::Sha512;
use zeroize::Zeroize;

/// Label for the X3DH master secret
const X3DH_LABEL: &[u8] = b"peerlockX3DHv1";

/// Label for the root chain KDF of the Double Ratchet
const ROOT_LABEL: &[u8] = b"peerlockRootV1";

/// Label for expanding a ratchet message key into AEAD key and nonce
const MESSAGE_LABEL: &[u8] = b"peerlockMessageV1";

/// Label for expanding a shared-ciphertext content key into AEAD key and nonce
const CONTENT_LABEL: &[u8] = b"peerlockContentV1";

/// Label for the per-session associated data
const ASSOCIATED_DATA_LABEL: &[u8] = b"peerlockSessionAdV1";

/// AEAD key and nonce derived from a single-use secret.
pub struct AeadMaterial {
    /// 32-byte `XChaCha20-Poly1305` key
    pub key: [u8; 32],
    /// 24-byte `XChaCha20` nonce
    pub nonce: [u8; 24],
}

impl Drop for AeadMaterial {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Combine the X3DH Diffie-Hellman outputs into the initial session secret.
///
/// Input keying material is 32 bytes of 0xFF followed by the DH outputs in
/// order (DH1..DH4), salt is all-zero.
pub fn derive_x3dh_secret(dh_outputs: &[[u8; 32]]) -> [u8; 32] {
    let mut ikm = Vec::with_capacity(32 + dh_outputs.len() * 32);
    ikm.extend_from_slice(&[0xFF; 32]);
    for output in dh_outputs {
        ikm.extend_from_slice(output);
    }

    let hkdf = Hkdf::<Sha512>::new(Some(&[0u8; 64]), &ikm);
    ikm.zeroize();

    let mut secret = [0u8; 32];
    let Ok(()) = hkdf.expand(X3DH_LABEL, &mut secret) else {
        unreachable!("32 bytes is a valid HKDF-SHA512 output length");
    };
    secret
}

/// Root chain step: mix a DH output into the root key.
///
/// Returns `(next_root_key, chain_key)`.
pub fn derive_root(root_key: &[u8; 32], dh_output: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let hkdf = Hkdf::<Sha512>::new(Some(root_key), dh_output);

    let mut okm = [0u8; 64];
    let Ok(()) = hkdf.expand(ROOT_LABEL, &mut okm) else {
        unreachable!("64 bytes is a valid HKDF-SHA512 output length");
    };

    let mut root = [0u8; 32];
    let mut chain = [0u8; 32];
    root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    okm.zeroize();

    (root, chain)
}

/// Expand a ratchet message key into AEAD key and nonce.
pub fn derive_message_material(message_key: &[u8; 32]) -> AeadMaterial {
    expand_material(message_key, MESSAGE_LABEL)
}

/// Expand a random content key (shared ciphertext mode) into AEAD key and
/// nonce.
pub fn derive_content_material(content_key: &[u8; 32]) -> AeadMaterial {
    expand_material(content_key, CONTENT_LABEL)
}

/// Per-session associated data binding both identities and device ids.
///
/// Computed identically by both sides: the initiator's values always come
/// first.
pub fn derive_associated_data(
    initiator_identity: &[u8; 32],
    responder_identity: &[u8; 32],
    initiator_device: &str,
    responder_device: &str,
) -> [u8; 32] {
    let mut ikm = Vec::with_capacity(64);
    ikm.extend_from_slice(initiator_identity);
    ikm.extend_from_slice(responder_identity);

    // info: label || len(initiator) || initiator || responder
    let mut info = Vec::with_capacity(
        ASSOCIATED_DATA_LABEL.len() + 4 + initiator_device.len() + responder_device.len(),
    );
    info.extend_from_slice(ASSOCIATED_DATA_LABEL);
    info.extend_from_slice(&(initiator_device.len() as u32).to_be_bytes());
    info.extend_from_slice(initiator_device.as_bytes());
    info.extend_from_slice(responder_device.as_bytes());

    let hkdf = Hkdf::<Sha512>::new(None, &ikm);
    let mut ad = [0u8; 32];
    let Ok(()) = hkdf.expand(&info, &mut ad) else {
        unreachable!("32 bytes is a valid HKDF-SHA512 output length");
    };
    ad
}

fn expand_material(secret: &[u8; 32], label: &[u8]) -> AeadMaterial {
    let hkdf = Hkdf::<Sha512>::new(None, secret);

    let mut okm = [0u8; 56];
    let Ok(()) = hkdf.expand(label, &mut okm) else {
        unreachable!("56 bytes is a valid HKDF-SHA512 output length");
    };

    let mut material = AeadMaterial { key: [0u8; 32], nonce: [0u8; 24] };
    material.key.copy_from_slice(&okm[..32]);
    material.nonce.copy_from_slice(&okm[32..]);
    okm.zeroize();
    material
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x3dh_secret_is_deterministic() {
        let outputs = [[1u8; 32], [2u8; 32], [3u8; 32]];
        assert_eq!(derive_x3dh_secret(&outputs), derive_x3dh_secret(&outputs));
    }

    #[test]
    fn x3dh_secret_depends_on_every_output() {
        let three = derive_x3dh_secret(&[[1u8; 32], [2u8; 32], [3u8; 32]]);
        let four = derive_x3dh_secret(&[[1u8; 32], [2u8; 32], [3u8; 32], [4u8; 32]]);
        let reordered = derive_x3dh_secret(&[[2u8; 32], [1u8; 32], [3u8; 32]]);

        assert_ne!(three, four);
        assert_ne!(three, reordered);
    }

    #[test]
    fn root_step_separates_root_and_chain() {
        let (root, chain) = derive_root(&[7u8; 32], &[9u8; 32]);
        assert_ne!(root, chain);
        assert_ne!(root, [7u8; 32]);
    }

    #[test]
    fn root_step_depends_on_dh_output() {
        let a = derive_root(&[7u8; 32], &[9u8; 32]);
        let b = derive_root(&[7u8; 32], &[10u8; 32]);
        assert_ne!(a.0, b.0);
        assert_ne!(a.1, b.1);
    }

    #[test]
    fn message_and_content_material_are_domain_separated() {
        let secret = [5u8; 32];
        let message = derive_message_material(&secret);
        let content = derive_content_material(&secret);

        assert_ne!(message.key, content.key);
        assert_ne!(message.nonce, content.nonce);
    }

    #[test]
    fn associated_data_is_order_sensitive() {
        let a = [1u8; 32];
        let b = [2u8; 32];

        let forward = derive_associated_data(&a, &b, "alice", "bob");
        let backward = derive_associated_data(&b, &a, "bob", "alice");
        assert_ne!(forward, backward);
    }

    #[test]
    fn associated_data_device_ids_are_unambiguous() {
        let a = [1u8; 32];
        let b = [2u8; 32];

        let split_one = derive_associated_data(&a, &b, "ab", "c");
        let split_two = derive_associated_data(&a, &b, "a", "bc");
        assert_ne!(split_one, split_two);
    }
}
