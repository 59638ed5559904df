//! Session engine: bootstrap and per-message ratchet steps.
//!
//! ```text
//!   UNINITIALIZED ──initiate (bundle) / accept (initial message)──▶ ESTABLISHED
//!   ESTABLISHED ──seal / open──▶ ADVANCING ──seal / open──▶ ADVANCING ...
//!   any ──peer identity changes──▶ UNINITIALIZED (sessions discarded)
//! ```
//!
//! Functions here mutate the `SessionRecord` they are given. Callers pass a
//! clone and keep it only when the whole operation succeeds, which is what
//! makes a failed encrypt or decrypt leave the stored session untouched.
//!
//! Every ratchet message is authenticated with
//! `session associated data || header bytes || context label`, where the
//! header bytes are exactly what precedes the ciphertext on the wire.

use peerlock_core::{OneTimePreKeyRecord, SessionRecord, SignedPreKeyRecord};
use peerlock_crypto::{
    CryptoError, DhKeyPair, IdentityPublicKey, InitialKeys, PreKeyBundle, RatchetLimits,
    RatchetState,
    aead::{self, CONTENT_KEY_SIZE},
    kdf::derive_associated_data,
    x3dh,
};
use peerlock_proto::{CurveId, PayloadKind, RatchetMessage, X3dhInit};

use crate::identity::LocalIdentity;

/// Randomness a new initiator session consumes.
pub(crate) struct InitiatorSeeds {
    pub(crate) ephemeral: [u8; 32],
    pub(crate) ratchet: [u8; 32],
    pub(crate) session_id: u64,
}

/// Start a session from a peer's bundle.
///
/// # Errors
///
/// - `InvalidSignature`: the bundle's signed prekey is not signed by its
///   identity key
/// - `InvalidKey`: a bundle key is unusable
pub(crate) fn initiate(
    local: &LocalIdentity,
    peer_device: &str,
    bundle: &PreKeyBundle,
    seeds: InitiatorSeeds,
    now: u64,
) -> Result<SessionRecord, CryptoError> {
    let ephemeral = DhKeyPair::from_seed(seeds.ephemeral);
    let (secret, init) = x3dh::initiate(&local.keys, &ephemeral, bundle)?;
    let ratchet = RatchetState::initiator(&secret, &bundle.signed_prekey, seeds.ratchet)?;

    Ok(SessionRecord {
        session_id: seeds.session_id,
        ratchet,
        associated_data: derive_associated_data(
            &local.public(),
            bundle.identity_key.as_bytes(),
            local.device_id(),
            peer_device,
        ),
        pending_init: Some(X3dhInit {
            identity_key: *init.identity_key.as_bytes(),
            ephemeral_key: init.ephemeral_key,
            signed_prekey_id: init.signed_prekey_id,
            one_time_prekey_id: init.one_time_prekey_id,
        }),
        peer_ephemeral: None,
        created_at: now,
        last_activity: now,
    })
}

/// Rebuild the initiator's session from its initial message.
///
/// The caller has already located the prekeys `init` references.
pub(crate) fn accept(
    local: &LocalIdentity,
    peer_device: &str,
    init: &X3dhInit,
    signed_prekey: &SignedPreKeyRecord,
    one_time_prekey: Option<&OneTimePreKeyRecord>,
    session_id: u64,
    now: u64,
) -> Result<SessionRecord, CryptoError> {
    let spk = DhKeyPair::from_seed(signed_prekey.seed);
    let opk = one_time_prekey.map(|record| DhKeyPair::from_seed(record.seed));
    let initial = InitialKeys {
        identity_key: IdentityPublicKey(init.identity_key),
        ephemeral_key: init.ephemeral_key,
        signed_prekey_id: init.signed_prekey_id,
        one_time_prekey_id: init.one_time_prekey_id,
    };
    let secret = x3dh::respond(&local.keys, &spk, opk.as_ref(), &initial)?;

    Ok(SessionRecord {
        session_id,
        ratchet: RatchetState::responder(&secret, &spk),
        associated_data: derive_associated_data(
            &init.identity_key,
            &local.public(),
            peer_device,
            local.device_id(),
        ),
        pending_init: None,
        peer_ephemeral: Some(init.ephemeral_key),
        created_at: now,
        last_activity: now,
    })
}

/// Encrypt one payload and return the encoded ratchet message.
pub(crate) fn seal(
    session: &mut SessionRecord,
    kind: PayloadKind,
    payload: &[u8],
    context: &str,
    ratchet_seed: [u8; 32],
) -> Result<Vec<u8>, CryptoError> {
    let step = session.ratchet.prepare_send(ratchet_seed)?;

    let mut message = RatchetMessage {
        curve: CurveId::C25519,
        payload: kind,
        index: step.message_key.index(),
        previous_chain_length: step.previous_chain_length,
        ratchet_key: step.ratchet_key,
        x3dh_init: session.pending_init,
        ciphertext: Vec::new(),
    };
    let header = message.encode_header();
    let ad = message_ad(&session.associated_data, &header, context);
    message.ciphertext = aead::seal_with_message_key(&step.message_key, payload, &ad);

    Ok(message.encode())
}

/// Decrypt a ratchet message's payload on this session.
///
/// `header` must be the raw bytes that preceded the ciphertext on the wire.
/// A successful decrypt proves the peer holds this session, so any pending
/// X3DH init is dropped from later messages.
pub(crate) fn open(
    session: &mut SessionRecord,
    message: &RatchetMessage,
    header: &[u8],
    context: &str,
    limits: RatchetLimits,
) -> Result<Vec<u8>, CryptoError> {
    let key = session.ratchet.receive_key(
        &message.ratchet_key,
        message.index,
        message.previous_chain_length,
        limits,
    )?;
    let ad = message_ad(&session.associated_data, header, context);
    let payload = aead::open_with_message_key(&key, &message.ciphertext, &ad)?;

    session.pending_init = None;
    Ok(payload)
}

/// Encrypt the shared ciphertext under a content key.
pub(crate) fn seal_shared(
    content_key: &[u8; CONTENT_KEY_SIZE],
    plaintext: &[u8],
    sender: &str,
    context: &str,
) -> Vec<u8> {
    aead::seal_with_content_key(content_key, plaintext, &shared_ad(sender, context))
}

/// Decrypt the shared ciphertext with the content key a ratchet message
/// carried.
pub(crate) fn open_shared(
    content_key: &[u8],
    cipher_message: &[u8],
    sender: &str,
    context: &str,
) -> Result<Vec<u8>, CryptoError> {
    let key: &[u8; CONTENT_KEY_SIZE] =
        content_key.try_into().map_err(|_| CryptoError::DecryptionFailed {
            reason: format!("content key is {} bytes", content_key.len()),
        })?;
    aead::open_with_content_key(key, cipher_message, &shared_ad(sender, context))
}

fn message_ad(session_ad: &[u8; 32], header: &[u8], context: &str) -> Vec<u8> {
    let mut ad = Vec::with_capacity(session_ad.len() + header.len() + context.len());
    ad.extend_from_slice(session_ad);
    ad.extend_from_slice(header);
    ad.extend_from_slice(context.as_bytes());
    ad
}

fn shared_ad(sender: &str, context: &str) -> Vec<u8> {
    let mut ad = Vec::with_capacity(4 + sender.len() + context.len());
    ad.extend_from_slice(&(sender.len() as u32).to_be_bytes());
    ad.extend_from_slice(sender.as_bytes());
    ad.extend_from_slice(context.as_bytes());
    ad
}

#[cfg(test)]
mod tests {
    use peerlock_core::LocalUserRecord;
    use peerlock_crypto::{IdentityKeyPair, keys::signed_prekey_message};

    use super::*;

    fn identity(device_id: &str, seed: u8) -> LocalIdentity {
        let keys = IdentityKeyPair::from_seed(&[seed; 32]);
        LocalIdentity {
            record: LocalUserRecord {
                device_id: device_id.to_string(),
                server_url: "https://keys.example".into(),
                curve: CurveId::C25519,
                identity_seed: [seed; 32],
                identity_public: *keys.public().as_bytes(),
                initial_opk_count: 1,
                created_at: 0,
            },
            keys,
        }
    }

    struct Prekeys {
        spk: SignedPreKeyRecord,
        opk: OneTimePreKeyRecord,
    }

    fn prekeys(owner: &LocalIdentity) -> Prekeys {
        let spk_pair = DhKeyPair::from_seed([0x51; 32]);
        let opk_pair = DhKeyPair::from_seed([0x52; 32]);
        Prekeys {
            spk: SignedPreKeyRecord {
                id: 11,
                seed: spk_pair.secret_bytes(),
                public: spk_pair.public(),
                signature: owner.keys.sign(&signed_prekey_message(11, &spk_pair.public())).to_vec(),
                created_at: 0,
                retired_at: None,
                accepted_ephemerals: Vec::new(),
            },
            opk: OneTimePreKeyRecord {
                id: 22,
                seed: opk_pair.secret_bytes(),
                public: opk_pair.public(),
                dispatched_at: None,
            },
        }
    }

    fn bundle(owner: &LocalIdentity, keys: &Prekeys) -> PreKeyBundle {
        let Ok(signature) = keys.spk.signature.as_slice().try_into() else {
            unreachable!("signatures are 64 bytes");
        };
        PreKeyBundle {
            identity_key: owner.keys.public(),
            signed_prekey_id: keys.spk.id,
            signed_prekey: keys.spk.public,
            signed_prekey_signature: signature,
            one_time_prekey: Some((keys.opk.id, keys.opk.public)),
        }
    }

    fn seeds(tag: u8) -> InitiatorSeeds {
        InitiatorSeeds { ephemeral: [tag; 32], ratchet: [tag.wrapping_add(1); 32], session_id: 1 }
    }

    /// Alice initiates, Bob accepts from the first message.
    fn established() -> (SessionRecord, SessionRecord, Vec<u8>) {
        let alice = identity("alice", 1);
        let bob = identity("bob", 2);
        let keys = prekeys(&bob);

        let mut alice_session = initiate(&alice, "bob", &bundle(&bob, &keys), seeds(3), 0).unwrap();
        let wire = seal(&mut alice_session, PayloadKind::Plaintext, b"hello", "bob", [4; 32]).unwrap();

        let (message, _) = RatchetMessage::decode(&wire).unwrap();
        let init = message.x3dh_init.unwrap();
        let bob_session = accept(&bob, "alice", &init, &keys.spk, Some(&keys.opk), 2, 0).unwrap();
        (alice_session, bob_session, wire)
    }

    #[test]
    fn first_message_carries_init_and_decrypts() {
        let (_, mut bob, wire) = established();
        let (message, header_len) = RatchetMessage::decode(&wire).unwrap();

        let plaintext =
            open(&mut bob, &message, &wire[..header_len], "bob", RatchetLimits::default()).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn reply_clears_pending_init() {
        let (mut alice, mut bob, wire) = established();
        let (message, header_len) = RatchetMessage::decode(&wire).unwrap();
        open(&mut bob, &message, &wire[..header_len], "bob", RatchetLimits::default()).unwrap();

        let reply = seal(&mut bob, PayloadKind::Plaintext, b"hi", "alice", [5; 32]).unwrap();
        let (reply_message, reply_header) = RatchetMessage::decode(&reply).unwrap();
        assert!(reply_message.x3dh_init.is_none());

        assert!(alice.pending_init.is_some());
        let plaintext =
            open(&mut alice, &reply_message, &reply[..reply_header], "alice", RatchetLimits::default())
                .unwrap();
        assert_eq!(plaintext, b"hi");
        assert!(alice.pending_init.is_none());

        let next = seal(&mut alice, PayloadKind::Plaintext, b"again", "bob", [6; 32]).unwrap();
        assert!(RatchetMessage::decode(&next).unwrap().0.x3dh_init.is_none());
    }

    #[test]
    fn context_label_is_authenticated() {
        let (_, mut bob, wire) = established();
        let (message, header_len) = RatchetMessage::decode(&wire).unwrap();

        let result = open(&mut bob, &message, &wire[..header_len], "carol", RatchetLimits::default());
        assert!(matches!(result, Err(CryptoError::DecryptionFailed { .. })));
    }

    #[test]
    fn header_is_authenticated() {
        let (_, mut bob, mut wire) = established();
        // Flip a reserved header byte: decodes the same, authenticates differently
        wire[3] ^= 0xFF;
        let (message, header_len) = RatchetMessage::decode(&wire).unwrap();

        let result = open(&mut bob, &message, &wire[..header_len], "bob", RatchetLimits::default());
        assert!(result.is_err());
    }

    #[test]
    fn wrong_one_time_prekey_is_rejected() {
        let (_, _, wire) = established();
        let bob = identity("bob", 2);
        let keys = prekeys(&bob);
        let init = RatchetMessage::decode(&wire).unwrap().0.x3dh_init.unwrap();

        let result = accept(&bob, "alice", &init, &keys.spk, None, 2, 0);
        assert!(matches!(result, Err(CryptoError::InvalidKey { .. })));
    }

    #[test]
    fn shared_ciphertext_roundtrip_binds_sender() {
        let key = [0x33; CONTENT_KEY_SIZE];
        let cipher = seal_shared(&key, b"group text", "alice", "friends");

        assert_eq!(open_shared(&key, &cipher, "alice", "friends").unwrap(), b"group text");
        assert!(open_shared(&key, &cipher, "mallory", "friends").is_err());
        assert!(open_shared(&key[..16], &cipher, "alice", "friends").is_err());
    }
}
