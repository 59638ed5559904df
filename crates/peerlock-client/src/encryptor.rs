//! Multi-recipient encryptor.
//!
//! One plaintext, many recipient devices. Either the plaintext rides in every
//! ratchet message, or it is sealed once under a random content key into the
//! shared cipher message and each ratchet message carries only that key.
//!
//! The call is all-or-nothing: sessions are advanced on working copies and
//! written in a single batch after every recipient's message is built. The
//! one exception is a peer whose bundle fails signature verification: its
//! `Fail` status is persisted even though the call fails.

use std::collections::{HashMap, HashSet};

use peerlock_core::{
    EncryptionPolicy, EngineError, Environment, PeerDeviceRecord, PeerDeviceStatus,
    ProvisioningError, SessionRecord, SessionSet, Storage, WriteBatch, trust,
};
use peerlock_crypto::{
    CryptoError, PreKeyBundle,
    aead::{CONTENT_KEY_SIZE, TAG_SIZE},
    x3dh,
};
use peerlock_proto::{PayloadKind, RatchetMessage};

use crate::{
    config::EngineConfig,
    identity::{LocalIdentity, validate_device_id},
    manager::Engine,
    provisioner::fetch_bundles,
    session::{self, InitiatorSeeds},
    transport::KeyServerTransport,
};

/// Per-recipient outcome of an encrypt call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientResult {
    /// Recipient device id
    pub device_id: String,
    /// Recipient status as seen by this call
    pub status: PeerDeviceStatus,
    /// Ratchet message for this recipient; `None` when it was skipped
    /// because it is marked `Fail`
    pub ratchet_message: Option<Vec<u8>>,
}

/// Result of an encrypt call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptOutput {
    /// Shared ciphertext; empty when every ratchet message carries the
    /// plaintext
    pub cipher_message: Vec<u8>,
    /// One entry per requested recipient, in request order
    pub recipients: Vec<RecipientResult>,
}

/// Upper bounds on encrypt output sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSizeBound {
    /// Shared cipher message
    pub cipher_message: usize,
    /// Each recipient's ratchet message
    pub ratchet_message: usize,
}

/// Largest outputs an encrypt of `plaintext_len` bytes can produce.
#[must_use]
pub fn max_output_size(
    plaintext_len: usize,
    recipients: usize,
    policy: EncryptionPolicy,
) -> OutputSizeBound {
    if policy.uses_cipher_message(recipients) {
        OutputSizeBound {
            cipher_message: plaintext_len + TAG_SIZE,
            ratchet_message: RatchetMessage::max_encoded_len(CONTENT_KEY_SIZE + TAG_SIZE),
        }
    } else {
        OutputSizeBound {
            cipher_message: 0,
            ratchet_message: RatchetMessage::max_encoded_len(plaintext_len + TAG_SIZE),
        }
    }
}

/// Working state for one recipient.
struct Target {
    device_id: String,
    peer: Option<PeerDeviceRecord>,
    sessions: SessionSet,
    status: PeerDeviceStatus,
    skipped: bool,
}

/// Encrypt `plaintext` from `local_id` to every device in `recipients`.
///
/// Peers without a usable session are bootstrapped from freshly fetched
/// bundles. Recipients marked `Fail` are skipped.
///
/// # Errors
///
/// - `InvalidInput` for an empty, duplicated or self-addressed recipient
///   list, or when every recipient is skipped
/// - `UserNotFound` if `local_id` does not exist
/// - `Provisioning` if a bundle cannot be fetched or fails verification
/// - `Storage` if the final write fails
///
/// On error no session is advanced.
pub(crate) async fn encrypt<S, T, E>(
    engine: &Engine<S, T, E>,
    local_id: &str,
    context: &str,
    recipients: &[String],
    plaintext: &[u8],
    policy: EncryptionPolicy,
) -> Result<EncryptOutput, EngineError>
where
    S: Storage,
    T: KeyServerTransport,
    E: Environment,
{
    validate_recipients(local_id, recipients)?;

    let _gate = engine.locks.read_user(local_id).await;
    let local = LocalIdentity::load(&engine.storage, local_id)?;
    let _sessions = engine.locks.sessions(local_id, recipients).await;

    let now = engine.env.wall_clock_secs();
    let mut targets = Vec::with_capacity(recipients.len());
    for device_id in recipients {
        let peer = engine.storage.load_peer(local_id, device_id)?;
        let sessions = engine.storage.load_sessions(local_id, device_id)?.unwrap_or_default();
        let status = trust::reported_status(peer.as_ref());
        targets.push(Target {
            device_id: device_id.clone(),
            skipped: status == PeerDeviceStatus::Fail,
            peer,
            sessions,
            status,
        });
    }

    if targets.iter().all(|t| t.skipped) {
        return Err(EngineError::invalid_input("every recipient is marked fail"));
    }

    let to_bootstrap: Vec<String> = targets
        .iter()
        .filter(|t| !t.skipped && needs_bootstrap(t.sessions.active.as_ref(), &engine.config))
        .map(|t| t.device_id.clone())
        .collect();

    let mut batch = WriteBatch::new();

    if !to_bootstrap.is_empty() {
        let bundles = fetch_bundles(
            &engine.transport,
            &local.record,
            &to_bootstrap,
            engine.config.require_one_time_prekey,
        )
        .await?;

        reject_forged_bundles(engine, local_id, &targets, &to_bootstrap, &bundles, now)?;

        for target in targets.iter_mut().filter(|t| to_bootstrap.contains(&t.device_id)) {
            let Some(bundle) = bundles.get(&target.device_id) else {
                continue;
            };
            bootstrap(engine, &local, target, bundle, now)?;
            if let Some(peer) = &target.peer {
                batch.put_peer(local_id, peer.clone());
            }
        }
    }

    let content_key = policy
        .uses_cipher_message(recipients.len())
        .then(|| engine.env.random_seed());
    let (cipher_message, kind, payload) = match &content_key {
        Some(key) => (
            session::seal_shared(key, plaintext, local_id, context),
            PayloadKind::ContentKey,
            key.as_slice(),
        ),
        None => (Vec::new(), PayloadKind::Plaintext, plaintext),
    };

    let mut results = Vec::with_capacity(targets.len());
    for target in targets {
        if target.skipped {
            tracing::debug!("skipping {} for {}: marked fail", target.device_id, local_id);
            results.push(RecipientResult {
                device_id: target.device_id,
                status: PeerDeviceStatus::Fail,
                ratchet_message: None,
            });
            continue;
        }

        let mut sessions = target.sessions;
        let Some(active) = sessions.active.as_mut() else {
            return Err(ProvisioningError::SessionUnavailable {
                device_id: target.device_id.clone(),
                reason: "no session after bootstrap".to_string(),
            }
            .into());
        };
        let message = session::seal(active, kind, payload, context, engine.env.random_seed())
            .map_err(|e| send_failure(&target.device_id, &e))?;
        active.last_activity = now;

        batch.put_sessions(local_id, &target.device_id, sessions);
        results.push(RecipientResult {
            device_id: target.device_id,
            status: target.status,
            ratchet_message: Some(message),
        });
    }

    engine.storage.commit(&batch)?;

    tracing::debug!(
        "{} encrypted {} bytes for {} recipients (shared ciphertext: {})",
        local_id,
        plaintext.len(),
        results.len(),
        !cipher_message.is_empty()
    );
    Ok(EncryptOutput { cipher_message, recipients: results })
}

/// Whether a fresh session must be bootstrapped before sending.
///
/// A session the peer never answered is abandoned once its sending chain is
/// long enough that the peer has most likely lost it.
fn needs_bootstrap(active: Option<&SessionRecord>, config: &EngineConfig) -> bool {
    match active {
        None => true,
        Some(session) => {
            session.pending_init.is_some()
                && session.ratchet.sending_chain_length() >= config.max_sending_chain
        },
    }
}

fn validate_recipients(local_id: &str, recipients: &[String]) -> Result<(), EngineError> {
    if recipients.is_empty() {
        return Err(EngineError::invalid_input("no recipients"));
    }
    let mut seen = HashSet::with_capacity(recipients.len());
    for device_id in recipients {
        validate_device_id(device_id)?;
        if device_id == local_id {
            return Err(EngineError::invalid_input("cannot encrypt to the sending device"));
        }
        if !seen.insert(device_id.as_str()) {
            return Err(EngineError::invalid_input(format!("{device_id} listed twice")));
        }
    }
    Ok(())
}

/// Mark every peer whose bundle signature does not verify as `Fail`, then
/// fail the call.
fn reject_forged_bundles<S, T, E>(
    engine: &Engine<S, T, E>,
    local_id: &str,
    targets: &[Target],
    requested: &[String],
    bundles: &HashMap<String, PreKeyBundle>,
    now: u64,
) -> Result<(), EngineError>
where
    S: Storage,
    T: KeyServerTransport,
    E: Environment,
{
    let mut forged = WriteBatch::new();
    let mut first = None;

    for device_id in requested {
        let Some(bundle) = bundles.get(device_id) else {
            continue;
        };
        if x3dh::verify_bundle(bundle).is_ok() {
            continue;
        }
        tracing::warn!("bundle for {} failed signature verification", device_id);
        let existing = targets.iter().find(|t| &t.device_id == device_id).and_then(|t| t.peer.as_ref());
        forged.put_peer(
            local_id,
            trust::mark_failed(existing, device_id, bundle.identity_key.as_bytes(), now),
        );
        first.get_or_insert_with(|| device_id.clone());
    }

    match first {
        None => Ok(()),
        Some(device_id) => {
            engine.storage.commit(&forged)?;
            Err(ProvisioningError::InvalidSignature { device_id }.into())
        },
    }
}

/// Start a new session with `target` from its verified bundle.
fn bootstrap<S, T, E>(
    engine: &Engine<S, T, E>,
    local: &LocalIdentity,
    target: &mut Target,
    bundle: &PreKeyBundle,
    now: u64,
) -> Result<(), EngineError>
where
    S: Storage,
    T: KeyServerTransport,
    E: Environment,
{
    let observation =
        trust::observe_identity(target.peer.as_ref(), &target.device_id, bundle.identity_key.as_bytes(), now);
    if observation.identity_changed {
        tracing::info!("identity key of {} changed, discarding its sessions", target.device_id);
        target.sessions = SessionSet::default();
    }

    let seeds = InitiatorSeeds {
        ephemeral: engine.env.random_seed(),
        ratchet: engine.env.random_seed(),
        session_id: engine.env.random_u64(),
    };
    let fresh = session::initiate(local, &target.device_id, bundle, seeds, now).map_err(|e| {
        ProvisioningError::MalformedResponse(format!("bundle for {}: {e}", target.device_id))
    })?;

    target.sessions.activate(fresh, engine.config.max_stale_sessions);
    target.status = observation.reported;
    target.peer = Some(observation.record);
    tracing::debug!("bootstrapped session {} -> {}", local.device_id(), target.device_id);
    Ok(())
}

fn send_failure(device_id: &str, err: &CryptoError) -> EngineError {
    ProvisioningError::SessionUnavailable {
        device_id: device_id.to_string(),
        reason: err.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_recipient_default_has_no_shared_ciphertext() {
        let bound = max_output_size(100, 1, EncryptionPolicy::OptimizeSize);
        assert_eq!(bound.cipher_message, 0);
        assert_eq!(bound.ratchet_message, RatchetMessage::max_encoded_len(100 + TAG_SIZE));
    }

    #[test]
    fn shared_ciphertext_keeps_ratchet_messages_small() {
        let bound = max_output_size(10_000, 3, EncryptionPolicy::OptimizeSize);
        assert_eq!(bound.cipher_message, 10_000 + TAG_SIZE);
        assert_eq!(bound.ratchet_message, RatchetMessage::max_encoded_len(CONTENT_KEY_SIZE + TAG_SIZE));
    }

    #[test]
    fn dr_message_policy_never_shares() {
        let bound = max_output_size(64, 5, EncryptionPolicy::DrMessage);
        assert_eq!(bound.cipher_message, 0);
    }

    #[test]
    fn recipient_list_validation() {
        let list = |ids: &[&str]| ids.iter().map(|s| (*s).to_string()).collect::<Vec<_>>();

        assert!(validate_recipients("alice", &list(&["bob", "carol"])).is_ok());
        assert!(validate_recipients("alice", &[]).is_err());
        assert!(validate_recipients("alice", &list(&["bob", "alice"])).is_err());
        assert!(validate_recipients("alice", &list(&["bob", "bob"])).is_err());
        assert!(validate_recipients("alice", &list(&[""])).is_err());
    }

    #[test]
    fn send_failures_are_not_conflicts() {
        let err = send_failure("bob", &CryptoError::InvalidKey { reason: "bad ratchet key".into() });
        assert!(matches!(
            err,
            EngineError::Provisioning(ProvisioningError::SessionUnavailable { ref device_id, .. })
                if device_id == "bob"
        ));
    }

    #[test]
    fn missing_session_needs_bootstrap() {
        let config = EngineConfig::default();
        assert!(needs_bootstrap(None, &config));
    }
}
