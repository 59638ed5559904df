//! Decryptor.
//!
//! An inbound ratchet message is tried against the sender's active session,
//! then its stale sessions, each on a working copy. If none opens it and it
//! carries an X3DH init not seen before, a new session is accepted from the
//! referenced prekeys.
//!
//! Failure leaves sessions as they were, except that the attempted message
//! key is marked consumed on a session that owns its chain, so a retried
//! message cannot be used to probe that key again.

use peerlock_core::{
    EngineError, Environment, OneTimePreKeyRecord, PeerDeviceRecord, PeerDeviceStatus, SessionSet,
    SignedPreKeyRecord, Storage, WriteBatch, WriteOp, trust,
};
use peerlock_crypto::{CryptoError, RatchetLimits};
use peerlock_proto::{PayloadKind, RatchetMessage, X3dhInit};

use crate::{
    identity::{LocalIdentity, validate_device_id},
    manager::Engine,
    session,
    transport::KeyServerTransport,
};

/// Result of a decrypt call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted {
    /// Sender status as seen by this call
    pub status: PeerDeviceStatus,
    /// Recovered plaintext
    pub plaintext: Vec<u8>,
}

/// Outcome of trying the sessions already held for the sender.
struct Attempt {
    /// Payload from the first session that opened the message
    payload: Option<Vec<u8>>,
    /// First error, reported when nothing else applies
    first_error: Option<CryptoError>,
    /// A stored session recorded a consumed key
    marked: bool,
}

/// A message being decrypted, with its authenticated prefix.
struct Inbound<'a> {
    message: RatchetMessage,
    header: &'a [u8],
    context: &'a str,
}

/// Decrypt a ratchet message from `sender` to `local_id`.
///
/// `cipher_message` is required when the ratchet message carries a content
/// key.
///
/// # Errors
///
/// - `Decryption` for malformed, forged, replayed or undeliverable messages,
///   and for senders marked `Fail`
/// - `OutOfOrder` when the message lies beyond the skip window
/// - `UserNotFound` if `local_id` does not exist
pub(crate) async fn decrypt<S, T, E>(
    engine: &Engine<S, T, E>,
    local_id: &str,
    context: &str,
    sender: &str,
    ratchet_message: &[u8],
    cipher_message: Option<&[u8]>,
) -> Result<Decrypted, EngineError>
where
    S: Storage,
    T: KeyServerTransport,
    E: Environment,
{
    validate_device_id(sender)?;
    if sender == local_id {
        return Err(EngineError::invalid_input("cannot decrypt a message from the receiving device"));
    }

    let (message, header_len) = RatchetMessage::decode(ratchet_message)?;
    let inbound = Inbound { message, header: &ratchet_message[..header_len], context };

    let _gate = engine.locks.read_user(local_id).await;
    let local = LocalIdentity::load(&engine.storage, local_id)?;
    let _session = engine.locks.sessions(local_id, &[sender.to_string()]).await;

    let now = engine.env.wall_clock_secs();
    let limits = engine.config.limits();
    let peer = engine.storage.load_peer(local_id, sender)?;

    let reprovisioned = match (&inbound.message.x3dh_init, &peer) {
        (Some(init), Some(record)) => init.identity_key != record.identity_key,
        _ => false,
    };
    if peer.as_ref().is_some_and(|p| p.status == PeerDeviceStatus::Fail) && !reprovisioned {
        return Err(EngineError::Decryption { reason: format!("{sender} is marked fail") });
    }

    let mut sessions = engine.storage.load_sessions(local_id, sender)?.unwrap_or_default();
    let attempt = open_existing(&mut sessions, &inbound, limits, now);

    let bootstrap = match (&attempt.payload, &inbound.message.x3dh_init) {
        (None, Some(init)) if !sessions.accepted_from(&init.ephemeral_key) => Some(init),
        _ => None,
    };
    // Held until the batch consuming the prekeys is committed.
    let _prekeys =
        if bootstrap.is_some() { Some(engine.locks.prekeys(local_id).await) } else { None };

    let (payload, status, batch) = if let Some(payload) = attempt.payload {
        let mut batch = WriteBatch::new();
        batch.put_sessions(local_id, sender, sessions);
        (payload, trust::reported_status(peer.as_ref()), batch)
    } else {
        let accepted = match bootstrap {
            Some(init) => {
                accept(engine, &local, sender, peer.as_ref(), sessions.clone(), init, &inbound, now)
            },
            None => Err(attempt.first_error.map_or_else(
                || EngineError::Decryption { reason: format!("no session with {sender}") },
                EngineError::from,
            )),
        };

        match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                if attempt.marked {
                    persist_marks(engine, local_id, sender, sessions);
                }
                return Err(err);
            },
        }
    };

    let plaintext = match inbound.message.payload {
        PayloadKind::Plaintext => payload,
        PayloadKind::ContentKey => {
            let shared = cipher_message.filter(|c| !c.is_empty()).ok_or_else(|| {
                EngineError::Decryption { reason: "shared cipher message missing".to_string() }
            })?;
            session::open_shared(&payload, shared, sender, context)?
        },
    };

    engine.storage.commit(&batch)?;

    tracing::debug!("{} decrypted {} bytes from {}", local_id, plaintext.len(), sender);
    Ok(Decrypted { status, plaintext })
}

/// Try the active session, then the stale ones.
///
/// The session that opens the message is replaced by its advanced copy.
/// Sessions that fail record the attempted key as consumed.
fn open_existing(
    sessions: &mut SessionSet,
    inbound: &Inbound<'_>,
    limits: RatchetLimits,
    now: u64,
) -> Attempt {
    let mut attempt = Attempt { payload: None, first_error: None, marked: false };
    let message = &inbound.message;

    for slot in sessions.active.iter_mut().chain(sessions.stale.iter_mut()) {
        let mut working = slot.clone();
        match session::open(&mut working, message, inbound.header, inbound.context, limits) {
            Ok(payload) => {
                working.last_activity = now;
                *slot = working;
                attempt.payload = Some(payload);
                return attempt;
            },
            Err(err) => {
                attempt.marked |= slot.ratchet.mark_consumed(&message.ratchet_key, message.index, limits);
                attempt.first_error.get_or_insert(err);
            },
        }
    }

    attempt
}

/// Accept a new session from an X3DH init and open the message with it.
///
/// The caller holds the owner's prekey lock until the returned writes are
/// committed. An initiator ephemeral key already accepted under the signed
/// prekey is a replay, even when the session it created is gone.
///
/// Returns the payload, the status to report and the writes to commit.
#[allow(clippy::too_many_arguments)]
fn accept<S, T, E>(
    engine: &Engine<S, T, E>,
    local: &LocalIdentity,
    sender: &str,
    peer: Option<&PeerDeviceRecord>,
    sessions: SessionSet,
    init: &X3dhInit,
    inbound: &Inbound<'_>,
    now: u64,
) -> Result<(Vec<u8>, PeerDeviceStatus, WriteBatch), EngineError>
where
    S: Storage,
    T: KeyServerTransport,
    E: Environment,
{
    let owner = local.device_id();

    let mut signed_prekey = find_signed_prekey(engine, owner, init.signed_prekey_id, now)?;
    if signed_prekey.has_accepted(&init.ephemeral_key) {
        return Err(EngineError::Decryption {
            reason: format!("initial message from {sender} was already accepted"),
        });
    }
    let one_time_prekey = match init.one_time_prekey_id {
        Some(id) => Some(find_one_time_prekey(engine, owner, id)?),
        None => None,
    };

    let mut fresh = session::accept(
        local,
        sender,
        init,
        &signed_prekey,
        one_time_prekey.as_ref(),
        engine.env.random_u64(),
        now,
    )?;
    let payload = session::open(
        &mut fresh,
        &inbound.message,
        inbound.header,
        inbound.context,
        engine.config.limits(),
    )?;

    let observation = trust::observe_identity(peer, sender, &init.identity_key, now);
    let mut sessions = if observation.identity_changed {
        tracing::info!("identity key of {} changed, discarding its sessions", sender);
        SessionSet::default()
    } else {
        sessions
    };
    sessions.activate(fresh, engine.config.max_stale_sessions);
    signed_prekey.accepted_ephemerals.push(init.ephemeral_key);

    let mut batch = WriteBatch::new();
    batch
        .put_peer(owner, observation.record)
        .put_sessions(owner, sender, sessions)
        .push(WriteOp::PutSignedPreKey { owner: owner.to_string(), record: signed_prekey });
    if let Some(opk) = one_time_prekey {
        batch.push(WriteOp::DeleteOneTimePreKey { owner: owner.to_string(), id: opk.id });
    }

    tracing::info!("accepted session {} <- {}", owner, sender);
    Ok((payload, observation.reported, batch))
}

/// Current signed prekey, or a replaced one still inside its limbo period.
fn find_signed_prekey<S, T, E>(
    engine: &Engine<S, T, E>,
    owner: &str,
    id: u32,
    now: u64,
) -> Result<SignedPreKeyRecord, EngineError>
where
    S: Storage,
    T: KeyServerTransport,
    E: Environment,
{
    let limbo = engine.config.spk_limbo.as_secs();
    engine
        .storage
        .load_signed_prekeys(owner)?
        .into_iter()
        .find(|spk| {
            spk.id == id && spk.retired_at.is_none_or(|at| now.saturating_sub(at) < limbo)
        })
        .ok_or_else(|| EngineError::Decryption { reason: format!("unknown signed prekey {id}") })
}

fn find_one_time_prekey<S, T, E>(
    engine: &Engine<S, T, E>,
    owner: &str,
    id: u32,
) -> Result<OneTimePreKeyRecord, EngineError>
where
    S: Storage,
    T: KeyServerTransport,
    E: Environment,
{
    engine.storage.load_one_time_prekey(owner, id)?.ok_or_else(|| EngineError::Decryption {
        reason: format!("one-time prekey {id} is unknown or already used"),
    })
}

/// Persist consumed-key markers after a failed decrypt.
///
/// The decrypt has already failed; a storage error here is logged rather than
/// replacing the decryption error.
fn persist_marks<S, T, E>(engine: &Engine<S, T, E>, owner: &str, sender: &str, sessions: SessionSet)
where
    S: Storage,
    T: KeyServerTransport,
    E: Environment,
{
    let mut batch = WriteBatch::new();
    batch.put_sessions(owner, sender, sessions);
    if let Err(err) = engine.storage.commit(&batch) {
        tracing::warn!("could not record consumed key for {} <- {}: {}", owner, sender, err);
    }
}
