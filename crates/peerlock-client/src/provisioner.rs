//! Key exchange provisioner.
//!
//! Everything that talks to the key server: registering and unregistering
//! local users, and fetching peer bundles to bootstrap sessions. Prekey
//! upkeep lives in [`crate::maintenance`] but goes through [`request`] too.
//!
//! The engine never retries. A transport failure is reported as
//! `ProvisioningError::ServerUnreachable` and local state is left as it was.

use std::collections::HashMap;

use peerlock_core::{
    CurveId, EngineError, Environment, LocalUserRecord, ProvisioningError, Storage, WriteBatch,
    WriteOp,
};
use peerlock_crypto::{IdentityKeyPair, IdentityPublicKey, PreKeyBundle};
use peerlock_proto::{
    ErrorPayload, PeerBundle, PeerBundlesRequest, RegisterUser, ServerMessage,
    key_server::{MAX_BUNDLES_PER_REQUEST, MAX_ONE_TIME_PREKEYS_PER_UPLOAD, fixed_bytes},
};

use crate::{
    identity::{
        generate_one_time_prekeys, generate_signed_prekey, one_time_prekey_data,
        signed_prekey_data, validate_device_id,
    },
    manager::Engine,
    transport::KeyServerTransport,
};

/// Send one message to `user`'s key server and decode the answer.
///
/// # Errors
///
/// - `ServerUnreachable` on transport failure
/// - `ServerRejected` when the server answers with an error payload
/// - `MalformedResponse` when the answer does not decode or is on another
///   curve
pub(crate) async fn request<T: KeyServerTransport>(
    transport: &T,
    user: &LocalUserRecord,
    message: ServerMessage,
) -> Result<ServerMessage, EngineError> {
    let body = message
        .encode(user.curve)
        .map_err(|e| EngineError::invalid_input(format!("cannot encode key server request: {e}")))?;

    let response = transport
        .post(&user.server_url, &user.device_id, body)
        .await
        .map_err(|e| ProvisioningError::ServerUnreachable(e.to_string()))?;

    let (curve, answer) = ServerMessage::decode(&response)
        .map_err(|e| ProvisioningError::MalformedResponse(e.to_string()))?;
    if curve != user.curve {
        return Err(ProvisioningError::MalformedResponse(format!(
            "answer on curve {curve}, expected {}",
            user.curve
        ))
        .into());
    }

    match answer {
        ServerMessage::Error(ErrorPayload { code, message }) => {
            Err(ProvisioningError::ServerRejected { code, message }.into())
        },
        other => Ok(other),
    }
}

/// Require a plain acknowledgement.
pub(crate) fn expect_ack(answer: &ServerMessage) -> Result<(), EngineError> {
    match answer {
        ServerMessage::Ack => Ok(()),
        other => Err(unexpected(other)),
    }
}

/// Error for an answer of the wrong type.
pub(crate) fn unexpected(answer: &ServerMessage) -> EngineError {
    ProvisioningError::MalformedResponse(format!("unexpected answer {:?}", answer.opcode())).into()
}

/// Provision a local user and register it with its key server.
///
/// Creating a user that already exists with the same server, curve and
/// one-time prekey count is a no-op.
///
/// # Errors
///
/// - `Conflict` if the device id exists with different parameters
/// - `Provisioning` if registration fails; the user is then not created
/// - `Storage` if the local write fails after registration; the server
///   registration is withdrawn on a best-effort basis
pub(crate) async fn create_user<S, T, E>(
    engine: &Engine<S, T, E>,
    device_id: &str,
    server_url: &str,
    curve: CurveId,
    one_time_prekeys: Option<u16>,
) -> Result<(), EngineError>
where
    S: Storage,
    T: KeyServerTransport,
    E: Environment,
{
    validate_device_id(device_id)?;
    let count = one_time_prekeys.unwrap_or(engine.config.default_opk_batch);
    if usize::from(count) > MAX_ONE_TIME_PREKEYS_PER_UPLOAD {
        return Err(EngineError::invalid_input(format!(
            "{count} one-time prekeys exceed the upload limit of {MAX_ONE_TIME_PREKEYS_PER_UPLOAD}"
        )));
    }

    let _gate = engine.locks.write_user(device_id).await;

    if let Some(existing) = engine.storage.load_user(device_id)? {
        if existing.server_url == server_url
            && existing.curve == curve
            && existing.initial_opk_count == count
        {
            tracing::debug!("user {} already exists", device_id);
            return Ok(());
        }
        return Err(EngineError::Conflict {
            reason: format!("{device_id} already exists with different parameters"),
        });
    }

    let now = engine.env.wall_clock_secs();
    let identity_seed = engine.env.random_seed();
    let keys = IdentityKeyPair::from_seed(&identity_seed);
    let record = LocalUserRecord {
        device_id: device_id.to_string(),
        server_url: server_url.to_string(),
        curve,
        identity_seed,
        identity_public: *keys.public().as_bytes(),
        initial_opk_count: count,
        created_at: now,
    };

    let signed_prekey = generate_signed_prekey(&engine.env, &keys, &[], now);
    let one_time = generate_one_time_prekeys(&engine.env, &[], usize::from(count));

    let registration = ServerMessage::RegisterUser(RegisterUser {
        identity_key: record.identity_public.to_vec(),
        signed_prekey: signed_prekey_data(&signed_prekey),
        one_time_prekeys: one_time.iter().map(one_time_prekey_data).collect(),
    });
    expect_ack(&request(&engine.transport, &record, registration).await?)?;

    let mut batch = WriteBatch::new();
    batch.push(WriteOp::InsertUser(record.clone())).push(WriteOp::PutSignedPreKey {
        owner: device_id.to_string(),
        record: signed_prekey,
    });
    batch.extend(
        one_time
            .into_iter()
            .map(|opk| WriteOp::PutOneTimePreKey { owner: device_id.to_string(), record: opk }),
    );

    if let Err(err) = engine.storage.commit(&batch) {
        tracing::warn!("storing {} failed after registration, withdrawing: {}", device_id, err);
        if let Err(cleanup) = request(&engine.transport, &record, ServerMessage::DeleteUser).await {
            tracing::warn!("could not withdraw registration of {}: {}", device_id, cleanup);
        }
        return Err(err.into());
    }

    tracing::info!("created user {} with {} one-time prekeys", device_id, count);
    Ok(())
}

/// Unregister a local user and delete everything it owns.
///
/// Waits for every in-flight operation on the user. A server that no longer
/// knows the user counts as success.
///
/// # Errors
///
/// - `UserNotFound` if there is no such user
/// - `Provisioning` if the server cannot be reached; nothing is deleted
pub(crate) async fn delete_user<S, T, E>(
    engine: &Engine<S, T, E>,
    device_id: &str,
) -> Result<(), EngineError>
where
    S: Storage,
    T: KeyServerTransport,
    E: Environment,
{
    let _gate = engine.locks.write_user(device_id).await;

    let record = engine
        .storage
        .load_user(device_id)?
        .ok_or_else(|| EngineError::UserNotFound { device_id: device_id.to_string() })?;

    match request(&engine.transport, &record, ServerMessage::DeleteUser).await {
        Ok(answer) => expect_ack(&answer)?,
        Err(EngineError::Provisioning(ProvisioningError::ServerRejected {
            code: ErrorPayload::NOT_REGISTERED,
            ..
        })) => {
            tracing::debug!("{} was already unregistered", device_id);
        },
        Err(err) => return Err(err),
    }

    let mut batch = WriteBatch::new();
    batch.push(WriteOp::DeleteUser(device_id.to_string()));
    engine.storage.commit(&batch)?;

    tracing::info!("deleted user {}", device_id);
    Ok(())
}

/// Fetch bundles for `peers` from `user`'s key server.
///
/// Signatures are not checked here; the caller verifies each bundle so it
/// can attribute a failure to the right peer.
///
/// # Errors
///
/// - `PeerNotRegistered` for the first peer the server does not know
/// - `PrekeyExhausted` if a bundle lacks a one-time prekey and the
///   configuration requires one
/// - `MalformedResponse` for bundles that do not parse
pub(crate) async fn fetch_bundles<T: KeyServerTransport>(
    transport: &T,
    user: &LocalUserRecord,
    peers: &[String],
    require_one_time_prekey: bool,
) -> Result<HashMap<String, PreKeyBundle>, EngineError> {
    let mut bundles = HashMap::with_capacity(peers.len());

    for chunk in peers.chunks(MAX_BUNDLES_PER_REQUEST) {
        let query = ServerMessage::GetPeerBundles(PeerBundlesRequest { device_ids: chunk.to_vec() });
        let answer = request(transport, user, query).await?;
        let ServerMessage::PeerBundles(found) = answer else {
            return Err(unexpected(&answer));
        };

        if let Some(device_id) = found.missing.into_iter().next() {
            return Err(ProvisioningError::PeerNotRegistered { device_id }.into());
        }

        for bundle in found.bundles {
            if !chunk.contains(&bundle.device_id) {
                return Err(ProvisioningError::MalformedResponse(format!(
                    "bundle for {} was not requested",
                    bundle.device_id
                ))
                .into());
            }
            let parsed = parse_bundle(&bundle)?;
            if parsed.one_time_prekey.is_none() {
                if require_one_time_prekey {
                    return Err(
                        ProvisioningError::PrekeyExhausted { device_id: bundle.device_id }.into()
                    );
                }
                tracing::debug!("bundle for {} has no one-time prekey", bundle.device_id);
            }
            bundles.insert(bundle.device_id, parsed);
        }
    }

    if let Some(absent) = peers.iter().find(|peer| !bundles.contains_key(*peer)) {
        return Err(
            ProvisioningError::MalformedResponse(format!("no answer for {absent}")).into()
        );
    }

    tracing::debug!("fetched {} bundles for {}", bundles.len(), user.device_id);
    Ok(bundles)
}

fn parse_bundle(bundle: &PeerBundle) -> Result<PreKeyBundle, ProvisioningError> {
    let malformed = |e: peerlock_proto::ProtocolError| {
        ProvisioningError::MalformedResponse(format!("bundle for {}: {e}", bundle.device_id))
    };

    let one_time_prekey = match &bundle.one_time_prekey {
        Some(opk) => Some((opk.id, fixed_bytes("one_time_prekey", &opk.public_key).map_err(malformed)?)),
        None => None,
    };

    Ok(PreKeyBundle {
        identity_key: IdentityPublicKey(
            fixed_bytes("identity_key", &bundle.identity_key).map_err(malformed)?,
        ),
        signed_prekey_id: bundle.signed_prekey.id,
        signed_prekey: fixed_bytes("signed_prekey", &bundle.signed_prekey.public_key)
            .map_err(malformed)?,
        signed_prekey_signature: fixed_bytes("signature", &bundle.signed_prekey.signature)
            .map_err(malformed)?,
        one_time_prekey,
    })
}
