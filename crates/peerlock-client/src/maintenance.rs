//! Key maintenance.
//!
//! `update` walks every local user:
//!
//! 1. Rotate the signed prekey once it is older than `spk_lifetime`. The
//!    replaced key keeps accepting initial messages for `spk_limbo`.
//! 2. Reconcile one-time prekeys with the server. Keys the server no longer
//!    holds were handed out; they are kept for `opk_limbo` so late initial
//!    messages still decrypt, then deleted. Below the low limit a new batch is
//!    generated and published.
//! 3. Drop replaced signed prekeys past their limbo and stale sessions idle
//!    longer than `session_retention`.
//!
//! Established sessions are never touched by rotation. Each user is handled
//! independently and failures are attributed to the user they happened on.

use std::collections::HashSet;

use peerlock_core::{
    EngineError, Environment, LocalUserRecord, Storage, WriteBatch, WriteOp,
};
use peerlock_crypto::IdentityKeyPair;
use peerlock_proto::ServerMessage;

use crate::{
    identity::{
        generate_one_time_prekeys, generate_signed_prekey, one_time_prekey_data,
        signed_prekey_data,
    },
    manager::Engine,
    provisioner::{expect_ack, request, unexpected},
    transport::KeyServerTransport,
};

/// What `update` did for one local user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserUpdate {
    /// Local user
    pub device_id: String,
    /// A new signed prekey was published
    pub rotated_signed_prekey: bool,
    /// One-time prekeys generated and published
    pub published_one_time_prekeys: usize,
    /// Handed-out one-time prekeys deleted after their limbo
    pub removed_one_time_prekeys: usize,
    /// Replaced signed prekeys deleted after their limbo
    pub removed_signed_prekeys: usize,
    /// Stale sessions dropped
    pub pruned_sessions: usize,
}

/// Summary of a successful `update`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// One entry per local user, ordered by device id
    pub users: Vec<UserUpdate>,
}

/// Run maintenance for every local user.
///
/// # Errors
///
/// `Maintenance` naming every user whose maintenance failed, with the first
/// failure's message. Users that succeeded keep their changes.
pub(crate) async fn update<S, T, E>(
    engine: &Engine<S, T, E>,
    low_limit: usize,
    batch_size: usize,
) -> Result<UpdateReport, EngineError>
where
    S: Storage,
    T: KeyServerTransport,
    E: Environment,
{
    let mut users = engine.storage.list_users()?;
    users.sort();

    let mut report = UpdateReport::default();
    let mut failed = Vec::new();
    let mut reason = None;

    for device_id in users {
        match update_user(engine, &device_id, low_limit, batch_size).await {
            Ok(Some(summary)) => report.users.push(summary),
            Ok(None) => tracing::debug!("{} was deleted during update", device_id),
            Err(err) => {
                tracing::warn!("update failed for {}: {}", device_id, err);
                reason.get_or_insert_with(|| err.outcome_message());
                failed.push(device_id);
            },
        }
    }

    engine.locks.prune();

    match reason {
        None => {
            tracing::info!("update finished for {} users", report.users.len());
            Ok(report)
        },
        Some(reason) => Err(EngineError::Maintenance { failed, reason }),
    }
}

async fn update_user<S, T, E>(
    engine: &Engine<S, T, E>,
    device_id: &str,
    low_limit: usize,
    batch_size: usize,
) -> Result<Option<UserUpdate>, EngineError>
where
    S: Storage,
    T: KeyServerTransport,
    E: Environment,
{
    let _gate = engine.locks.read_user(device_id).await;
    let Some(user) = engine.storage.load_user(device_id)? else {
        return Ok(None);
    };

    let now = engine.env.wall_clock_secs();
    let mut summary = UserUpdate { device_id: device_id.to_string(), ..UserUpdate::default() };

    {
        let _prekeys = engine.locks.prekeys(device_id).await;
        summary.rotated_signed_prekey = rotate_signed_prekey(engine, &user, now).await?;
        refresh_prekeys(engine, &user, low_limit, batch_size, now, &mut summary).await?;
    }

    summary.pruned_sessions = prune_sessions(engine, device_id, now).await?;

    tracing::debug!(
        "update {}: rotated {}, published {}, removed {}, pruned {}",
        device_id,
        summary.rotated_signed_prekey,
        summary.published_one_time_prekeys,
        summary.removed_one_time_prekeys,
        summary.pruned_sessions
    );
    Ok(Some(summary))
}

/// Publish a new signed prekey if the current one is due.
///
/// The new key is published before it is stored: a key stored but never
/// published would be considered current and never reach the server.
async fn rotate_signed_prekey<S, T, E>(
    engine: &Engine<S, T, E>,
    user: &LocalUserRecord,
    now: u64,
) -> Result<bool, EngineError>
where
    S: Storage,
    T: KeyServerTransport,
    E: Environment,
{
    let owner = &user.device_id;
    let existing = engine.storage.load_signed_prekeys(owner)?;
    let current = existing.iter().find(|spk| spk.is_current());
    let lifetime = engine.config.spk_lifetime.as_secs();
    if current.is_some_and(|spk| now.saturating_sub(spk.created_at) < lifetime) {
        return Ok(false);
    }

    let identity = IdentityKeyPair::from_seed(&user.identity_seed);
    let taken: Vec<u32> = existing.iter().map(|spk| spk.id).collect();
    let fresh = generate_signed_prekey(&engine.env, &identity, &taken, now);

    let answer =
        request(&engine.transport, user, ServerMessage::PostSignedPreKey(signed_prekey_data(&fresh)))
            .await?;
    expect_ack(&answer)?;

    let mut batch = WriteBatch::new();
    if let Some(previous) = current {
        let mut retired = previous.clone();
        retired.retired_at = Some(now);
        batch.push(WriteOp::PutSignedPreKey { owner: owner.clone(), record: retired });
    }
    let fresh_id = fresh.id;
    batch.push(WriteOp::PutSignedPreKey { owner: owner.clone(), record: fresh });
    engine.storage.commit(&batch)?;

    tracing::info!("rotated signed prekey of {} to {}", owner, fresh_id);
    Ok(true)
}

/// Reconcile one-time prekeys with the server and top them up.
///
/// New keys are stored before they are published: a stored key the server
/// never received simply ages out like a handed-out one.
async fn refresh_prekeys<S, T, E>(
    engine: &Engine<S, T, E>,
    user: &LocalUserRecord,
    low_limit: usize,
    batch_size: usize,
    now: u64,
    summary: &mut UserUpdate,
) -> Result<(), EngineError>
where
    S: Storage,
    T: KeyServerTransport,
    E: Environment,
{
    let owner = &user.device_id;
    let answer = request(&engine.transport, user, ServerMessage::GetSelfOneTimePreKeys).await?;
    let ServerMessage::SelfOneTimePreKeys(remaining) = answer else {
        return Err(unexpected(&answer));
    };
    let on_server: HashSet<u32> = remaining.ids.into_iter().collect();

    let opk_limbo = engine.config.opk_limbo.as_secs();
    let local = engine.storage.load_one_time_prekeys(owner)?;
    let mut batch = WriteBatch::new();

    for opk in local.iter().filter(|opk| !on_server.contains(&opk.id)) {
        match opk.dispatched_at {
            None => {
                let mut dispatched = opk.clone();
                dispatched.dispatched_at = Some(now);
                batch.push(WriteOp::PutOneTimePreKey { owner: owner.clone(), record: dispatched });
            },
            Some(at) if now.saturating_sub(at) >= opk_limbo => {
                batch.push(WriteOp::DeleteOneTimePreKey { owner: owner.clone(), id: opk.id });
                summary.removed_one_time_prekeys += 1;
            },
            Some(_) => {},
        }
    }

    let spk_limbo = engine.config.spk_limbo.as_secs();
    for spk in engine.storage.load_signed_prekeys(owner)? {
        if let Some(at) = spk.retired_at
            && now.saturating_sub(at) >= spk_limbo
        {
            batch.push(WriteOp::DeleteSignedPreKey { owner: owner.clone(), id: spk.id });
            summary.removed_signed_prekeys += 1;
        }
    }

    let fresh = if on_server.len() < low_limit && batch_size > 0 {
        let taken: Vec<u32> = local.iter().map(|opk| opk.id).collect();
        generate_one_time_prekeys(&engine.env, &taken, batch_size)
    } else {
        Vec::new()
    };
    let upload: Vec<_> = fresh.iter().map(one_time_prekey_data).collect();
    batch.extend(
        fresh.into_iter().map(|opk| WriteOp::PutOneTimePreKey { owner: owner.clone(), record: opk }),
    );

    if !batch.is_empty() {
        engine.storage.commit(&batch)?;
    }

    if !upload.is_empty() {
        let count = upload.len();
        expect_ack(
            &request(&engine.transport, user, ServerMessage::PostOneTimePreKeys(upload)).await?,
        )?;
        summary.published_one_time_prekeys = count;
        tracing::info!("published {} one-time prekeys for {}", count, owner);
    }

    Ok(())
}

/// Drop stale sessions idle past the retention period.
async fn prune_sessions<S, T, E>(
    engine: &Engine<S, T, E>,
    owner: &str,
    now: u64,
) -> Result<usize, EngineError>
where
    S: Storage,
    T: KeyServerTransport,
    E: Environment,
{
    let cutoff = now.saturating_sub(engine.config.session_retention.as_secs());
    let mut pruned = 0;

    for peer in engine.storage.list_session_peers(owner)? {
        let _session = engine.locks.sessions(owner, std::slice::from_ref(&peer)).await;
        let Some(mut sessions) = engine.storage.load_sessions(owner, &peer)? else {
            continue;
        };
        let removed = sessions.prune_stale(cutoff);
        if removed > 0 {
            let mut batch = WriteBatch::new();
            batch.put_sessions(owner, &peer, sessions);
            engine.storage.commit(&batch)?;
            pruned += removed;
        }
    }

    Ok(pruned)
}
