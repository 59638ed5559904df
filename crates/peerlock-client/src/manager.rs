//! Engine front door.
//!
//! [`Manager`] is a cheap, cloneable handle on the engine. Every operation is
//! an `async fn` returning its result; [`Manager::submit`] runs one on its
//! own task and reports through a callback instead.

use std::{future::Future, sync::Arc};

use peerlock_core::{
    CurveId, EncryptionPolicy, EngineError, Environment, PeerDeviceStatus, Storage, WriteBatch,
    WriteOp, trust,
};
use tokio::task::JoinHandle;

use crate::{
    config::EngineConfig,
    decryptor::{self, Decrypted},
    dispatcher::{self, Completion},
    encryptor::{self, EncryptOutput, OutputSizeBound},
    identity::{LocalIdentity, validate_device_id},
    locks::LockTable,
    maintenance::{self, UpdateReport},
    provisioner,
    transport::KeyServerTransport,
};

/// Shared engine state behind every [`Manager`] clone.
pub(crate) struct Engine<S, T, E> {
    pub(crate) storage: S,
    pub(crate) transport: T,
    pub(crate) env: E,
    pub(crate) config: EngineConfig,
    pub(crate) locks: LockTable,
}

/// Multi-device end-to-end encryption engine.
///
/// # Concurrency
///
/// Operations on different (local user, peer device) pairs run in parallel.
/// Operations on the same pair are serialized. `delete_user` waits for every
/// in-flight operation on that user; anything started after it completes
/// fails with `UserNotFound`.
pub struct Manager<S, T, E> {
    engine: Arc<Engine<S, T, E>>,
}

impl<S, T, E> Clone for Manager<S, T, E> {
    fn clone(&self) -> Self {
        Self { engine: Arc::clone(&self.engine) }
    }
}

impl<S, T, E> Manager<S, T, E>
where
    S: Storage,
    T: KeyServerTransport,
    E: Environment,
{
    /// Build an engine over `storage`, reaching key servers through
    /// `transport`.
    pub fn new(storage: S, transport: T, env: E, config: EngineConfig) -> Self {
        Self {
            engine: Arc::new(Engine { storage, transport, env, config, locks: LockTable::default() }),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.engine.config
    }

    /// Run `operation` on its own task and hand the result to `callback`.
    ///
    /// The callback runs exactly once, in completion order relative to other
    /// submitted operations.
    ///
    /// ```ignore
    /// manager.submit(
    ///     |m| async move { m.update_with_defaults().await },
    ///     |done| println!("update: {:?} {}", done.outcome, done.message),
    /// );
    /// ```
    pub fn submit<V, Op, Fut, C>(&self, operation: Op, callback: C) -> JoinHandle<()>
    where
        V: Send + 'static,
        Op: FnOnce(Self) -> Fut,
        Fut: Future<Output = Result<V, EngineError>> + Send + 'static,
        C: FnOnce(Completion<V>) + Send + 'static,
    {
        dispatcher::dispatch(operation(self.clone()), callback)
    }

    /// Provision `device_id` and register it with the key server at
    /// `server_url`.
    ///
    /// `one_time_prekeys` defaults to `EngineConfig::default_opk_batch`.
    /// Repeating a creation with identical parameters succeeds without
    /// changing anything.
    ///
    /// # Errors
    ///
    /// - `Conflict` if the device id exists with another server, curve or
    ///   one-time prekey count
    /// - `Provisioning` if the server cannot be reached or refuses
    pub async fn create_user(
        &self,
        device_id: &str,
        server_url: &str,
        curve: CurveId,
        one_time_prekeys: Option<u16>,
    ) -> Result<(), EngineError> {
        provisioner::create_user(&self.engine, device_id, server_url, curve, one_time_prekeys).await
    }

    /// Unregister `device_id` and delete its keys, peers and sessions.
    ///
    /// # Errors
    ///
    /// - `UserNotFound` if there is no such user
    /// - `Provisioning` if the key server cannot be reached
    pub async fn delete_user(&self, device_id: &str) -> Result<(), EngineError> {
        provisioner::delete_user(&self.engine, device_id).await
    }

    /// Whether `device_id` is a local user.
    pub fn is_user(&self, device_id: &str) -> Result<bool, EngineError> {
        Ok(self.engine.storage.load_user(device_id)?.is_some())
    }

    /// Identity public key of a local user, for out-of-band verification.
    pub fn get_self_identity_key(&self, device_id: &str) -> Result<[u8; 32], EngineError> {
        Ok(LocalIdentity::load(&self.engine.storage, device_id)?.public())
    }

    /// Key server URL of a local user.
    pub fn get_server_url(&self, device_id: &str) -> Result<String, EngineError> {
        Ok(LocalIdentity::load(&self.engine.storage, device_id)?.record.server_url)
    }

    /// Point a local user at another key server.
    ///
    /// Nothing is re-published; the new server must already know the user.
    pub async fn set_server_url(&self, device_id: &str, server_url: &str) -> Result<(), EngineError> {
        let _gate = self.engine.locks.read_user(device_id).await;
        let mut record = LocalIdentity::load(&self.engine.storage, device_id)?.record;
        record.server_url = server_url.to_string();

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::PutUser(record));
        self.engine.storage.commit(&batch)?;
        tracing::info!("{} now uses key server {}", device_id, server_url);
        Ok(())
    }

    /// Encrypt `plaintext` from `local_id` to `recipients`.
    ///
    /// `context` (for example a conversation id) is authenticated and must be
    /// passed unchanged to `decrypt`.
    ///
    /// # Errors
    ///
    /// See [`EngineError`]. On error no session has advanced.
    pub async fn encrypt(
        &self,
        local_id: &str,
        context: &str,
        recipients: &[String],
        plaintext: &[u8],
        policy: EncryptionPolicy,
    ) -> Result<EncryptOutput, EngineError> {
        encryptor::encrypt(&self.engine, local_id, context, recipients, plaintext, policy).await
    }

    /// Decrypt a ratchet message from `sender`.
    ///
    /// # Errors
    ///
    /// `Decryption` or `OutOfOrder` when the message cannot be opened;
    /// session state is then unchanged apart from consumed-key markers.
    pub async fn decrypt(
        &self,
        local_id: &str,
        context: &str,
        sender: &str,
        ratchet_message: &[u8],
        cipher_message: Option<&[u8]>,
    ) -> Result<Decrypted, EngineError> {
        decryptor::decrypt(&self.engine, local_id, context, sender, ratchet_message, cipher_message)
            .await
    }

    /// Record a verification decision about a peer device.
    ///
    /// `identity_key` is what the caller verified. It is stored if the peer
    /// is new; if a different key is already stored nothing changes.
    ///
    /// # Errors
    ///
    /// - `Conflict` if `identity_key` differs from the stored key
    /// - `InvalidInput` for `PeerDeviceStatus::Unknown`
    pub async fn set_peer_device_status(
        &self,
        local_id: &str,
        peer_id: &str,
        identity_key: &[u8; 32],
        status: PeerDeviceStatus,
    ) -> Result<(), EngineError> {
        validate_device_id(peer_id)?;
        let _gate = self.engine.locks.read_user(local_id).await;
        LocalIdentity::load(&self.engine.storage, local_id)?;
        let _session = self.engine.locks.sessions(local_id, &[peer_id.to_string()]).await;

        let existing = self.engine.storage.load_peer(local_id, peer_id)?;
        let now = self.engine.env.wall_clock_secs();
        let record = trust::set_status(existing.as_ref(), peer_id, identity_key, status, now)?;

        let mut batch = WriteBatch::new();
        batch.put_peer(local_id, record);
        self.engine.storage.commit(&batch)?;
        tracing::info!("{} marked {} as {}", local_id, peer_id, status);
        Ok(())
    }

    /// Status of a peer device; `Unknown` if never seen.
    pub fn get_peer_device_status(
        &self,
        local_id: &str,
        peer_id: &str,
    ) -> Result<PeerDeviceStatus, EngineError> {
        Ok(trust::reported_status(self.engine.storage.load_peer(local_id, peer_id)?.as_ref()))
    }

    /// Forget a peer device and every session with it.
    pub async fn delete_peer_device(&self, local_id: &str, peer_id: &str) -> Result<(), EngineError> {
        let _gate = self.engine.locks.read_user(local_id).await;
        LocalIdentity::load(&self.engine.storage, local_id)?;
        let _session = self.engine.locks.sessions(local_id, &[peer_id.to_string()]).await;

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::DeletePeer { owner: local_id.to_string(), peer: peer_id.to_string() });
        self.engine.storage.commit(&batch)?;
        tracing::info!("{} forgot peer {}", local_id, peer_id);
        Ok(())
    }

    /// Key maintenance for every local user.
    ///
    /// Tops up one-time prekeys by `batch_size` for users with fewer than
    /// `low_limit` left on the server.
    ///
    /// # Errors
    ///
    /// `Maintenance` listing the users whose maintenance failed.
    pub async fn update(&self, low_limit: usize, batch_size: usize) -> Result<UpdateReport, EngineError> {
        maintenance::update(&self.engine, low_limit, batch_size).await
    }

    /// [`Manager::update`] with the configured limits.
    pub async fn update_with_defaults(&self) -> Result<UpdateReport, EngineError> {
        let config = &self.engine.config;
        self.update(config.opk_server_low_limit, config.opk_batch_size).await
    }

    /// Upper bounds on what `encrypt` produces for these parameters.
    pub fn max_encrypt_output_size(
        &self,
        plaintext_len: usize,
        recipients: usize,
        policy: EncryptionPolicy,
    ) -> OutputSizeBound {
        encryptor::max_output_size(plaintext_len, recipients, policy)
    }
}
