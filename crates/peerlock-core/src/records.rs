//! Durable record schema.
//!
//! Everything the engine persists, as serde types. Storage backends encode
//! them with CBOR and never look inside. Records holding secret material
//! implement `Debug` by hand so seeds never reach logs.

use peerlock_crypto::RatchetState;
use peerlock_proto::{CurveId, X3dhInit};
use serde::{Deserialize, Serialize};

use crate::types::PeerDeviceStatus;

/// A local device identity.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUserRecord {
    /// Globally unique device id
    pub device_id: String,
    /// Key server this identity is registered with
    pub server_url: String,
    /// Curve the identity was provisioned with
    pub curve: CurveId,
    /// Ed25519 identity seed
    pub identity_seed: [u8; 32],
    /// Ed25519 identity public key
    pub identity_public: [u8; 32],
    /// One-time prekeys published at registration
    pub initial_opk_count: u16,
    /// Unix seconds
    pub created_at: u64,
}

impl std::fmt::Debug for LocalUserRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalUserRecord")
            .field("device_id", &self.device_id)
            .field("server_url", &self.server_url)
            .field("curve", &self.curve)
            .field("initial_opk_count", &self.initial_opk_count)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// A signed prekey owned by a local user.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    /// Prekey id, unique per owner
    pub id: u32,
    /// X25519 secret seed
    pub seed: [u8; 32],
    /// X25519 public key
    pub public: [u8; 32],
    /// Ed25519 signature over `id || public`
    pub signature: Vec<u8>,
    /// Unix seconds
    pub created_at: u64,
    /// When this key stopped being the published one. `None` while current.
    pub retired_at: Option<u64>,
    /// Initiator ephemeral keys of every session accepted under this prekey.
    /// Deleted with the prekey, so an initial message can never be accepted
    /// twice while its prekey still exists.
    #[serde(default)]
    pub accepted_ephemerals: Vec<[u8; 32]>,
}

impl SignedPreKeyRecord {
    /// Whether this is the prekey currently published on the server.
    #[must_use]
    pub const fn is_current(&self) -> bool {
        self.retired_at.is_none()
    }

    /// Whether an initial message with this ephemeral key was accepted
    /// under this prekey.
    #[must_use]
    pub fn has_accepted(&self, ephemeral_key: &[u8; 32]) -> bool {
        self.accepted_ephemerals.contains(ephemeral_key)
    }
}

impl std::fmt::Debug for SignedPreKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedPreKeyRecord")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("retired_at", &self.retired_at)
            .field("accepted", &self.accepted_ephemerals.len())
            .finish_non_exhaustive()
    }
}

/// A one-time prekey owned by a local user.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyRecord {
    /// Prekey id, unique per owner
    pub id: u32,
    /// X25519 secret seed
    pub seed: [u8; 32],
    /// X25519 public key
    pub public: [u8; 32],
    /// When the key server stopped listing this key. A peer may have fetched
    /// it, so it is kept until the limbo period runs out.
    pub dispatched_at: Option<u64>,
}

impl std::fmt::Debug for OneTimePreKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneTimePreKeyRecord")
            .field("id", &self.id)
            .field("dispatched_at", &self.dispatched_at)
            .finish_non_exhaustive()
    }
}

/// What a local user knows about one peer device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDeviceRecord {
    /// Peer device id
    pub device_id: String,
    /// Peer Ed25519 identity public key
    pub identity_key: [u8; 32],
    /// Stored trust status, never `Unknown`
    pub status: PeerDeviceStatus,
    /// Unix seconds of the last status or key change
    pub updated_at: u64,
}

/// One Double Ratchet session with a peer device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Random id, used in logs
    pub session_id: u64,
    /// Ratchet state
    pub ratchet: RatchetState,
    /// Associated data bound into every message of this session
    pub associated_data: [u8; 32],
    /// X3DH values to attach to outgoing messages until the peer replies
    pub pending_init: Option<X3dhInit>,
    /// Initiator ephemeral key this session was accepted from. A second
    /// initial message with the same key is a replay, not a new session.
    pub peer_ephemeral: Option<[u8; 32]>,
    /// Unix seconds
    pub created_at: u64,
    /// Unix seconds of the last successful encrypt or decrypt
    pub last_activity: u64,
}

/// All sessions a local user holds with one peer device.
///
/// At most one is active. Older sessions are kept, newest first, so late
/// messages sent on them still decrypt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSet {
    /// Session used for encrypting
    pub active: Option<SessionRecord>,
    /// Previous sessions, newest first
    pub stale: Vec<SessionRecord>,
}

impl SessionSet {
    /// Make `session` active, moving the current one to the front of the
    /// stale list and keeping at most `max_stale` stale sessions.
    pub fn activate(&mut self, session: SessionRecord, max_stale: usize) {
        if let Some(previous) = self.active.replace(session) {
            self.stale.insert(0, previous);
        }
        self.stale.truncate(max_stale);
    }

    /// Drop stale sessions idle since before `cutoff`. Returns how many were
    /// removed.
    pub fn prune_stale(&mut self, cutoff: u64) -> usize {
        let before = self.stale.len();
        self.stale.retain(|s| s.last_activity >= cutoff);
        before - self.stale.len()
    }

    /// Whether any session was accepted from this initiator ephemeral key.
    #[must_use]
    pub fn accepted_from(&self, ephemeral_key: &[u8; 32]) -> bool {
        self.active.iter().chain(&self.stale).any(|s| s.peer_ephemeral.as_ref() == Some(ephemeral_key))
    }

    /// True if no session is left.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_none() && self.stale.is_empty()
    }
}
