//! Double Ratchet state machine
//!
//! One [`RatchetState`] per session. The state only derives keys: the caller
//! builds the message header from a [`SendStep`], seals the payload with
//! [`crate::aead`], and authenticates the header as associated data.
//!
//! The DH ratchet step that follows a newly received ratchet key is split in
//! two: the receiving half runs on receipt, the sending half (which needs a
//! fresh key pair) runs on the next send. Receiving therefore needs no
//! randomness.
//!
//! # Failure atomicity
//!
//! Every method that can fail may have partially advanced `self` when it
//! returns an error. Callers run them on a clone and keep the clone only on
//! success; [`RatchetState::mark_consumed`] is the one change applied to the
//! original after a failed decryption.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{
    CryptoError,
    chain::{ChainKey, MessageKey},
    kdf::derive_root,
    keys::{DhKeyPair, PUBLIC_KEY_SIZE},
    x3dh::SharedSecret,
};

/// Bounds on out-of-order handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetLimits {
    /// Maximum keys skipped in one chain for a single message
    pub max_skip: u32,
    /// Maximum cached skipped keys (and consumed markers) per session
    pub max_skipped_keys: usize,
}

impl Default for RatchetLimits {
    fn default() -> Self {
        Self { max_skip: 1024, max_skipped_keys: 2048 }
    }
}

/// Everything the caller needs to build and seal one outgoing message.
pub struct SendStep {
    /// Current sending ratchet public key, carried in the header
    pub ratchet_key: [u8; PUBLIC_KEY_SIZE],
    /// Length of the previous sending chain, carried in the header
    pub previous_chain_length: u32,
    /// Key for this message; its index goes in the header
    pub message_key: MessageKey,
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    ratchet_key: [u8; PUBLIC_KEY_SIZE],
    index: u32,
    key: [u8; 32],
}

impl Drop for SkippedKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ConsumedIndex {
    ratchet_key: [u8; PUBLIC_KEY_SIZE],
    index: u32,
}

/// Persistent Double Ratchet session state.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    root_key: [u8; 32],
    self_ratchet_secret: [u8; 32],
    self_ratchet_public: [u8; PUBLIC_KEY_SIZE],
    remote_ratchet: Option<[u8; PUBLIC_KEY_SIZE]>,
    sending: Option<ChainKey>,
    receiving: Option<ChainKey>,
    previous_sending_length: u32,
    pending_send_step: bool,
    skipped: VecDeque<SkippedKey>,
    consumed: VecDeque<ConsumedIndex>,
}

impl RatchetState {
    /// Session state for the X3DH initiator.
    ///
    /// The first sending chain is keyed against the responder's signed prekey,
    /// which doubles as its first ratchet key.
    pub fn initiator(
        secret: &SharedSecret,
        peer_signed_prekey: &[u8; PUBLIC_KEY_SIZE],
        ratchet_seed: [u8; 32],
    ) -> Result<Self, CryptoError> {
        let ratchet = DhKeyPair::from_seed(ratchet_seed);
        let mut dh = ratchet.agree(peer_signed_prekey)?;
        let (root_key, chain_key) = derive_root(secret.as_bytes(), &dh);
        dh.zeroize();

        Ok(Self {
            root_key,
            self_ratchet_secret: ratchet.secret_bytes(),
            self_ratchet_public: ratchet.public(),
            remote_ratchet: Some(*peer_signed_prekey),
            sending: Some(ChainKey::new(chain_key)),
            receiving: None,
            previous_sending_length: 0,
            pending_send_step: false,
            skipped: VecDeque::new(),
            consumed: VecDeque::new(),
        })
    }

    /// Session state for the X3DH responder, keyed by its signed prekey.
    ///
    /// A responder cannot send until it has received the initiator's first
    /// message.
    pub fn responder(secret: &SharedSecret, signed_prekey: &DhKeyPair) -> Self {
        Self {
            root_key: *secret.as_bytes(),
            self_ratchet_secret: signed_prekey.secret_bytes(),
            self_ratchet_public: signed_prekey.public(),
            remote_ratchet: None,
            sending: None,
            receiving: None,
            previous_sending_length: 0,
            pending_send_step: false,
            skipped: VecDeque::new(),
            consumed: VecDeque::new(),
        }
    }

    /// True once any message from the peer has been decrypted.
    pub fn has_received(&self) -> bool {
        self.receiving.is_some()
    }

    /// Messages sent on the current sending chain.
    pub fn sending_chain_length(&self) -> u32 {
        self.sending.as_ref().map_or(0, ChainKey::index)
    }

    /// Number of cached skipped message keys.
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Derive the key for the next outgoing message.
    ///
    /// `ratchet_seed` becomes the new ratchet key pair when a DH step is due
    /// and is ignored otherwise.
    pub fn prepare_send(&mut self, ratchet_seed: [u8; 32]) -> Result<SendStep, CryptoError> {
        if self.pending_send_step {
            let remote = self.remote_ratchet.ok_or(CryptoError::ChainNotReady)?;
            let ratchet = DhKeyPair::from_seed(ratchet_seed);
            let mut dh = ratchet.agree(&remote)?;
            let (root_key, chain_key) = derive_root(&self.root_key, &dh);
            dh.zeroize();

            self.previous_sending_length = self.sending_chain_length();
            self.root_key.zeroize();
            self.root_key = root_key;
            self.self_ratchet_secret.zeroize();
            self.self_ratchet_secret = ratchet.secret_bytes();
            self.self_ratchet_public = ratchet.public();
            self.sending = Some(ChainKey::new(chain_key));
            self.pending_send_step = false;
        }

        let chain = self.sending.as_mut().ok_or(CryptoError::ChainNotReady)?;
        let message_key = chain.next_key()?;

        Ok(SendStep {
            ratchet_key: self.self_ratchet_public,
            previous_chain_length: self.previous_sending_length,
            message_key,
        })
    }

    /// Derive the key for an incoming message.
    ///
    /// # Errors
    ///
    /// - `ReplayedMessage`: the key for this index was already used or marked
    ///   consumed
    /// - `TooManySkipped`: the index is further ahead than `limits.max_skip`
    /// - `InvalidKey`: the header ratchet key is unusable
    pub fn receive_key(
        &mut self,
        ratchet_key: &[u8; PUBLIC_KEY_SIZE],
        index: u32,
        previous_chain_length: u32,
        limits: RatchetLimits,
    ) -> Result<MessageKey, CryptoError> {
        if let Some(position) =
            self.skipped.iter().position(|s| &s.ratchet_key == ratchet_key && s.index == index)
            && let Some(cached) = self.skipped.remove(position)
        {
            return Ok(MessageKey::from_parts(cached.key, index));
        }

        if self.consumed.iter().any(|c| &c.ratchet_key == ratchet_key && c.index == index) {
            return Err(CryptoError::ReplayedMessage { index });
        }

        if self.remote_ratchet.as_ref() == Some(ratchet_key) {
            let Some(chain) = self.receiving.as_mut() else {
                return Err(CryptoError::DecryptionFailed {
                    reason: "message uses a ratchet key with no receiving chain".to_string(),
                });
            };
            let (skipped, key) = chain.skip_to(index, limits.max_skip)?;
            self.cache_skipped(*ratchet_key, skipped, limits);
            return Ok(key);
        }

        // New ratchet key from the peer: retire the current receiving chain
        if let (Some(chain), Some(old_remote)) = (self.receiving.as_mut(), self.remote_ratchet) {
            let retired = chain.skip_until(previous_chain_length, limits.max_skip)?;
            self.cache_skipped(old_remote, retired, limits);
        }

        let mut dh = DhKeyPair::from_seed(self.self_ratchet_secret).agree(ratchet_key)?;
        let (root_key, chain_key) = derive_root(&self.root_key, &dh);
        dh.zeroize();

        self.root_key.zeroize();
        self.root_key = root_key;
        self.remote_ratchet = Some(*ratchet_key);
        self.pending_send_step = true;

        let mut chain = ChainKey::new(chain_key);
        let (skipped, key) = chain.skip_to(index, limits.max_skip)?;
        self.receiving = Some(chain);
        self.cache_skipped(*ratchet_key, skipped, limits);

        Ok(key)
    }

    /// Record that the key for (`ratchet_key`, `index`) must not be used again.
    ///
    /// Applied after a failed decryption so that retrying the same message
    /// cannot be used as an oracle. Only indices that belong to a chain this
    /// session knows are recorded; returns whether the state changed.
    pub fn mark_consumed(
        &mut self,
        ratchet_key: &[u8; PUBLIC_KEY_SIZE],
        index: u32,
        limits: RatchetLimits,
    ) -> bool {
        if let Some(position) =
            self.skipped.iter().position(|s| &s.ratchet_key == ratchet_key && s.index == index)
        {
            self.skipped.remove(position);
        } else if self.remote_ratchet.as_ref() != Some(ratchet_key) {
            return false;
        }

        let marker = ConsumedIndex { ratchet_key: *ratchet_key, index };
        if self.consumed.contains(&marker) {
            return false;
        }
        self.consumed.push_back(marker);
        while self.consumed.len() > limits.max_skipped_keys {
            self.consumed.pop_front();
        }
        true
    }

    fn cache_skipped(
        &mut self,
        ratchet_key: [u8; PUBLIC_KEY_SIZE],
        keys: Vec<MessageKey>,
        limits: RatchetLimits,
    ) {
        for key in keys {
            let marker = ConsumedIndex { ratchet_key, index: key.index() };
            if self.consumed.contains(&marker) {
                continue;
            }
            self.skipped.push_back(SkippedKey { ratchet_key, index: key.index(), key: *key.key() });
        }
        while self.skipped.len() > limits.max_skipped_keys {
            self.skipped.pop_front();
        }
    }
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.self_ratchet_secret.zeroize();
    }
}

impl std::fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetState")
            .field("sending_chain_length", &self.sending_chain_length())
            .field("has_received", &self.has_received())
            .field("skipped", &self.skipped.len())
            .finish_non_exhaustive()
    }
}
