//! Error types for cryptographic operations

use thiserror::Error;

/// Errors from key agreement and ratchet operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Public key bytes do not decode to a usable curve point, or a
    /// Diffie-Hellman exchange produced a non-contributory output
    #[error("invalid key: {reason}")]
    InvalidKey {
        /// What was wrong with the key
        reason: String,
    },

    /// Signature over a signed prekey does not verify
    #[error("invalid signature")]
    InvalidSignature,

    /// AEAD authentication failed
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason for decryption failure
        reason: String,
    },

    /// Message index is further ahead than the skip window allows
    #[error("too many skipped messages: {skip} exceeds window of {max}")]
    TooManySkipped {
        /// Number of keys that would have to be skipped
        skip: u32,
        /// Configured window
        max: u32,
    },

    /// Message key for this index was already used or marked consumed
    #[error("message {index} was already consumed")]
    ReplayedMessage {
        /// Index of the replayed message in its chain
        index: u32,
    },

    /// Sending chain has no message keys left
    #[error("sending chain exhausted")]
    ChainExhausted,

    /// No sending chain yet: a responder cannot send before receiving
    #[error("sending chain not initialised")]
    ChainNotReady,
}

impl CryptoError {
    /// Returns true if the session that produced this error must be replaced
    ///
    /// Non-fatal errors concern one message only: the session stays usable for
    /// subsequent messages.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::InvalidKey { .. } => true,
            Self::InvalidSignature => true,
            Self::ChainExhausted => true,
            Self::ChainNotReady => true,

            Self::DecryptionFailed { .. } => false,
            Self::TooManySkipped { .. } => false,
            Self::ReplayedMessage { .. } => false,
        }
    }
}
