//! Error types for the peerlock engine.
//!
//! One enum for everything that reaches the caller. Lower layers keep their
//! own error types (`CryptoError`, `ProtocolError`, `StorageError`) and are
//! mapped here at the engine boundary.

use peerlock_crypto::CryptoError;
use peerlock_proto::ProtocolError;
use thiserror::Error;

use crate::storage::StorageError;

/// Why a key exchange with the key server or a peer bundle failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    /// Transport to the key server failed
    #[error("key server unreachable: {0}")]
    ServerUnreachable(String),

    /// Key server answered with an error payload
    #[error("key server rejected request (code {code}): {message}")]
    ServerRejected {
        /// Error code from the server
        code: u16,
        /// Server-provided description
        message: String,
    },

    /// Signed prekey signature on a fetched bundle did not verify
    #[error("invalid signed prekey signature for {device_id}")]
    InvalidSignature {
        /// Peer device whose bundle was rejected
        device_id: String,
    },

    /// Peer device has no bundle on the key server
    #[error("{device_id} is not registered on the key server")]
    PeerNotRegistered {
        /// Peer device id
        device_id: String,
    },

    /// Bundle came without a one-time prekey while one is required
    #[error("no one-time prekey left for {device_id}")]
    PrekeyExhausted {
        /// Peer device id
        device_id: String,
    },

    /// Key server response could not be understood
    #[error("malformed key server response: {0}")]
    MalformedResponse(String),

    /// No session able to send to the peer could be set up
    #[error("no usable session with {device_id}: {reason}")]
    SessionUnavailable {
        /// Peer device id
        device_id: String,
        /// What went wrong
        reason: String,
    },
}

/// Errors surfaced by engine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Identity or session bootstrap failed
    #[error("provisioning failed: {0}")]
    Provisioning(#[from] ProvisioningError),

    /// Request contradicts existing state
    #[error("conflict: {reason}")]
    Conflict {
        /// What conflicted
        reason: String,
    },

    /// Message could not be authenticated or was already consumed
    #[error("decryption failed: {reason}")]
    Decryption {
        /// Why decryption failed
        reason: String,
    },

    /// Message lies beyond the skip window
    #[error("message out of order: {skip} skipped, at most {max} allowed")]
    OutOfOrder {
        /// Messages that would need skipping
        skip: u32,
        /// Window size
        max: u32,
    },

    /// Durable state could not be read or written
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// No local user with this device id
    #[error("local user not found: {device_id}")]
    UserNotFound {
        /// Device id that was requested
        device_id: String,
    },

    /// Key maintenance failed for some local users
    #[error("update failed for {}: {reason}", failed.join(", "))]
    Maintenance {
        /// Device ids whose maintenance failed
        failed: Vec<String>,
        /// First failure encountered
        reason: String,
    },

    /// Caller-supplied arguments are unusable
    #[error("invalid input: {reason}")]
    InvalidInput {
        /// What was wrong
        reason: String,
    },
}

impl EngineError {
    /// Returns true if retrying the same call may succeed.
    ///
    /// Only transport failures qualify. Everything else reflects state that a
    /// retry would meet again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Provisioning(ProvisioningError::ServerUnreachable(_)))
    }

    /// Text delivered alongside `CallbackOutcome::Fail`.
    #[must_use]
    pub fn outcome_message(&self) -> String {
        self.to_string()
    }

    /// Shorthand for `InvalidInput`.
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput { reason: reason.into() }
    }
}

/// Crypto errors reaching the caller come from the receive path.
///
/// The send and bootstrap paths map their failures explicitly before they get
/// here.
impl From<CryptoError> for EngineError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::TooManySkipped { skip, max } => Self::OutOfOrder { skip, max },
            other => Self::Decryption { reason: other.to_string() },
        }
    }
}

/// Malformed inbound ratchet messages are decryption failures.
impl From<ProtocolError> for EngineError {
    fn from(err: ProtocolError) -> Self {
        Self::Decryption { reason: err.to_string() }
    }
}
