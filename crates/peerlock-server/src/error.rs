//! Registry error types.

use peerlock_proto::ErrorPayload;
use thiserror::Error;

/// Why the key server refused a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Request could not be parsed or breaks a limit
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Device already has a registration
    #[error("{device_id} is already registered")]
    AlreadyRegistered {
        /// Device id
        device_id: String,
    },

    /// Device has no registration
    #[error("{device_id} is not registered")]
    NotRegistered {
        /// Device id
        device_id: String,
    },

    /// Signed prekey signature does not verify against the identity key
    #[error("invalid signed prekey signature from {device_id}")]
    InvalidSignature {
        /// Device id
        device_id: String,
    },
}

impl RegistryError {
    /// Error code sent to the client.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => ErrorPayload::BAD_REQUEST,
            Self::AlreadyRegistered { .. } => ErrorPayload::ALREADY_REGISTERED,
            Self::NotRegistered { .. } => ErrorPayload::NOT_REGISTERED,
            Self::InvalidSignature { .. } => ErrorPayload::INVALID_SIGNATURE,
        }
    }

    /// Wire form of this error.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.code(), self.to_string())
    }
}
