//! Enumerations exposed at the engine boundary.

use serde::{Deserialize, Serialize};

/// How verified a peer device's identity is.
///
/// Stored records only ever hold `Untrusted`, `Trusted` or `Fail`; `Unknown`
/// is what callers see when no record exists for the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerDeviceStatus {
    /// Never exchanged with this device
    Unknown,
    /// Identity key known but not verified out of band
    Untrusted,
    /// Identity key verified out of band
    Trusted,
    /// Last operation against this device failed cryptographically
    Fail,
}

impl std::fmt::Display for PeerDeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Untrusted => "untrusted",
            Self::Trusted => "trusted",
            Self::Fail => "fail",
        };
        f.write_str(name)
    }
}

/// Choice between a shared ciphertext and per-recipient plaintext wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EncryptionPolicy {
    /// Smallest output: plaintext in the ratchet message for a single
    /// recipient, shared ciphertext for two or more
    #[default]
    OptimizeSize,
    /// Always produce a shared ciphertext; ratchet messages carry only the
    /// content key
    CipherMessage,
    /// Never produce a shared ciphertext; every ratchet message carries the
    /// plaintext
    DrMessage,
}

impl EncryptionPolicy {
    /// Whether a call with `recipients` live recipients uses a shared
    /// ciphertext.
    #[must_use]
    pub const fn uses_cipher_message(self, recipients: usize) -> bool {
        match self {
            Self::OptimizeSize => recipients > 1,
            Self::CipherMessage => true,
            Self::DrMessage => false,
        }
    }
}

/// Result tag delivered to completion callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackOutcome {
    /// Operation completed
    Success,
    /// Operation failed and left state as it was
    Fail,
}
