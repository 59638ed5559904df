//! Curve selector carried on every wire message.

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Elliptic curve a device identity was provisioned with.
///
/// Every message and key-server request carries the curve byte, so a peer
/// built with another curve is refused at decode time instead of mixing key
/// material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CurveId {
    /// Curve25519 (Ed25519 identities, X25519 agreement)
    C25519,
}

impl CurveId {
    /// Wire byte for this curve.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::C25519 => 0x01,
        }
    }

    /// Parse a wire byte.
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Self::C25519),
            other => Err(ProtocolError::UnknownCurve(other)),
        }
    }
}

impl std::fmt::Display for CurveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::C25519 => f.write_str("c25519"),
        }
    }
}
