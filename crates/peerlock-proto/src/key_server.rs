//! Key server protocol.
//!
//! Every request and response is a fixed 4-byte header followed by a CBOR
//! body:
//!
//! ```text
//! [version: u8][opcode: u8][curve: u8][reserved: u8][CBOR body]
//! ```
//!
//! The opcode identifies the body type, so the CBOR carries no variant tag.
//! The sender's device id is not part of the message: the transport supplies
//! it alongside the body.

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    CurveId,
    errors::{ProtocolError, Result},
};

/// Maximum accepted body size (1 MB)
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Maximum one-time prekeys in a single upload
pub const MAX_ONE_TIME_PREKEYS_PER_UPLOAD: usize = 1000;

/// Maximum device ids in a single bundle request
pub const MAX_BUNDLES_PER_REQUEST: usize = 500;

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct ServerHeader {
    version: u8,
    opcode: u8,
    curve: u8,
    reserved: u8,
}

impl ServerHeader {
    const SIZE: usize = 4;
    const VERSION: u8 = 0x01;
}

/// Key server message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Register a device: identity key, signed prekey, one-time prekeys
    RegisterUser = 0x01,
    /// Remove a device and all its prekeys
    DeleteUser = 0x02,
    /// Replace the signed prekey
    PostSignedPreKey = 0x03,
    /// Add one-time prekeys
    PostOneTimePreKeys = 0x04,
    /// Fetch bundles for a list of devices
    GetPeerBundles = 0x05,
    /// List the caller's one-time prekey ids still on the server
    GetSelfOneTimePreKeys = 0x06,
    /// Request accepted
    Ack = 0x80,
    /// Bundles answer
    PeerBundles = 0x81,
    /// Own one-time prekey ids answer
    SelfOneTimePreKeys = 0x82,
    /// Request rejected
    Error = 0xFF,
}

impl Opcode {
    /// Parse an opcode byte.
    pub fn from_u8(byte: u8) -> Result<Self> {
        Ok(match byte {
            0x01 => Self::RegisterUser,
            0x02 => Self::DeleteUser,
            0x03 => Self::PostSignedPreKey,
            0x04 => Self::PostOneTimePreKeys,
            0x05 => Self::GetPeerBundles,
            0x06 => Self::GetSelfOneTimePreKeys,
            0x80 => Self::Ack,
            0x81 => Self::PeerBundles,
            0x82 => Self::SelfOneTimePreKeys,
            0xFF => Self::Error,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }

    /// Wire byte.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

/// A signed prekey as uploaded and served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyData {
    /// Prekey id, chosen by the owner
    pub id: u32,
    /// X25519 public key (32 bytes)
    pub public_key: Vec<u8>,
    /// Identity signature over id || public key (64 bytes)
    pub signature: Vec<u8>,
}

/// A one-time prekey as uploaded and served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyData {
    /// Prekey id, chosen by the owner
    pub id: u32,
    /// X25519 public key (32 bytes)
    pub public_key: Vec<u8>,
}

/// Device registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterUser {
    /// Identity public key (32 bytes)
    pub identity_key: Vec<u8>,
    /// Initial signed prekey
    pub signed_prekey: SignedPreKeyData,
    /// Initial one-time prekeys
    pub one_time_prekeys: Vec<OneTimePreKeyData>,
}

/// Bundle request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerBundlesRequest {
    /// Devices to fetch, answered in the same order
    pub device_ids: Vec<String>,
}

/// One device's bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerBundle {
    /// Device the bundle belongs to
    pub device_id: String,
    /// Identity public key (32 bytes)
    pub identity_key: Vec<u8>,
    /// Current signed prekey
    pub signed_prekey: SignedPreKeyData,
    /// A one-time prekey, removed from the server by this fetch
    pub one_time_prekey: Option<OneTimePreKeyData>,
}

/// Answer to a bundle request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerBundles {
    /// Bundles for registered devices
    pub bundles: Vec<PeerBundle>,
    /// Requested devices that are not registered
    pub missing: Vec<String>,
}

/// Answer listing the caller's one-time prekeys still on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfOneTimePreKeys {
    /// Ids of unconsumed one-time prekeys
    pub ids: Vec<u32>,
}

/// Error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code identifying the type of error.
    pub code: u16,
    /// Human-readable error message.
    pub message: String,
}

impl ErrorPayload {
    /// Body or header could not be parsed.
    pub const BAD_REQUEST: u16 = 0x0001;
    /// Device id already registered with different keys.
    pub const ALREADY_REGISTERED: u16 = 0x0002;
    /// Device id is not registered.
    pub const NOT_REGISTERED: u16 = 0x0003;
    /// Signed prekey signature does not verify.
    pub const INVALID_SIGNATURE: u16 = 0x0004;
    /// Server-side storage failure.
    pub const SERVER_ERROR: u16 = 0x0005;

    /// Create an error payload.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// All key server messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// See [`Opcode::RegisterUser`]
    RegisterUser(RegisterUser),
    /// See [`Opcode::DeleteUser`]
    DeleteUser,
    /// See [`Opcode::PostSignedPreKey`]
    PostSignedPreKey(SignedPreKeyData),
    /// See [`Opcode::PostOneTimePreKeys`]
    PostOneTimePreKeys(Vec<OneTimePreKeyData>),
    /// See [`Opcode::GetPeerBundles`]
    GetPeerBundles(PeerBundlesRequest),
    /// See [`Opcode::GetSelfOneTimePreKeys`]
    GetSelfOneTimePreKeys,
    /// See [`Opcode::Ack`]
    Ack,
    /// See [`Opcode::PeerBundles`]
    PeerBundles(PeerBundles),
    /// See [`Opcode::SelfOneTimePreKeys`]
    SelfOneTimePreKeys(SelfOneTimePreKeys),
    /// See [`Opcode::Error`]
    Error(ErrorPayload),
}

impl ServerMessage {
    /// Opcode corresponding to this message type.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::RegisterUser(_) => Opcode::RegisterUser,
            Self::DeleteUser => Opcode::DeleteUser,
            Self::PostSignedPreKey(_) => Opcode::PostSignedPreKey,
            Self::PostOneTimePreKeys(_) => Opcode::PostOneTimePreKeys,
            Self::GetPeerBundles(_) => Opcode::GetPeerBundles,
            Self::GetSelfOneTimePreKeys => Opcode::GetSelfOneTimePreKeys,
            Self::Ack => Opcode::Ack,
            Self::PeerBundles(_) => Opcode::PeerBundles,
            Self::SelfOneTimePreKeys(_) => Opcode::SelfOneTimePreKeys,
            Self::Error(_) => Opcode::Error,
        }
    }

    /// Serialize header and body.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn encode(&self, curve: CurveId) -> Result<Vec<u8>> {
        let header = ServerHeader {
            version: ServerHeader::VERSION,
            opcode: self.opcode().to_u8(),
            curve: curve.to_u8(),
            reserved: 0,
        };

        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(header.as_bytes());

        match self {
            Self::RegisterUser(inner) => ciborium::ser::into_writer(inner, &mut out),
            Self::PostSignedPreKey(inner) => ciborium::ser::into_writer(inner, &mut out),
            Self::PostOneTimePreKeys(inner) => ciborium::ser::into_writer(inner, &mut out),
            Self::GetPeerBundles(inner) => ciborium::ser::into_writer(inner, &mut out),
            Self::PeerBundles(inner) => ciborium::ser::into_writer(inner, &mut out),
            Self::SelfOneTimePreKeys(inner) => ciborium::ser::into_writer(inner, &mut out),
            Self::Error(inner) => ciborium::ser::into_writer(inner, &mut out),
            Self::DeleteUser | Self::GetSelfOneTimePreKeys | Self::Ack => Ok(()), // Zero-byte bodies
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;

        Ok(out)
    }

    /// Parse header and body.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FrameTooShort` if the header is truncated
    /// - `ProtocolError::UnsupportedVersion`, `UnknownOpcode`, `UnknownCurve`
    ///   for unknown header bytes
    /// - `ProtocolError::PayloadTooLarge` if the body exceeds
    ///   [`MAX_BODY_SIZE`] (checked before CBOR parsing)
    /// - `ProtocolError::CborDecode` if the body does not match the opcode
    pub fn decode(bytes: &[u8]) -> Result<(CurveId, Self)> {
        let (header, body) = ServerHeader::ref_from_prefix(bytes).map_err(|_| {
            ProtocolError::FrameTooShort { expected: ServerHeader::SIZE, actual: bytes.len() }
        })?;

        if header.version != ServerHeader::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }
        let opcode = Opcode::from_u8(header.opcode)?;
        let curve = CurveId::from_u8(header.curve)?;

        if body.len() > MAX_BODY_SIZE {
            return Err(ProtocolError::PayloadTooLarge { size: body.len(), max: MAX_BODY_SIZE });
        }

        let message = match opcode {
            Opcode::RegisterUser => Self::RegisterUser(from_cbor(body)?),
            Opcode::DeleteUser => Self::DeleteUser,
            Opcode::PostSignedPreKey => Self::PostSignedPreKey(from_cbor(body)?),
            Opcode::PostOneTimePreKeys => Self::PostOneTimePreKeys(from_cbor(body)?),
            Opcode::GetPeerBundles => Self::GetPeerBundles(from_cbor(body)?),
            Opcode::GetSelfOneTimePreKeys => Self::GetSelfOneTimePreKeys,
            Opcode::Ack => Self::Ack,
            Opcode::PeerBundles => Self::PeerBundles(from_cbor(body)?),
            Opcode::SelfOneTimePreKeys => Self::SelfOneTimePreKeys(from_cbor(body)?),
            Opcode::Error => Self::Error(from_cbor(body)?),
        };

        Ok((curve, message))
    }
}

fn from_cbor<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
    ciborium::de::from_reader(body).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}

/// Convert a length-checked byte field into a fixed array.
pub fn fixed_bytes<const N: usize>(field: &'static str, bytes: &[u8]) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| ProtocolError::InvalidLength { field, expected: N, actual: bytes.len() })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_prekey() -> SignedPreKeyData {
        SignedPreKeyData { id: 1, public_key: vec![0x11; 32], signature: vec![0x22; 64] }
    }

    #[test]
    fn register_roundtrip() {
        let message = ServerMessage::RegisterUser(RegisterUser {
            identity_key: vec![0x33; 32],
            signed_prekey: signed_prekey(),
            one_time_prekeys: vec![OneTimePreKeyData { id: 5, public_key: vec![0x44; 32] }],
        });

        let bytes = message.encode(CurveId::C25519).unwrap();
        assert_eq!(bytes[1], Opcode::RegisterUser.to_u8());
        assert_eq!(ServerMessage::decode(&bytes).unwrap(), (CurveId::C25519, message));
    }

    #[test]
    fn empty_bodies_encode_to_header_only() {
        for message in [ServerMessage::DeleteUser, ServerMessage::GetSelfOneTimePreKeys, ServerMessage::Ack] {
            let bytes = message.encode(CurveId::C25519).unwrap();
            assert_eq!(bytes.len(), ServerHeader::SIZE);
            assert_eq!(ServerMessage::decode(&bytes).unwrap().1, message);
        }
    }

    #[test]
    fn bundles_roundtrip_preserves_missing_devices() {
        let message = ServerMessage::PeerBundles(PeerBundles {
            bundles: vec![PeerBundle {
                device_id: "bob.d1".to_string(),
                identity_key: vec![0x55; 32],
                signed_prekey: signed_prekey(),
                one_time_prekey: None,
            }],
            missing: vec!["carol.d1".to_string()],
        });

        let bytes = message.encode(CurveId::C25519).unwrap();
        assert_eq!(ServerMessage::decode(&bytes).unwrap().1, message);
    }

    #[test]
    fn body_mismatching_opcode_is_rejected() {
        let mut bytes = ServerMessage::GetPeerBundles(PeerBundlesRequest { device_ids: vec!["a".into()] })
            .encode(CurveId::C25519)
            .unwrap();
        bytes[1] = Opcode::RegisterUser.to_u8();

        assert!(matches!(ServerMessage::decode(&bytes), Err(ProtocolError::CborDecode(_))));
    }

    #[test]
    fn header_errors() {
        assert!(matches!(ServerMessage::decode(&[0x01, 0x01]), Err(ProtocolError::FrameTooShort { .. })));
        assert_eq!(ServerMessage::decode(&[0x02, 0x80, 0x01, 0x00]), Err(ProtocolError::UnsupportedVersion(0x02)));
        assert_eq!(ServerMessage::decode(&[0x01, 0x42, 0x01, 0x00]), Err(ProtocolError::UnknownOpcode(0x42)));
        assert_eq!(ServerMessage::decode(&[0x01, 0x80, 0x09, 0x00]), Err(ProtocolError::UnknownCurve(0x09)));
    }

    #[test]
    fn oversized_body_is_rejected_before_parsing() {
        let mut bytes = vec![0x01, Opcode::PostOneTimePreKeys.to_u8(), 0x01, 0x00];
        bytes.resize(ServerHeader::SIZE + MAX_BODY_SIZE + 1, 0);
        assert!(matches!(ServerMessage::decode(&bytes), Err(ProtocolError::PayloadTooLarge { .. })));
    }

    #[test]
    fn fixed_bytes_checks_length() {
        assert_eq!(fixed_bytes::<4>("id", &[1, 2, 3, 4]), Ok([1, 2, 3, 4]));
        assert_eq!(
            fixed_bytes::<32>("identity_key", &[0; 31]),
            Err(ProtocolError::InvalidLength { field: "identity_key", expected: 32, actual: 31 })
        );
    }
}
