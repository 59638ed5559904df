//! Ratchet message wire format.
//!
//! A ratchet message is what one recipient device receives from one sender
//! device. Layout on the wire (all integers Big Endian):
//!
//! ```text
//! [RatchetHeader: 44 bytes]
//! [X3DH init: 72 bytes]      only when FLAG_X3DH_INIT is set
//! [ciphertext: variable]     AEAD output including 16-byte tag
//! ```
//!
//! Everything before the ciphertext is authenticated as associated data by the
//! sender, so flags, counters and the X3DH init cannot be altered in transit.

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    CurveId,
    errors::{ProtocolError, Result},
};

/// Fixed 44-byte ratchet header.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RatchetHeader {
    version: u8,
    flags: u8,
    curve: u8,
    reserved: u8,
    index: [u8; 4],                 // u32 message index in the sending chain
    previous_chain_length: [u8; 4], // u32 length of the sender's previous chain
    ratchet_key: [u8; 32],          // sender's current ratchet public key
}

impl RatchetHeader {
    /// Size of the serialized header
    pub const SIZE: usize = 44;

    /// Current wire version
    pub const VERSION: u8 = 0x01;

    /// An X3DH init block follows the header
    pub const FLAG_X3DH_INIT: u8 = 0x01;

    /// The ciphertext wraps a content key; the plaintext travels in the shared
    /// ciphertext
    pub const FLAG_CONTENT_KEY: u8 = 0x02;

    /// The X3DH init references a one-time prekey
    pub const FLAG_ONE_TIME_PREKEY: u8 = 0x04;

    const KNOWN_FLAGS: u8 = Self::FLAG_X3DH_INIT | Self::FLAG_CONTENT_KEY | Self::FLAG_ONE_TIME_PREKEY;
}

/// Fixed 72-byte X3DH init block.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct InitBlock {
    identity_key: [u8; 32],
    ephemeral_key: [u8; 32],
    signed_prekey_id: [u8; 4],
    one_time_prekey_id: [u8; 4], // zero and ignored unless FLAG_ONE_TIME_PREKEY
}

impl InitBlock {
    const SIZE: usize = 72;
}

/// What the ratchet-protected ciphertext carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// The plaintext itself
    Plaintext,
    /// A content key for the shared ciphertext
    ContentKey,
}

/// X3DH values carried until the recipient answers.
///
/// Serializable because the sender keeps it in its session record until the
/// first reply arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct X3dhInit {
    /// Sender identity public key
    pub identity_key: [u8; 32],
    /// Sender ephemeral public key
    pub ephemeral_key: [u8; 32],
    /// Recipient signed prekey used
    pub signed_prekey_id: u32,
    /// Recipient one-time prekey used
    pub one_time_prekey_id: Option<u32>,
}

/// Parsed ratchet message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetMessage {
    /// Sender's curve
    pub curve: CurveId,
    /// What the ciphertext carries
    pub payload: PayloadKind,
    /// Index in the sending chain
    pub index: u32,
    /// Length of the sender's previous sending chain
    pub previous_chain_length: u32,
    /// Sender's current ratchet public key
    pub ratchet_key: [u8; 32],
    /// Session bootstrap values, present until the session is acknowledged
    pub x3dh_init: Option<X3dhInit>,
    /// AEAD ciphertext
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    /// Upper bound on the encoded size of a message whose ciphertext is
    /// `ciphertext_len` bytes.
    #[must_use]
    pub const fn max_encoded_len(ciphertext_len: usize) -> usize {
        RatchetHeader::SIZE + InitBlock::SIZE + ciphertext_len
    }

    /// Serialize everything except the ciphertext.
    ///
    /// These are exactly the bytes the sender authenticates.
    #[must_use]
    pub fn encode_header(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.payload == PayloadKind::ContentKey {
            flags |= RatchetHeader::FLAG_CONTENT_KEY;
        }
        if let Some(init) = &self.x3dh_init {
            flags |= RatchetHeader::FLAG_X3DH_INIT;
            if init.one_time_prekey_id.is_some() {
                flags |= RatchetHeader::FLAG_ONE_TIME_PREKEY;
            }
        }

        let header = RatchetHeader {
            version: RatchetHeader::VERSION,
            flags,
            curve: self.curve.to_u8(),
            reserved: 0,
            index: self.index.to_be_bytes(),
            previous_chain_length: self.previous_chain_length.to_be_bytes(),
            ratchet_key: self.ratchet_key,
        };

        let mut out = Vec::with_capacity(RatchetHeader::SIZE + InitBlock::SIZE);
        out.extend_from_slice(header.as_bytes());

        if let Some(init) = &self.x3dh_init {
            let block = InitBlock {
                identity_key: init.identity_key,
                ephemeral_key: init.ephemeral_key,
                signed_prekey_id: init.signed_prekey_id.to_be_bytes(),
                one_time_prekey_id: init.one_time_prekey_id.unwrap_or(0).to_be_bytes(),
            };
            out.extend_from_slice(block.as_bytes());
        }

        out
    }

    /// Serialize the full message.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.encode_header();
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse a message and return it together with the length of its
    /// authenticated prefix.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FrameTooShort` if the buffer ends inside the header
    ///   or init block
    /// - `ProtocolError::UnsupportedVersion` for an unknown version byte
    /// - `ProtocolError::InvalidFlags` for undefined or contradictory flags
    /// - `ProtocolError::UnknownCurve` for an unknown curve byte
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let (header, rest) = RatchetHeader::ref_from_prefix(bytes).map_err(|_| {
            ProtocolError::FrameTooShort { expected: RatchetHeader::SIZE, actual: bytes.len() }
        })?;

        if header.version != RatchetHeader::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }

        let flags = header.flags;
        if flags & !RatchetHeader::KNOWN_FLAGS != 0 {
            return Err(ProtocolError::InvalidFlags(flags));
        }
        let has_init = flags & RatchetHeader::FLAG_X3DH_INIT != 0;
        let has_opk = flags & RatchetHeader::FLAG_ONE_TIME_PREKEY != 0;
        if has_opk && !has_init {
            return Err(ProtocolError::InvalidFlags(flags));
        }

        let curve = CurveId::from_u8(header.curve)?;

        let (x3dh_init, ciphertext) = if has_init {
            let (block, ciphertext) = InitBlock::ref_from_prefix(rest).map_err(|_| {
                ProtocolError::FrameTooShort {
                    expected: RatchetHeader::SIZE + InitBlock::SIZE,
                    actual: bytes.len(),
                }
            })?;
            let init = X3dhInit {
                identity_key: block.identity_key,
                ephemeral_key: block.ephemeral_key,
                signed_prekey_id: u32::from_be_bytes(block.signed_prekey_id),
                one_time_prekey_id: has_opk.then(|| u32::from_be_bytes(block.one_time_prekey_id)),
            };
            (Some(init), ciphertext)
        } else {
            (None, rest)
        };

        let header_len = bytes.len() - ciphertext.len();
        let payload = if flags & RatchetHeader::FLAG_CONTENT_KEY != 0 {
            PayloadKind::ContentKey
        } else {
            PayloadKind::Plaintext
        };

        let message = Self {
            curve,
            payload,
            index: u32::from_be_bytes(header.index),
            previous_chain_length: u32::from_be_bytes(header.previous_chain_length),
            ratchet_key: header.ratchet_key,
            x3dh_init,
            ciphertext: ciphertext.to_vec(),
        };

        Ok((message, header_len))
    }
}
