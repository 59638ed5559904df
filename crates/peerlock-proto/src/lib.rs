//! Peerlock wire formats.
//!
//! Two families of messages:
//!
//! - Ratchet messages, exchanged device to device through whatever delivery
//!   service the application uses. Fixed binary header, optional X3DH init
//!   block, AEAD ciphertext.
//! - Key server messages, exchanged between a device and the key server.
//!   Fixed binary header, CBOR body.
//!
//! Headers are raw binary so they can be authenticated byte for byte; bodies
//! use CBOR for type safety and forward compatibility.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod curve;
pub mod errors;
pub mod key_server;
pub mod ratchet_message;

pub use curve::CurveId;
pub use errors::{ProtocolError, Result};
pub use key_server::{
    ErrorPayload, OneTimePreKeyData, Opcode, PeerBundle, PeerBundles, PeerBundlesRequest, RegisterUser,
    SelfOneTimePreKeys, ServerMessage, SignedPreKeyData,
};
pub use ratchet_message::{PayloadKind, RatchetHeader, RatchetMessage, X3dhInit};
