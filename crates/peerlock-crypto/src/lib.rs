//! Peerlock Cryptographic Primitives
//!
//! Cryptographic building blocks for the Peerlock engine. Pure functions with
//! deterministic outputs. Callers provide random bytes for deterministic
//! testing.
//!
//! # Key Lifecycle
//!
//! A session between two devices starts from an X3DH agreement against the
//! peer's published bundle. The resulting secret seeds the Double Ratchet
//! root chain; every DH ratchet step mixes a fresh agreement into the root
//! and starts a new symmetric chain, which in turn yields one key per message.
//!
//! ```text
//! Identity key + Signed prekey + One-time prekey
//!        │
//!        ▼
//! X3DH → Shared secret (per session)
//!        │
//!        ▼
//! Root chain ──DH ratchet──▶ Sending / receiving chain keys
//!        │
//!        ▼
//! Chain ratchet → Message keys
//!        │
//!        ▼
//! HKDF → AEAD key + nonce → Ciphertext
//! ```
//!
//! Message keys are used for exactly one encryption operation. Keys skipped
//! by out-of-order delivery are cached in a bounded window and removed on use.
//!
//! # Security
//!
//! Forward Secrecy:
//! - Chain advancement: old chain keys are zeroized after deriving the next key
//! - Message key disposal: keys are zeroized on drop
//! - One-time prekeys: each bundle hands out a one-time prekey at most once
//!
//! Post-Compromise Security:
//! - Every reply triggers a DH ratchet step with a fresh key pair
//!
//! Authenticity:
//! - Signed prekeys are verified against the bundle's identity key
//! - `XChaCha20-Poly1305` authenticates ciphertext, header and session
//!   associated data (both identities and device ids)

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
pub mod chain;
pub mod double_ratchet;
mod error;
pub mod kdf;
pub mod keys;
pub mod x3dh;

pub use chain::{ChainKey, MessageKey};
pub use double_ratchet::{RatchetLimits, RatchetState, SendStep};
pub use error::CryptoError;
pub use keys::{DhKeyPair, IdentityKeyPair, IdentityPublicKey, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
pub use x3dh::{InitialKeys, PreKeyBundle, SharedSecret};
