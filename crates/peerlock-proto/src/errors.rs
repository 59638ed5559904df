//! Error types for wire format parsing

use thiserror::Error;

/// Convenience alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding wire messages
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Buffer ends before a fixed-size structure does
    #[error("message too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Version byte is not one this build understands
    #[error("unsupported protocol version: {0:#04x}")]
    UnsupportedVersion(u8),

    /// Curve byte does not name a known curve
    #[error("unknown curve id: {0:#04x}")]
    UnknownCurve(u8),

    /// Opcode byte does not name a known message type
    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    /// Flag bits are set that this version does not define, or that contradict
    /// each other
    #[error("invalid flags: {0:#04x}")]
    InvalidFlags(u8),

    /// A field has the wrong length
    #[error("invalid field length for {field}: expected {expected}, got {actual}")]
    InvalidLength {
        /// Field name
        field: &'static str,
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Payload exceeds the protocol size limit
    #[error("payload too large: {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge {
        /// Payload size
        size: usize,
        /// Maximum allowed
        max: usize,
    },

    /// CBOR serialization failed
    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    /// CBOR deserialization failed
    #[error("CBOR decode error: {0}")]
    CborDecode(String),
}
