//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering codec and framing failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize an event.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize an event.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame has invalid magic bytes.
    #[error("invalid frame magic: expected {expected:#010x}, got {got:#010x}")]
    InvalidFrameMagic {
        /// Expected magic value.
        expected: u32,
        /// Actual magic value read.
        got: u32,
    },

    /// A compressed frame payload could not be inflated.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// The envelope carries a protocol version this build does not speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<lz4_flex::block::DecompressError> for ProtocolError {
    fn from(err: lz4_flex::block::DecompressError) -> Self {
        ProtocolError::Decompression(err.to_string())
    }
}
