//! Protocol-level errors.

use thiserror::Error;

/// Errors raised while encoding, decoding, or validating wire traffic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A message could not be encoded.
    #[error("failed to encode message: {reason}")]
    Encode {
        /// Encoder diagnostics.
        reason: String,
    },

    /// Incoming bytes were not a valid message.
    #[error("failed to decode message: {reason}")]
    Decode {
        /// Decoder diagnostics.
        reason: String,
    },

    /// The two sides speak different protocol versions.
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch {
        /// Version spoken locally.
        local: u16,
        /// Version announced by the remote.
        remote: u16,
    },

    /// A reply did not match the request that was sent.
    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        /// The message kind the caller was waiting for.
        expected: &'static str,
        /// The message kind that arrived.
        got: &'static str,
    },

    /// A transfer unit failed its internal consistency checks.
    #[error("malformed transfer unit for {doc_id}: {reason}")]
    MalformedUnit {
        /// Document the unit belongs to.
        doc_id: String,
        /// Why the unit was rejected.
        reason: String,
    },
}

/// Result alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
