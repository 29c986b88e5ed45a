//! Core error types.

use thiserror::Error;

/// Errors produced by the messaging core.
///
/// Every cryptographic or protocol failure is reported as a typed variant;
/// nothing in this crate turns a local failure into a panic across the API
/// boundary.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The operating system entropy source failed. Fatal and non-retryable.
    #[error("entropy source failure")]
    EntropyFailure,

    /// A stored blob could not be parsed. Treat the blob as absent.
    #[error("stored blob is corrupt")]
    CorruptStorage,

    /// Password-based decryption failed. The caller may re-prompt.
    #[error("wrong password")]
    WrongPassword,

    /// The handshake did not complete within the configured window.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// A handshake payload was structurally or cryptographically invalid.
    #[error("malformed handshake: {0}")]
    HandshakeMalformed(String),

    /// The Diffie-Hellman exchange produced a degenerate shared secret.
    #[error("key exchange failed")]
    KeyExchangeFailed,

    /// Symmetric key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Sealing a frame failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// A sealed frame failed authentication. The frame is dropped; the
    /// session is kept unless the consecutive-failure threshold is hit.
    #[error("message authentication failed")]
    AuthFailure,

    /// The frame's sequence number is stale or was already accepted.
    #[error("replayed or stale sequence {sequence}")]
    ReplayRejected {
        /// The rejected sequence number.
        sequence: u64,
    },

    /// A frame arrived that no live session can process.
    #[error("no session for peer {0}")]
    SessionUnknown(String),

    /// The peer has no live connection.
    #[error("not connected to {0}")]
    NotConnected(String),

    /// A network address failed validation.
    #[error("invalid network address: {0}")]
    InvalidAddress(String),

    /// An incoming frame exceeds the transport frame cap.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Declared frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Transport-level failure. Triggers the reconnect policy.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Wire encoding or decoding failed.
    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
