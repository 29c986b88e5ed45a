//! Wire message types.
//!
//! Every frame on the wire is one [`WireMessage`] with a fixed schema:
//! `{ id, type, sender, content, timestamp, sequence }`. For sealed frame
//! types `content` carries base64 ciphertext; for the `handshake` type it
//! carries the key-exchange payload in the clear. Unknown fields are
//! ignored on parse; missing required fields reject the frame.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey;

use crate::error::CoreError;

/// Protocol version carried in signed handshake payloads.
pub const PROTOCOL_VERSION: u16 = 1;

/// The frame types a peer can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// A sealed text message.
    Text,
    /// Sealed file metadata (name, size, MIME type).
    File,
    /// A key-exchange payload, in the clear.
    Handshake,
    /// A sealed keep-alive. Shares the sequence space of real traffic.
    Keepalive,
    /// A sealed disconnect notification.
    Disconnect,
}

impl MessageType {
    /// Stable one-byte code, bound into each sealed frame's associated data.
    pub(crate) fn wire_code(self) -> u8 {
        match self {
            MessageType::Text => 1,
            MessageType::File => 2,
            MessageType::Handshake => 3,
            MessageType::Keepalive => 4,
            MessageType::Disconnect => 5,
        }
    }
}

/// Metadata describing a file offer, sealed as the content of a
/// [`MessageType::File`] frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File name.
    pub name: String,
    /// File size in bytes.
    pub size: u64,
    /// MIME type.
    pub mime_type: String,
}

/// A single frame as carried on the wire, JSON encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Unique message identifier.
    pub id: String,
    /// Frame type.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Sender's network address.
    pub sender: String,
    /// Base64 ciphertext, or the handshake payload JSON for
    /// [`MessageType::Handshake`].
    pub content: String,
    /// Unix timestamp set by the sender.
    pub timestamp: i64,
    /// Session sequence number. Zero for handshake frames, which live
    /// outside any session's sequence space.
    pub sequence: u64,
}

impl WireMessage {
    /// Build a sealed frame around already-encrypted content.
    pub fn sealed(
        id: String,
        kind: MessageType,
        sender: String,
        content: String,
        sequence: u64,
    ) -> Self {
        Self {
            id,
            kind,
            sender,
            content,
            timestamp: chrono::Utc::now().timestamp(),
            sequence,
        }
    }

    /// Build a clear handshake frame carrying a key-exchange payload.
    pub fn handshake(sender: &str, payload: &HandshakePayload) -> Result<Self, CoreError> {
        let content = serde_json::to_string(payload)
            .map_err(|e| CoreError::SerializationFailed(e.to_string()))?;
        Ok(Self {
            id: generate_message_id(),
            kind: MessageType::Handshake,
            sender: sender.to_string(),
            content,
            timestamp: chrono::Utc::now().timestamp(),
            sequence: 0,
        })
    }

    /// Encode for transport.
    pub fn to_json(&self) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(self).map_err(|e| CoreError::SerializationFailed(e.to_string()))
    }

    /// Parse a received frame. Unknown fields are ignored; missing
    /// required fields reject the frame.
    pub fn from_json(bytes: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::SerializationFailed(e.to_string()))
    }

    /// Extract the handshake payload from a handshake frame.
    pub fn handshake_payload(&self) -> Result<HandshakePayload, CoreError> {
        if self.kind != MessageType::Handshake {
            return Err(CoreError::HandshakeMalformed(format!(
                "expected handshake frame, got {:?}",
                self.kind
            )));
        }
        serde_json::from_str(&self.content)
            .map_err(|e| CoreError::HandshakeMalformed(e.to_string()))
    }
}

/// The key-exchange payload carried in a handshake frame.
///
/// The long-term identity key authenticates the ephemeral key: the
/// signature covers `version || identity_key || ephemeral_key`, and the
/// receiver re-derives the sender's network address from `identity_key`,
/// which the address itself commits to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakePayload {
    /// Protocol version.
    pub version: u16,
    /// Long-term Ed25519 public key, base64.
    pub identity_key: String,
    /// Ephemeral X25519 public key for this attempt, base64.
    pub ephemeral_key: String,
    /// Ed25519 signature over the signed data, base64.
    pub signature: String,
}

impl HandshakePayload {
    /// The byte string the signature covers.
    pub fn signed_data(
        version: u16,
        identity_public: &[u8; 32],
        ephemeral_public: &[u8; 32],
    ) -> Vec<u8> {
        let mut data = Vec::with_capacity(2 + 32 + 32);
        data.extend_from_slice(&version.to_be_bytes());
        data.extend_from_slice(identity_public);
        data.extend_from_slice(ephemeral_public);
        data
    }

    /// Decode the long-term identity key.
    pub fn identity_verifying_key(&self) -> Result<VerifyingKey, CoreError> {
        let bytes = decode_key32(&self.identity_key)?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|_| CoreError::HandshakeMalformed("invalid identity key".into()))
    }

    /// Decode the ephemeral public key.
    pub fn ephemeral_public_key(&self) -> Result<PublicKey, CoreError> {
        Ok(PublicKey::from(decode_key32(&self.ephemeral_key)?))
    }

    /// Decode the signature.
    pub fn decoded_signature(&self) -> Result<Signature, CoreError> {
        let bytes = BASE64
            .decode(&self.signature)
            .map_err(|_| CoreError::HandshakeMalformed("signature is not base64".into()))?;
        Signature::from_slice(&bytes)
            .map_err(|_| CoreError::HandshakeMalformed("invalid signature length".into()))
    }
}

fn decode_key32(encoded: &str) -> Result<[u8; 32], CoreError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|_| CoreError::HandshakeMalformed("key is not base64".into()))?;
    bytes
        .try_into()
        .map_err(|_| CoreError::HandshakeMalformed("key must be 32 bytes".into()))
}

/// Generate a unique message id: 16 random bytes, hex encoded.
pub fn generate_message_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
