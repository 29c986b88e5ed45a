//! Consumer-facing events and commands.
//!
//! The core talks to its consumer (a UI or state layer) through two plain
//! channels: commands in, events out. The core never depends on how the
//! consumer reacts.

use serde::{Deserialize, Serialize};

use crate::protocol::handshake::HandshakeFailReason;
use crate::protocol::message::{FileMetadata, MessageType};

/// Unique identifier of a sent message.
pub type MessageId = String;

/// Envelope metadata of a delivered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMeta {
    /// Message identifier assigned by the sender.
    pub id: MessageId,
    /// Frame type.
    pub kind: MessageType,
    /// Sender-side Unix timestamp.
    pub timestamp: i64,
    /// Session sequence number.
    pub sequence: u64,
}

/// State transitions and deliveries reported to the consumer.
#[derive(Debug, Clone)]
pub enum Event {
    /// A session with the peer is established and ready for traffic.
    HandshakeCompleted {
        /// Peer address.
        address: String,
    },

    /// A handshake attempt was abandoned.
    HandshakeFailed {
        /// Peer address.
        address: String,
        /// Why the attempt failed.
        reason: HandshakeFailReason,
    },

    /// A sealed message from the peer was authenticated and opened.
    MessageReceived {
        /// Peer address.
        address: String,
        /// Decrypted payload. For [`MessageType::File`] frames this is
        /// the JSON-encoded [`FileMetadata`].
        plaintext: Vec<u8>,
        /// Envelope metadata.
        meta: MessageMeta,
    },

    /// The transport to the peer dropped; a reconnect may follow.
    ConnectionLost {
        /// Peer address.
        address: String,
    },

    /// Reconnect attempts are exhausted; the connection is abandoned.
    ConnectionFailed {
        /// Peer address.
        address: String,
    },
}

/// Commands the consumer may issue.
#[derive(Debug, Clone)]
pub enum Command {
    /// Open (or keep) a connection to the peer.
    Connect {
        /// Peer address.
        address: String,
    },

    /// Tear down the connection to the peer, wiping its session keys.
    Disconnect {
        /// Peer address.
        address: String,
    },

    /// Send a text message.
    SendText {
        /// Peer address.
        address: String,
        /// Message body.
        text: String,
    },

    /// Send a file offer.
    SendFileMetadata {
        /// Peer address.
        address: String,
        /// File description.
        metadata: FileMetadata,
    },
}
