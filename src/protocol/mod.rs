//! Wire protocol: the fixed frame schema and the handshake state machine.

pub mod handshake;
pub mod message;

pub use handshake::{Handshake, HandshakeFailReason, HandshakeStage};
pub use message::{
    generate_message_id, FileMetadata, HandshakePayload, MessageType, WireMessage,
    PROTOCOL_VERSION,
};
