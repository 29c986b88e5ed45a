//! # Sotto
//!
//! Anonymous peer-to-peer encrypted messaging core.
//!
//! Two parties, each identified by a self-certifying hidden-service
//! address derived from a long-term public key, run an ephemeral key
//! exchange over an anonymizing transport, derive per-session directional
//! keys, and exchange authenticated-encrypted frames. Nothing is ever
//! persisted server-side; sessions live only in memory.
//!
//! ## Security Model
//!
//! - **Forward secrecy**: session keys come from ephemeral X25519 keys
//!   discarded at derivation; long-term keys only authenticate.
//! - **Self-certifying addresses**: a peer's address is a commitment to
//!   its long-term public key, re-derived and checked on every handshake.
//! - **Directional keys**: send and receive keys are distinct HKDF
//!   outputs, so the two directions can never collide.
//! - **Replay protection**: a sliding window rejects stale and duplicated
//!   sequence numbers; failed authentication never advances it.
//! - **Keys wiped on drop**: identity, handshake, and session key
//!   material is zeroized when its owner goes away.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `crypto` | Key pairs, DH, HKDF/Argon2id derivation, XChaCha20-Poly1305 |
//! | `identity` | Long-term key pair, address derivation, encrypted export |
//! | `contact` | Peer records owned by the consumer |
//! | `protocol` | Fixed wire schema and the handshake state machine |
//! | `session` | Per-peer seal/open with sequence and replay bookkeeping |
//! | `replay` | Sliding replay window |
//! | `transport` | Framed streams: SOCKS5 dialing, TCP, the trait seams |
//! | `manager` | Per-peer tasks, reconnect with backoff, events/commands |
//!
//! The consumer (a UI or state layer) issues [`Command`]s and reads
//! [`Event`]s; the core never depends on what sits above it.

pub mod config;
pub mod contact;
pub mod crypto;
pub mod error;
pub mod events;
pub mod identity;
pub mod manager;
pub mod protocol;
pub mod replay;
pub mod session;
pub mod transport;

pub use config::CoreConfig;
pub use contact::Contact;
pub use error::CoreError;
pub use events::{Command, Event, MessageId, MessageMeta};
pub use identity::Identity;
pub use manager::ConnectionManager;
pub use protocol::{
    FileMetadata, Handshake, HandshakeFailReason, HandshakeStage, MessageType, WireMessage,
    PROTOCOL_VERSION,
};
pub use session::{Role, Session};
