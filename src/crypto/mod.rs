//! Cryptographic primitives for the messaging core.
//!
//! This module owns every secret-touching operation:
//!
//! - **X25519** ephemeral key pairs and Diffie-Hellman ([`keys`])
//! - **HKDF-SHA256** directional session-key derivation and **Argon2id**
//!   password stretching ([`kdf`])
//! - **XChaCha20-Poly1305** authenticated encryption with deterministic
//!   counter-derived nonces ([`aead`])
//!
//! Secret-holding buffers are wiped on scope exit. That is a contract of
//! this module, not an optimization.

pub mod aead;
pub mod kdf;
pub mod keys;

pub use aead::{message_nonce, open, open_with_password, seal, seal_with_password};
pub use kdf::{derive_session_keys, stretch_password, SessionKeyMaterial, StretchParams};
pub use keys::EphemeralKeyPair;
