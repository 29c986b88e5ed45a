//! Ephemeral X25519 key pairs and Diffie-Hellman.
//!
//! An ephemeral key pair lives for exactly one handshake attempt. The
//! secret half is consumed by [`EphemeralKeyPair::diffie_hellman`] and
//! never survives session-key derivation, which is what gives sessions
//! forward secrecy: the long-term identity key only authenticates, it
//! never encrypts.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroize;

use crate::error::CoreError;

/// An X25519 key pair generated for a single handshake attempt.
pub struct EphemeralKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose the secret half in debug output.
        f.debug_struct("EphemeralKeyPair")
            .field("public", &BASE64.encode(self.public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl EphemeralKeyPair {
    /// Generate a fresh key pair.
    ///
    /// Fails only if the operating system entropy source fails, which is
    /// fatal and non-retryable.
    pub fn generate() -> Result<Self, CoreError> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|_| CoreError::EntropyFailure)?;

        let secret = StaticSecret::from(seed);
        seed.zeroize();
        let public = PublicKey::from(&secret);

        Ok(Self { secret, public })
    }

    /// The public half, safe to transmit.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Compute the shared secret with a peer's ephemeral public key,
    /// consuming the secret half.
    ///
    /// Rejects non-contributory results (an all-zero shared secret from a
    /// low-order peer key) with [`CoreError::KeyExchangeFailed`].
    pub fn diffie_hellman(self, peer_public: &PublicKey) -> Result<SharedSecret, CoreError> {
        let shared = self.secret.diffie_hellman(peer_public);
        if !shared.was_contributory() {
            return Err(CoreError::KeyExchangeFailed);
        }
        Ok(shared)
    }
}
