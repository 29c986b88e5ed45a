//! Key derivation: session keys from the handshake, stretched keys from
//! passwords.
//!
//! Session keys are derived with HKDF-SHA256 under direction-separated
//! labels, so the initiator's send key is the responder's receive key and
//! vice versa, and the two directions can never collide. Password
//! stretching uses Argon2id, for the encrypted identity export only.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CoreError;

/// Domain separation labels for HKDF derivations.
const LABEL_INITIATOR_TO_RESPONDER: &[u8] = b"SOTTO-V1-KEY-I2R";
const LABEL_RESPONDER_TO_INITIATOR: &[u8] = b"SOTTO-V1-KEY-R2I";
const LABEL_SESSION_ID: &[u8] = b"SOTTO-V1-SESSION-ID";

/// Directional key material derived from a completed handshake.
///
/// Both parties derive identical material; which key is "send" and which
/// is "receive" depends on the party's role. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeyMaterial {
    /// Key sealing frames that flow initiator → responder.
    pub initiator_to_responder: [u8; 32],
    /// Key sealing frames that flow responder → initiator.
    pub responder_to_initiator: [u8; 32],
    /// Session identifier, identical on both ends. Feeds nonce derivation;
    /// not secret-critical but wiped with the rest.
    pub session_id: [u8; 16],
}

/// Derive directional session keys and the session id from the ephemeral
/// DH shared secret.
///
/// The ephemeral public keys are mixed in as salt in a fixed order
/// (initiator first) so both parties derive the same material regardless
/// of who initiated.
pub fn derive_session_keys(
    shared_secret: &[u8; 32],
    initiator_public: &[u8; 32],
    responder_public: &[u8; 32],
) -> SessionKeyMaterial {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(initiator_public);
    salt[32..].copy_from_slice(responder_public);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared_secret);

    let mut initiator_to_responder = [0u8; 32];
    let mut responder_to_initiator = [0u8; 32];
    let mut session_id = [0u8; 16];

    hk.expand(LABEL_INITIATOR_TO_RESPONDER, &mut initiator_to_responder)
        .expect("32 bytes is valid output length");
    hk.expand(LABEL_RESPONDER_TO_INITIATOR, &mut responder_to_initiator)
        .expect("32 bytes is valid output length");
    hk.expand(LABEL_SESSION_ID, &mut session_id)
        .expect("16 bytes is valid output length");

    SessionKeyMaterial {
        initiator_to_responder,
        responder_to_initiator,
        session_id,
    }
}

/// Argon2id cost parameters for password stretching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StretchParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl Default for StretchParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 1,
        }
    }
}

/// Stretch a password into a 32-byte key with Argon2id.
///
/// Used to encrypt exported identity backups; the salt must be stored
/// alongside the ciphertext.
pub fn stretch_password(
    password: &str,
    salt: &[u8],
    params: &StretchParams,
) -> Result<[u8; 32], CoreError> {
    let argon_params = argon2::Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(32),
    )
    .map_err(|_| CoreError::KeyDerivationFailed)?;

    let argon = argon2::Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon_params,
    );

    let mut key = [0u8; 32];
    argon
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|_| CoreError::KeyDerivationFailed)?;

    Ok(key)
}
