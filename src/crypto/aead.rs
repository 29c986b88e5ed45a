//! Authenticated encryption with XChaCha20-Poly1305.
//!
//! The extended 192-bit nonce space lets message nonces be derived
//! deterministically from (session id, direction, sequence) with no
//! birthday-bound collision risk, so no nonce ever travels on the wire
//! for sealed session frames.
//!
//! The password-based helpers implement the encrypted-blob layout used by
//! the identity store: `salt(16) || nonce(24) || ciphertext`.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::crypto::kdf::{stretch_password, StretchParams};
use crate::error::CoreError;

/// Symmetric key length in bytes.
pub const KEY_LEN: usize = 32;

/// Extended nonce length in bytes.
pub const NONCE_LEN: usize = 24;

/// Salt length for password-based blobs.
pub const SALT_LEN: usize = 16;

/// Poly1305 tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Derive the deterministic nonce for a sealed session frame.
///
/// Layout: `session_id[..15] || direction || sequence_be`. The two
/// directions occupy disjoint nonce spaces on top of having distinct keys.
pub fn message_nonce(session_id: &[u8; 16], direction: u8, sequence: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..15].copy_from_slice(&session_id[..15]);
    nonce[15] = direction;
    nonce[16..].copy_from_slice(&sequence.to_be_bytes());
    nonce
}

/// Seal a plaintext under the given key, nonce, and associated data.
pub fn seal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CoreError> {
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| CoreError::EncryptionFailed)?;

    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CoreError::EncryptionFailed)
}

/// Open a sealed payload. Any mismatch in key, nonce, associated data, or
/// ciphertext yields [`CoreError::AuthFailure`].
pub fn open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CoreError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CoreError::AuthFailure)?;

    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CoreError::AuthFailure)
}

/// Encrypt a blob under a password-stretched key.
///
/// Output layout: `salt(16) || nonce(24) || ciphertext`. The stretched key
/// is wiped before returning.
pub fn seal_with_password(
    plaintext: &[u8],
    password: &str,
    params: &StretchParams,
) -> Result<Vec<u8>, CoreError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|_| CoreError::EntropyFailure)?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|_| CoreError::EntropyFailure)?;

    let mut key = stretch_password(password, &salt, params)?;
    let sealed = seal(&key, &nonce, &[], plaintext);
    key.zeroize();
    let ciphertext = sealed?;

    let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt a blob produced by [`seal_with_password`].
///
/// A blob too short to contain salt, nonce, and tag is
/// [`CoreError::CorruptStorage`]; an authentication failure is reported
/// as [`CoreError::WrongPassword`].
pub fn open_with_password(
    blob: &[u8],
    password: &str,
    params: &StretchParams,
) -> Result<Vec<u8>, CoreError> {
    if blob.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
        return Err(CoreError::CorruptStorage);
    }

    let salt = &blob[..SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&blob[SALT_LEN..SALT_LEN + NONCE_LEN]);
    let ciphertext = &blob[SALT_LEN + NONCE_LEN..];

    let mut key = stretch_password(password, salt, params)?;
    let opened = open(&key, &nonce, &[], ciphertext);
    key.zeroize();

    opened.map_err(|_| CoreError::WrongPassword)
}
