//! The identity store: long-term key pair and derived network address.
//!
//! An identity is an Ed25519 key pair plus the hidden-service address
//! derived from its public key. The address is self-certifying: it commits
//! to the public key, so proving ownership of the key proves ownership of
//! the address. The signing key never leaves this module; handshake
//! signatures are produced through [`Identity::sign`].
//!
//! At rest an identity is an opaque encrypted blob (Argon2id-stretched
//! password, XChaCha20-Poly1305). The core does not touch the filesystem;
//! where the blob lives is the caller's concern.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sha3::Sha3_256;
use zeroize::Zeroize;

use crate::crypto::aead::{open_with_password, seal_with_password};
use crate::crypto::kdf::StretchParams;
use crate::error::CoreError;

/// Length of an address body (v3 onion) without the `.onion` suffix.
const ADDRESS_BODY_LEN: usize = 56;

/// Address version byte.
const ADDRESS_VERSION: u8 = 0x03;

/// Inner record of an encrypted identity blob.
#[derive(Serialize, Deserialize)]
struct IdentityRecord {
    secret_key: [u8; 32],
    created_at: i64,
}

impl Drop for IdentityRecord {
    fn drop(&mut self) {
        self.secret_key.zeroize();
    }
}

/// The local long-term identity.
pub struct Identity {
    signing: SigningKey,
    address: String,
    created_at: i64,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .field("created_at", &self.created_at)
            .field("signing", &"[REDACTED]")
            .finish()
    }
}

impl Identity {
    /// Generate a fresh identity.
    ///
    /// Fails only on entropy-source failure, which is fatal.
    pub fn create() -> Result<Self, CoreError> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|_| CoreError::EntropyFailure)?;

        let signing = SigningKey::from_bytes(&seed);
        seed.zeroize();

        let address = derive_address(&signing.verifying_key());
        Ok(Self {
            signing,
            address,
            created_at: chrono::Utc::now().timestamp(),
        })
    }

    /// Decrypt an identity from its encrypted-at-rest blob.
    pub fn load(blob: &[u8], password: &str) -> Result<Self, CoreError> {
        let mut plaintext = open_with_password(blob, password, &StretchParams::default())?;
        let decoded: Result<IdentityRecord, _> = bincode::deserialize(&plaintext);
        plaintext.zeroize();

        let record = decoded.map_err(|_| CoreError::CorruptStorage)?;
        let signing = SigningKey::from_bytes(&record.secret_key);
        let address = derive_address(&signing.verifying_key());

        Ok(Self {
            signing,
            address,
            created_at: record.created_at,
        })
    }

    /// Alias for [`Identity::load`], for symmetry with [`Identity::export`].
    pub fn import(blob: &[u8], password: &str) -> Result<Self, CoreError> {
        Self::load(blob, password)
    }

    /// Encrypt this identity into an opaque blob under a password.
    pub fn export(&self, password: &str) -> Result<Vec<u8>, CoreError> {
        let record = IdentityRecord {
            secret_key: self.signing.to_bytes(),
            created_at: self.created_at,
        };
        let mut plaintext = bincode::serialize(&record)
            .map_err(|e| CoreError::SerializationFailed(e.to_string()))?;

        let blob = seal_with_password(&plaintext, password, &StretchParams::default());
        plaintext.zeroize();
        blob
    }

    /// The self-certifying network address derived from the public key.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Creation time, Unix seconds.
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// The long-term public key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// The long-term public key, base64 encoded for wire transport.
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.signing.verifying_key().as_bytes())
    }

    /// Sign a message with the long-term key. The key itself stays inside
    /// the store.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// Short formatted fingerprint of the public key, for out-of-band
    /// verification between users.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.signing.verifying_key())
    }
}

/// Derive the hidden-service address for a public key.
///
/// `base32(pubkey || checksum || version) + ".onion"`, where `checksum` is
/// the first two bytes of `SHA3-256(".onion checksum" || pubkey || version)`.
pub fn derive_address(key: &VerifyingKey) -> String {
    let pubkey = key.as_bytes();

    let mut hasher = Sha3_256::new();
    hasher.update(b".onion checksum");
    hasher.update(pubkey);
    hasher.update([ADDRESS_VERSION]);
    let checksum = hasher.finalize();

    let mut combined = [0u8; 35];
    combined[..32].copy_from_slice(pubkey);
    combined[32..34].copy_from_slice(&checksum[..2]);
    combined[34] = ADDRESS_VERSION;

    format!("{}.onion", base32_encode(&combined).to_lowercase())
}

/// Compute the formatted fingerprint of a public key:
/// the first eight bytes of its SHA-256 hash as `XXXX-XXXX-XXXX-XXXX`.
pub fn fingerprint(key: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let hash = hasher.finalize();

    let hex = hex::encode(&hash[..8]).to_uppercase();
    format!("{}-{}-{}-{}", &hex[0..4], &hex[4..8], &hex[8..12], &hex[12..16])
}

/// Validate and normalize a network address.
///
/// Accepts the 56-character base32 body with or without the `.onion`
/// suffix; returns the lowercase form with the suffix.
pub fn normalize_address(address: &str) -> Result<String, CoreError> {
    let body = address.trim().trim_end_matches(".onion").to_lowercase();

    if body.len() != ADDRESS_BODY_LEN {
        return Err(CoreError::InvalidAddress(format!(
            "address body must be {} characters, got {}",
            ADDRESS_BODY_LEN,
            body.len()
        )));
    }
    for c in body.chars() {
        if !c.is_ascii_lowercase() && !('2'..='7').contains(&c) {
            return Err(CoreError::InvalidAddress(format!(
                "invalid character '{}'",
                c
            )));
        }
    }

    Ok(format!("{}.onion", body))
}

/// RFC 4648 base32, no padding.
fn base32_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let mut out = String::with_capacity(data.len() * 8 / 5 + 1);
    let mut acc: u64 = 0;
    let mut acc_bits = 0;

    for &byte in data {
        acc = (acc << 8) | u64::from(byte);
        acc_bits += 8;
        while acc_bits >= 5 {
            acc_bits -= 5;
            out.push(ALPHABET[((acc >> acc_bits) & 0x1f) as usize] as char);
        }
    }
    if acc_bits > 0 {
        out.push(ALPHABET[((acc << (5 - acc_bits)) & 0x1f) as usize] as char);
    }

    out
}
