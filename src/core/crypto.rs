//! Envelope verification and sealing for token-registration blobs.
//!
//! Message payloads stay opaque to the broker; the only ciphertext it ever
//! opens is the `register_fcm_token` envelope, which clients seal with the
//! session's `secretKey`. Layout: base64 over `[12-byte nonce][ciphertext]`,
//! AES-256-GCM keyed by the hex-decoded secret.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::{engine::general_purpose, Engine as _};
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope hash mismatch")]
    HashMismatch,

    #[error("invalid base64 envelope")]
    Base64,

    #[error("invalid session secret")]
    BadKey,

    #[error("envelope too short")]
    TooShort,

    #[error("decryption failed")]
    Decrypt,
}

/// Hex-encoded SHA-256 digest of the input.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verifies that `hash` is the hex SHA-256 of the base64 `encrypted_data`
/// string, then opens the envelope with the session secret.
pub fn open_envelope(
    secret_key_hex: &str,
    encrypted_data: &str,
    hash: &str,
) -> Result<Vec<u8>, EnvelopeError> {
    if sha256_hex(encrypted_data.as_bytes()) != hash {
        return Err(EnvelopeError::HashMismatch);
    }

    let raw = general_purpose::STANDARD
        .decode(encrypted_data)
        .map_err(|_| EnvelopeError::Base64)?;
    if raw.len() <= NONCE_LEN {
        return Err(EnvelopeError::TooShort);
    }

    let key_bytes = hex::decode(secret_key_hex).map_err(|_| EnvelopeError::BadKey)?;
    if key_bytes.len() != 32 {
        return Err(EnvelopeError::BadKey);
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| EnvelopeError::Decrypt)
}

/// Client-side counterpart of [`open_envelope`]; returns the base64
/// envelope and its hex SHA-256 hash.
pub fn seal_envelope(
    secret_key_hex: &str,
    plaintext: &[u8],
    nonce: &[u8; NONCE_LEN],
) -> Result<(String, String), EnvelopeError> {
    let key_bytes = hex::decode(secret_key_hex).map_err(|_| EnvelopeError::BadKey)?;
    if key_bytes.len() != 32 {
        return Err(EnvelopeError::BadKey);
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| EnvelopeError::Decrypt)?;

    let mut raw = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    raw.extend_from_slice(nonce);
    raw.extend_from_slice(&ciphertext);

    let encoded = general_purpose::STANDARD.encode(&raw);
    let hash = sha256_hex(encoded.as_bytes());
    Ok((encoded, hash))
}
