//! Encryption codec for remote data.
//!
//! Everything pushed to the remote blob store is encrypted on-device with
//! AES-256-GCM; the remote location is trusted for durability only. This
//! module provides the side-effect-free encrypt/decrypt pair and the
//! portable key descriptor envelope that travels alongside the key.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the only supported algorithm.
pub const ALGORITHM_NAME: &str = "AES-GCM";

/// Symmetric key length in bytes (256-bit).
pub const KEY_BYTES: usize = 32;

/// IV length in bytes carried by the descriptor.
///
/// Oversized next to the cipher's 12-byte nonce, but generated once and
/// reused consistently for the life of the key, so no correctness issue.
/// The cipher consumes the leading [`NONCE_BYTES`] of it.
pub const IV_BYTES: usize = 96;

/// Nonce length the AEAD actually consumes.
const NONCE_BYTES: usize = 12;

/// Algorithm name and IV for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmParams {
    /// Algorithm name; always [`ALGORITHM_NAME`].
    pub name: String,
    /// Initialization vector, generated once with the key.
    pub iv: Vec<u8>,
}

/// Portable key descriptor: algorithm parameters plus exported key material.
///
/// Serializes to the `key.json` envelope
/// `{ "algorithm": { "name", "iv" }, "key": <base64 key material> }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDescriptor {
    /// Algorithm parameters paired with the key.
    pub algorithm: AlgorithmParams,
    /// Base64-encoded 256-bit key material.
    pub key: String,
}

impl KeyDescriptor {
    /// Generate a fresh key and IV.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_BYTES];
        OsRng.fill_bytes(&mut key);
        let mut iv = vec![0u8; IV_BYTES];
        OsRng.fill_bytes(&mut iv);

        Self {
            algorithm: AlgorithmParams {
                name: ALGORITHM_NAME.to_string(),
                iv,
            },
            key: BASE64.encode(key),
        }
    }

    /// Decode the raw key material.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Integrity`] if the stored material is not valid
    /// base64 or has the wrong length.
    pub fn key_material(&self) -> Result<[u8; KEY_BYTES]> {
        let decoded = BASE64
            .decode(&self.key)
            .map_err(|e| Error::integrity(format!("malformed key material: {e}")))?;
        <[u8; KEY_BYTES]>::try_from(decoded)
            .map_err(|v| Error::integrity(format!("key material is {} bytes", v.len())))
    }
}

/// Resolve the AEAD nonce from the descriptor's IV.
fn nonce_from(params: &AlgorithmParams) -> Result<&[u8]> {
    if params.name != ALGORITHM_NAME {
        return Err(Error::integrity(format!(
            "unsupported algorithm '{}'",
            params.name
        )));
    }
    if params.iv.len() < NONCE_BYTES {
        return Err(Error::integrity(format!(
            "IV is {} bytes, need at least {NONCE_BYTES}",
            params.iv.len()
        )));
    }
    Ok(&params.iv[..NONCE_BYTES])
}

/// Encrypt a plaintext under the given algorithm parameters and key.
///
/// # Errors
///
/// Returns [`Error::Integrity`] if the parameters are unusable.
pub fn encrypt(params: &AlgorithmParams, key: &[u8; KEY_BYTES], plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce = nonce_from(params)?;
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| Error::internal("AES-GCM encryption failed"))
}

/// Decrypt a ciphertext produced by [`encrypt`] with the paired key/IV.
///
/// # Errors
///
/// Returns [`Error::Integrity`] if the ciphertext was not produced by this
/// key/IV pair (tamper or wrong key).
pub fn decrypt(
    params: &AlgorithmParams,
    key: &[u8; KEY_BYTES],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let nonce = nonce_from(params)?;
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::integrity("ciphertext rejected by AEAD"))
}
