// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Field Encryption
//!
//! AES-256-GCM over individual sensitive fields. A token is
//! `base64(nonce || ciphertext || tag)` with a fresh 96-bit nonce drawn from
//! the OS RNG on every call. Any modification of the token, or decryption
//! under a different key, fails GCM authentication and surfaces as
//! [`SecurityError::DecryptionError`]; corrupted plaintext is never returned.
//!
//! The key lives in [`EncryptionKey`], which zeroes its bytes on drop and
//! never prints them.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::Zeroize;

use crate::error::{ConfigError, SecurityError};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;
/// GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// 256-bit secret key. Zeroed on drop; `Debug` prints `[REDACTED]`.
#[derive(Clone)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            ConfigError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, bytes.len()))
        })?;
        Ok(Self(array))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, ConfigError> {
        let mut decoded = STANDARD
            .decode(encoded)
            .map_err(|_| ConfigError::InvalidKey("not valid base64".to_string()))?;
        let key = Self::from_bytes(&decoded);
        decoded.zeroize();
        key
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

impl Serialize for EncryptionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for EncryptionKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Authenticated encryption of opaque field payloads under the process key.
pub struct CryptoService {
    cipher: Aes256Gcm,
}

impl CryptoService {
    pub fn new(key: &EncryptionKey) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(&key.0);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypt `plaintext` into a base64 token.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, SecurityError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self.cipher.encrypt(nonce, plaintext).map_err(|_| {
            tracing::error!(
                target: "security::crypto",
                event = "ENCRYPT_FAILED",
                len = plaintext.len(),
                "AES-GCM encryption failed"
            );
            SecurityError::EncryptionError
        })?;

        let mut token = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(token))
    }

    /// Decrypt a token produced by [`CryptoService::encrypt`].
    pub fn decrypt(&self, token: &str) -> Result<Vec<u8>, SecurityError> {
        let raw = STANDARD.decode(token).map_err(|_| {
            tracing::warn!(
                target: "security::crypto",
                event = "DECRYPT_BAD_ENCODING",
                "Ciphertext token is not valid base64"
            );
            SecurityError::DecryptionError
        })?;

        if raw.len() < NONCE_LEN + TAG_LEN {
            tracing::warn!(
                target: "security::crypto",
                event = "DECRYPT_TRUNCATED",
                len = raw.len(),
                "Ciphertext token too short"
            );
            return Err(SecurityError::DecryptionError);
        }

        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| {
                tracing::warn!(
                    target: "security::crypto",
                    event = "DECRYPT_AUTH_FAILED",
                    "Ciphertext failed authentication (tampered or wrong key)"
                );
                SecurityError::DecryptionError
            })
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<String, SecurityError> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Decrypt and require valid UTF-8.
    pub fn decrypt_str(&self, token: &str) -> Result<String, SecurityError> {
        String::from_utf8(self.decrypt(token)?).map_err(|_| SecurityError::DecryptionError)
    }
}

impl fmt::Debug for CryptoService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoService")
            .field("algorithm", &"AES-256-GCM")
            .finish_non_exhaustive()
    }
}
