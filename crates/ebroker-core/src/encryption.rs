// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AES-256-GCM encryption for secret material stored at rest.
//!
//! Kubeconfigs and credential-bearing parameter blobs are encrypted with a
//! process-held 32-byte key before they reach the database. Ciphertexts are
//! self-contained: `base64(nonce || ciphertext)`.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;

use crate::error::{BrokerError, Result};

const NONCE_LEN: usize = 12;

/// Column encryptor holding the process key.
#[derive(Clone)]
pub struct Encryptor {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryptor").finish_non_exhaustive()
    }
}

impl Encryptor {
    /// Build an encryptor from a 32-byte key.
    pub fn new(key: &str) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|_| BrokerError::Internal("encryption key must be 32 bytes".into()))?;
        Ok(Self { cipher })
    }

    /// Encrypt a plaintext into `base64(nonce || ciphertext)`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| BrokerError::Internal("encryption failed".into()))?;
        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    /// Decrypt a value produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = BASE64
            .decode(encoded)
            .map_err(|e| BrokerError::Internal(format!("ciphertext decode: {}", e)))?;
        if combined.len() < NONCE_LEN {
            return Err(BrokerError::Internal("ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| BrokerError::Internal("decryption failed".into()))?;
        String::from_utf8(plaintext)
            .map_err(|_| BrokerError::Internal("decrypted value is not UTF-8".into()))
    }
}
