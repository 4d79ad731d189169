//! At-rest encryption for cached payloads.
//!
//! AES-256-GCM with a fresh 96-bit IV drawn from the OS RNG on every
//! encryption. Key material is fixed at construction; only the
//! enabled/disabled mode can change afterwards.
//!
//! The mode is process-wide: when it is off, new entries are stored in
//! plaintext and any entry that was written encrypted refuses to open
//! (`EncryptionUnavailable`) instead of being handed out as data.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::debug;

use crate::entry::{Iv, Payload, IV_LEN};
use crate::error::{CacheError, CacheResult};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// Payload cipher with a process-wide enable flag.
pub struct Cipher {
    aead: Option<Aes256Gcm>,
    enabled: AtomicBool,
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher")
            .field("has_key", &self.aead.is_some())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl Cipher {
    /// A cipher without key material. Encryption can never be enabled.
    pub fn disabled() -> Self {
        Self {
            aead: None,
            enabled: AtomicBool::new(false),
        }
    }

    /// A cipher with a freshly generated random key.
    pub fn generate(enabled: bool) -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        Self {
            aead: Some(Aes256Gcm::new(&key)),
            enabled: AtomicBool::new(enabled),
        }
    }

    /// A cipher from raw key bytes (must be 32 bytes).
    pub fn with_key(key: &[u8], enabled: bool) -> CacheResult<Self> {
        let aead = Aes256Gcm::new_from_slice(key).map_err(|_| CacheError::Config {
            message: format!(
                "encryption key must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            ),
        })?;
        Ok(Self {
            aead: Some(aead),
            enabled: AtomicBool::new(enabled),
        })
    }

    /// A cipher from a base64-encoded key.
    pub fn from_base64_key(encoded: &str, enabled: bool) -> CacheResult<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| CacheError::Config {
                message: format!("invalid base64 encryption key: {}", e),
            })?;
        Self::with_key(&bytes, enabled)
    }

    pub fn has_key(&self) -> bool {
        self.aead.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Switch the process-wide mode.
    ///
    /// Enabling requires key material. Disabling is always allowed and
    /// leaves existing encrypted entries in place.
    pub fn set_enabled(&self, enabled: bool) -> CacheResult<()> {
        if enabled && self.aead.is_none() {
            return Err(CacheError::Config {
                message: "cannot enable encryption without key material".to_string(),
            });
        }
        self.enabled.store(enabled, Ordering::Release);
        debug!(enabled, "encryption mode changed");
        Ok(())
    }

    /// Encrypt `plaintext` under a new random IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> CacheResult<(Vec<u8>, Iv)> {
        let aead = self.aead()?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = aead
            .encrypt(&nonce, plaintext)
            .map_err(|_| CacheError::Crypto {
                message: "encryption failed".to_string(),
            })?;

        let mut iv = [0_u8; IV_LEN];
        iv.copy_from_slice(nonce.as_slice());
        Ok((ciphertext, iv))
    }

    /// Decrypt and authenticate `ciphertext` produced under `iv`.
    pub fn decrypt(&self, ciphertext: &[u8], iv: &Iv) -> CacheResult<Vec<u8>> {
        let aead = self.aead()?;
        aead.decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| CacheError::Crypto {
                message: "decryption failed: authentication tag mismatch".to_string(),
            })
    }

    /// Encode a fresh payload for storage according to the current mode.
    pub fn seal(&self, plaintext: Vec<u8>) -> CacheResult<Payload> {
        if !self.is_enabled() {
            return Ok(Payload::Plain(plaintext));
        }
        let (ciphertext, iv) = self.encrypt(&plaintext)?;
        Ok(Payload::Encrypted { ciphertext, iv })
    }

    /// Recover the plaintext of a stored payload.
    ///
    /// Fails with `EncryptionUnavailable` for an encrypted payload while the
    /// mode is off; the caller keeps the entry untouched.
    pub fn open(&self, key: &str, payload: &Payload) -> CacheResult<Vec<u8>> {
        match payload {
            Payload::Plain(bytes) => Ok(bytes.clone()),
            Payload::Encrypted { .. } if !self.is_enabled() => {
                Err(CacheError::EncryptionUnavailable {
                    key: key.to_string(),
                })
            }
            Payload::Encrypted { ciphertext, iv } => self.decrypt(ciphertext, iv),
        }
    }

    fn aead(&self) -> CacheResult<&Aes256Gcm> {
        self.aead.as_ref().ok_or_else(|| CacheError::Config {
            message: "no encryption key material configured".to_string(),
        })
    }
}

/// Generate a new random key, base64-encoded, suitable for
/// `REVAL_ENCRYPTION_KEY`.
pub fn generate_key_base64() -> String {
    let key = Aes256Gcm::generate_key(OsRng);
    BASE64.encode(key.as_slice())
}
