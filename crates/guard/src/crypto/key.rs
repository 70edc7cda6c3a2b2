//! [`KeyBytes`]: the field cipher key, held only in memory.

use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::MIN_KEY_CHARS;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Errors produced while building the cipher key.
#[derive(Debug, Error)]
pub enum KeyError {
    /// No secret was configured.
    #[error("field encryption key is not configured")]
    Missing,

    /// The configured secret is shorter than [`MIN_KEY_CHARS`].
    #[error("field encryption key must be at least {MIN_KEY_CHARS} characters")]
    TooShort,

    /// Raw key material has an unexpected length.
    #[error("key has invalid length: expected {KEY_LEN} bytes, got {0}")]
    InvalidLength(usize),
}

/// Fixed-size key buffer that holds exactly [`KEY_LEN`] bytes.
///
/// The memory is overwritten with zeroes on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyBytes(Box<[u8; KEY_LEN]>);

impl KeyBytes {
    /// Derive the 256-bit key from the configured secret with SHA-256.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Missing`] for a blank secret and
    /// [`KeyError::TooShort`] for one below [`MIN_KEY_CHARS`] characters.
    pub fn derive(secret: &str) -> Result<Self, KeyError> {
        if secret.trim().is_empty() {
            return Err(KeyError::Missing);
        }
        if secret.chars().count() < MIN_KEY_CHARS {
            return Err(KeyError::TooShort);
        }
        let digest = Sha256::digest(secret.as_bytes());
        Self::from_slice(digest.as_slice())
    }

    /// Wrap raw key material.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidLength`] if the slice is not [`KEY_LEN`] bytes.
    pub fn from_slice(key_bytes: &[u8]) -> Result<Self, KeyError> {
        if key_bytes.len() != KEY_LEN {
            return Err(KeyError::InvalidLength(key_bytes.len()));
        }
        let mut buf = Box::new([0u8; KEY_LEN]);
        buf.copy_from_slice(key_bytes);
        Ok(Self(buf))
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }
}

impl std::fmt::Debug for KeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material, not even in debug builds.
        f.write_str("KeyBytes([REDACTED])")
    }
}
