//! AES-256-GCM-SIV encryption and decryption of individual string fields.
//!
//! **Algorithm choice:** AES-256-GCM-SIV (RFC 8452) is nonce-misuse-resistant.
//! Every call still draws a fresh random 96-bit nonce, so equal plaintexts
//! produce different envelopes.
//!
//! **Do NOT substitute plain AES-256-GCM with a fixed nonce.** GCM nonce reuse
//! breaks both confidentiality and authentication.

use std::str::FromStr;

use aes_gcm_siv::{
    aead::{Aead, KeyInit, OsRng},
    Aes256GcmSiv, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use thiserror::Error;

use super::key::{KeyBytes, KeyError};
use crate::config::Config;

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of the authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Format marker that opens every envelope.
pub const ENVELOPE_MARKER: &str = "enc";

/// Envelope format version.
pub const VERSION: &str = "v1";

/// base64url-no-pad length of a [`NONCE_LEN`]-byte nonce.
const ENCODED_NONCE_LEN: usize = 16;

/// base64url-no-pad length of a bare [`TAG_LEN`]-byte tag (empty plaintext).
const MIN_ENCODED_CIPHERTEXT_LEN: usize = 22;

/// A parsed envelope.
///
/// The string representation is
/// `enc.v1.<base64url(nonce)>.<base64url(ciphertext+tag)>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedField {
    /// Raw nonce bytes.
    pub nonce: [u8; NONCE_LEN],
    /// Raw ciphertext + authentication tag bytes.
    pub ciphertext: Vec<u8>,
}

impl EncryptedField {
    /// Encode this value to its canonical string representation.
    pub fn to_string_repr(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            ENVELOPE_MARKER,
            VERSION,
            URL_SAFE_NO_PAD.encode(self.nonce),
            URL_SAFE_NO_PAD.encode(&self.ciphertext),
        )
    }
}

impl FromStr for EncryptedField {
    type Err = CipherError;

    /// Parse an envelope string back into an [`EncryptedField`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(4, '.').collect();
        if parts.len() != 4 || parts[0] != ENVELOPE_MARKER || parts[1] != VERSION {
            return Err(CipherError::InvalidFormat);
        }
        let nonce_bytes = URL_SAFE_NO_PAD
            .decode(parts[2])
            .map_err(|_| CipherError::InvalidFormat)?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CipherError::InvalidFormat);
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&nonce_bytes);

        let ciphertext = URL_SAFE_NO_PAD
            .decode(parts[3])
            .map_err(|_| CipherError::InvalidFormat)?;
        if ciphertext.len() < TAG_LEN {
            return Err(CipherError::InvalidFormat);
        }

        Ok(Self { nonce, ciphertext })
    }
}

/// Errors produced by the cipher layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The key could not be built from configuration.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// AES-GCM-SIV encryption or decryption failed (wrong key or tampered data).
    #[error("aead operation failed")]
    AeadFailure,

    /// The value does not match the envelope structure.
    #[error("invalid envelope format")]
    InvalidFormat,

    /// The authenticated plaintext is not valid UTF-8.
    #[error("decrypted value is not valid UTF-8")]
    InvalidUtf8,
}

/// Structural envelope recogniser. Needs no key.
///
/// Checks the marker, the version, the exact encoded nonce length, and that the
/// ciphertext segment is long enough to hold an authentication tag. Both
/// encoded segments must use the base64url alphabet.
pub fn is_envelope(value: &str) -> bool {
    let mut parts = value.splitn(4, '.');
    let (Some(marker), Some(version), Some(nonce), Some(ciphertext)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    marker == ENVELOPE_MARKER
        && version == VERSION
        && nonce.len() == ENCODED_NONCE_LEN
        && is_base64url(nonce)
        && ciphertext.len() >= MIN_ENCODED_CIPHERTEXT_LEN
        && is_base64url(ciphertext)
}

fn is_base64url(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Authenticated encryption of single string values with one process-wide key.
///
/// Each clone owns its own key buffer, zeroed on drop.
#[derive(Clone, Debug)]
pub struct FieldCipher {
    key: KeyBytes,
}

impl FieldCipher {
    /// Build a cipher around an already-derived key.
    pub fn new(key: KeyBytes) -> Self {
        Self { key }
    }

    /// Build the cipher from process configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Key`] if the secret is missing or too short.
    pub fn from_config(cfg: &Config) -> Result<Self, CipherError> {
        Ok(Self::new(KeyBytes::derive(&cfg.field_encryption_key)?))
    }

    /// Encrypt `plaintext` into an envelope string.
    ///
    /// Values that already are envelopes, and blank values, are returned
    /// unchanged: encrypting twice is never possible through this method.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::AeadFailure`] on an internal AEAD error.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        if plaintext.trim().is_empty() || is_envelope(plaintext) {
            return Ok(plaintext.to_owned());
        }
        Ok(encrypt_field(plaintext.as_bytes(), self.key.as_slice())?.to_string_repr())
    }

    /// Decrypt an envelope string back to plaintext.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidFormat`] if `envelope` is not an envelope,
    /// [`CipherError::AeadFailure`] on tampering or a wrong key, and
    /// [`CipherError::InvalidUtf8`] if the plaintext is not UTF-8.
    pub fn decrypt(&self, envelope: &str) -> Result<String, CipherError> {
        let field = EncryptedField::from_str(envelope)?;
        let bytes = decrypt_field(&field, self.key.as_slice())?;
        String::from_utf8(bytes).map_err(|_| CipherError::InvalidUtf8)
    }

    /// See [`is_envelope`].
    pub fn is_envelope(value: &str) -> bool {
        is_envelope(value)
    }
}

/// Encrypt raw bytes with a fresh random nonce.
fn encrypt_field(plaintext: &[u8], key: &[u8]) -> Result<EncryptedField, CipherError> {
    let cipher = build_cipher(key)?;

    use aes_gcm_siv::aead::rand_core::RngCore;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CipherError::AeadFailure)?;

    Ok(EncryptedField {
        nonce: nonce_bytes,
        ciphertext,
    })
}

fn decrypt_field(field: &EncryptedField, key: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = build_cipher(key)?;
    let nonce = Nonce::from_slice(&field.nonce);
    cipher
        .decrypt(nonce, field.ciphertext.as_ref())
        .map_err(|_| CipherError::AeadFailure)
}

fn build_cipher(key: &[u8]) -> Result<Aes256GcmSiv, CipherError> {
    Aes256GcmSiv::new_from_slice(key)
        .map_err(|_| CipherError::Key(KeyError::InvalidLength(key.len())))
}

#[cfg(test)]
pub(crate) fn test_cipher() -> FieldCipher {
    FieldCipher::new(KeyBytes::derive("unit-test-secret-unit-test-secret-0001").unwrap())
}

/// Flip one ciphertext character, keeping the envelope shape.
#[cfg(test)]
pub(crate) fn tamper(envelope: &str) -> String {
    let mut chars: Vec<char> = envelope.chars().collect();
    let i = 30;
    chars[i] = if chars[i] == 'A' { 'B' } else { 'A' };
    let out: String = chars.into_iter().collect();
    assert!(is_envelope(&out));
    out
}
