//! AES-256-GCM-SIV field encryption primitives.
//!
//! This module is intentionally free of storage and tenant dependencies.
//! It provides the low-level encrypt/decrypt operations used by the
//! encryption interceptor and the backfill migrator.
//!
//! # Envelope format
//!
//! ```text
//! enc.v1.<base64url-no-pad(nonce)>.<base64url-no-pad(ciphertext+tag)>
//! ```
//!
//! The `v1` segment enables future algorithm or key-version migration without
//! breaking existing ciphertext.

pub mod cipher;
pub mod key;
pub mod mask;

pub use cipher::{is_envelope, CipherError, FieldCipher};
pub use key::{KeyBytes, KEY_LEN};
pub use mask::{mask_field, mask_ssn};
