//! Common error type shared across crates.

use thiserror::Error;

/// Error returned by every operation the data-access layer exposes to callers.
///
/// Each variant carries a stable machine-readable code:
/// - [`GuardError::Validation`] → `validation_error`
/// - [`GuardError::Encryption`] → `encryption_error`
/// - [`GuardError::Decryption`] → `decryption_error`
/// - [`GuardError::Storage`] → `storage_error`
/// - [`GuardError::Configuration`] → `configuration_error`
/// - [`GuardError::Internal`] → `internal_error`
#[derive(Debug, Error)]
pub enum GuardError {
    /// Caller input was rejected before reaching storage (e.g. a malformed tenant id).
    #[error("validation error: {0}")]
    Validation(String),

    /// A sensitive value could not be encrypted; the write was aborted.
    #[error("encryption failure: {0}")]
    Encryption(String),

    /// An envelope could not be authenticated or parsed.
    #[error("decryption failure: {0}")]
    Decryption(String),

    /// The underlying storage engine rejected or failed a statement.
    #[error("storage error: {0}")]
    Storage(String),

    /// Required process configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GuardError {
    /// Returns the machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            GuardError::Validation(_) => "validation_error",
            GuardError::Encryption(_) => "encryption_error",
            GuardError::Decryption(_) => "decryption_error",
            GuardError::Storage(_) => "storage_error",
            GuardError::Configuration(_) => "configuration_error",
            GuardError::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(GuardError::Validation("x".into()).code(), "validation_error");
        assert_eq!(GuardError::Encryption("x".into()).code(), "encryption_error");
        assert_eq!(GuardError::Decryption("x".into()).code(), "decryption_error");
        assert_eq!(GuardError::Storage("x".into()).code(), "storage_error");
        assert_eq!(
            GuardError::Configuration("x".into()).code(),
            "configuration_error"
        );
        assert_eq!(GuardError::Internal("x".into()).code(), "internal_error");
    }

    #[test]
    fn display_includes_message() {
        let e = GuardError::Validation("invalid tenant id".into());
        assert!(e.to_string().contains("invalid tenant id"));
    }
}
