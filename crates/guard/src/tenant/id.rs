//! Validated tenant identifiers.

use std::fmt;
use std::str::FromStr;

use common::GuardError;
use uuid::{Uuid, Variant, Version};

/// A tenant identifier: a hyphenated version-4 UUID in either case.
///
/// Construction is the only validation point. Input is never trimmed, padded,
/// case-folded or otherwise coerced: the stored string is exactly the one the
/// caller passed, so it compares equal to `tenantId` values written with the
/// same spelling. Anything malformed is rejected with
/// [`GuardError::Validation`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TenantId(String);

impl TenantId {
    /// Hyphenated UUID length.
    const LEN: usize = 36;

    pub fn parse(raw: &str) -> Result<Self, GuardError> {
        // `Uuid::parse_str` also accepts braced, urn and simple forms.
        if raw.len() != Self::LEN {
            return Err(invalid(raw));
        }
        let uuid = Uuid::parse_str(raw).map_err(|_| invalid(raw))?;
        if uuid.get_version() != Some(Version::Random) || uuid.get_variant() != Variant::RFC4122 {
            return Err(invalid(raw));
        }
        Ok(Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters followed by `...`, for logs.
    pub fn short(&self) -> String {
        truncate_id(&self.0)
    }
}

/// Log-safe rendering of any identifier.
pub fn truncate_id(raw: &str) -> String {
    let head: String = raw.chars().take(8).collect();
    format!("{head}...")
}

fn invalid(raw: &str) -> GuardError {
    // The rejected value itself is not echoed back.
    GuardError::Validation(format!(
        "tenant id must be a hyphenated v4 UUID (got {} chars)",
        raw.chars().count()
    ))
}

impl FromStr for TenantId {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TenantId({})", self.short())
    }
}
