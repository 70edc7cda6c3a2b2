//! Configuration loading and validation.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any required variable is missing or invalid.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Minimum length of the field encryption secret, in characters.
pub const MIN_KEY_CHARS: usize = 32;

/// Validated process configuration.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Secret the field cipher key is derived from. **Required.**
    ///
    /// `ENCRYPTION_KEY` is accepted as a fallback name.
    #[serde(default, alias = "encryption_key")]
    pub field_encryption_key: String,

    /// PostgreSQL connection URL.
    #[serde(default)]
    pub database_url: String,

    /// Upper bound on pooled storage connections.
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// Name of the session variable read by the row-security policies.
    #[serde(default = "default_tenant_variable")]
    pub tenant_variable: String,

    /// Optional YAML file replacing the built-in encrypted field table.
    #[serde(default)]
    pub encrypted_fields_path: Option<String>,

    /// Policies a table needs before the health check reports it as `ok`.
    #[serde(default = "default_min_policy_count")]
    pub min_policy_count: u32,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_db_max_connections() -> u32 {
    5
}
fn default_tenant_variable() -> String {
    "app.current_tenant_id".into()
}
fn default_min_policy_count() -> u32 {
    4
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Returns `true` when a usable encryption secret is configured.
    pub fn has_encryption_key(&self) -> bool {
        self.field_encryption_key.chars().count() >= MIN_KEY_CHARS
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        if self.field_encryption_key.trim().is_empty() {
            anyhow::bail!("FIELD_ENCRYPTION_KEY (or ENCRYPTION_KEY) is required and must not be empty");
        }
        if !self.has_encryption_key() {
            anyhow::bail!("FIELD_ENCRYPTION_KEY must be at least {MIN_KEY_CHARS} characters");
        }
        ensure_non_empty(&self.tenant_variable, "TENANT_VARIABLE")?;
        if !self.tenant_variable.contains('.') {
            // Custom settings must be namespaced, e.g. `app.current_tenant_id`.
            anyhow::bail!("TENANT_VARIABLE must be a dotted custom setting name");
        }
        if self.db_max_connections == 0 {
            anyhow::bail!("DB_MAX_CONNECTIONS must be > 0");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("field_encryption_key", &"[REDACTED]")
            .field("database_url", &"[REDACTED]")
            .field("db_max_connections", &self.db_max_connections)
            .field("tenant_variable", &self.tenant_variable)
            .field("encrypted_fields_path", &self.encrypted_fields_path)
            .field("min_policy_count", &self.min_policy_count)
            .field("log_level", &self.log_level)
            .finish()
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        field_encryption_key: "k".repeat(MIN_KEY_CHARS),
        database_url: "postgres://localhost/test".into(),
        db_max_connections: default_db_max_connections(),
        tenant_variable: default_tenant_variable(),
        encrypted_fields_path: None,
        min_policy_count: default_min_policy_count(),
        log_level: default_log_level(),
    }
}
