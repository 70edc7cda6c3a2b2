//! Structured logging setup.
//!
//! # Telemetry invariants
//!
//! - **No sensitive values or key material** in any log field. Tenant ids are
//!   logged truncated (see [`crate::tenant::TenantId::short`]).
//! - Log level comes from `LOG_LEVEL` (default: `info`); `RUST_LOG` wins when
//!   set.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global JSON subscriber.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    Ok(())
}
