//! `field-backfill`: retrofits field encryption onto existing rows.
//!
//! Startup sequence:
//! 1. Parse arguments.
//! 2. Load and validate [`Config`]; a missing key stops here.
//! 3. Initialise logging.
//! 4. Connect the PostgreSQL pool.
//! 5. Run the migrator and print its summary.

mod cli;
mod report;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use tenant_guard::backfill::Migrator;
use tenant_guard::storage::PgDatabase;
use tenant_guard::{telemetry, Config};

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = Config::from_env().map_err(|e| {
        // Logging is not up yet.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    let level = if cli.verbose { "debug" } else { cfg.log_level.as_str() };
    telemetry::init(level)?;
    info!(version = env!("CARGO_PKG_VERSION"), dry_run = cli.dry_run, "field-backfill starting");

    let db = PgDatabase::connect(&cfg)
        .await
        .context("failed to connect to the database")?;
    let migrator = Migrator::from_config(db, &cfg)?;
    let summary = migrator.run(&cli.options()).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", report::render(&summary));
    }
    Ok(())
}
