//! Command-line arguments.

use clap::Parser;
use tenant_guard::backfill::{MigrationOptions, DEFAULT_BATCH_SIZE};

/// Encrypt sensitive fields that are still stored as plaintext.
///
/// Reads `FIELD_ENCRYPTION_KEY` and `DATABASE_URL` from the environment.
#[derive(Debug, Parser)]
#[command(name = "field-backfill", version, about)]
pub struct Cli {
    /// Report what would be encrypted without writing anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Rows fetched per page.
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE, value_parser = clap::value_parser!(u64).range(1..))]
    pub batch_size: u64,

    /// Only process this entity type.
    #[arg(long, value_name = "NAME")]
    pub model: Option<String>,

    /// Log every row decision.
    #[arg(long, short)]
    pub verbose: bool,

    /// Print the summary as JSON.
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    pub fn options(&self) -> MigrationOptions {
        MigrationOptions {
            dry_run: self.dry_run,
            batch_size: self.batch_size,
            model: self.model.clone(),
            verbose: self.verbose,
        }
    }
}
