//! Report types produced by the data-access layer.
//!
//! These types are serialised as JSON by the command-line tools and by any
//! caller that surfaces health information.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Row-security health check
// ---------------------------------------------------------------------------

/// Outcome of a single check, also used as the overall verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// Fully configured.
    Ok,
    /// Enforced, but weaker than expected.
    Warning,
    /// Not enforced at all.
    Error,
}

/// Row-security state of one tenant-scoped table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableHealth {
    /// Table (entity type) name.
    pub table: String,
    /// Whether row security is enabled on the table.
    pub enabled: bool,
    /// Whether row security also applies to the table owner.
    pub forced: bool,
    /// Number of policies attached to the table.
    pub policy_count: u32,
    /// Derived status for this table.
    pub status: CheckStatus,
}

/// Report returned by the row-security health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// `false` as soon as one table has no row security at all.
    pub healthy: bool,
    /// Worst status across all tables.
    pub verdict: CheckStatus,
    /// Per-table results, in the order the tables were checked.
    pub tables: Vec<TableHealth>,
    /// One-line human-readable summary.
    pub summary: String,
}

// ---------------------------------------------------------------------------
// Backfill migration
// ---------------------------------------------------------------------------

/// Maximum number of per-row error details kept for one entity type.
pub const MAX_ERROR_DETAILS: usize = 10;

/// A row that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    /// Identifier of the failing row, or `"<unknown>"`.
    pub record_id: String,
    /// Short description of the failure. Never contains field values.
    pub detail: String,
}

/// Counters for one entity type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSummary {
    /// Entity type name.
    pub model: String,
    /// Rows present when the run started.
    pub total: u64,
    /// Rows examined.
    pub processed: u64,
    /// Rows that had (dry run) or got (live run) at least one field encrypted.
    pub encrypted: u64,
    /// Rows with nothing left to encrypt.
    pub skipped: u64,
    /// Rows that failed.
    pub errors: u64,
    /// The first [`MAX_ERROR_DETAILS`] failures.
    pub error_details: Vec<RowError>,
    /// Failures beyond the ones kept in `error_details`.
    pub errors_truncated: u64,
}

impl ModelSummary {
    /// Create an empty summary for `model`.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// Count a failed row, keeping its detail while there is room.
    pub fn record_error(&mut self, record_id: impl Into<String>, detail: impl Into<String>) {
        self.errors += 1;
        if self.error_details.len() < MAX_ERROR_DETAILS {
            self.error_details.push(RowError {
                record_id: record_id.into(),
                detail: detail.into(),
            });
        } else {
            self.errors_truncated += 1;
        }
    }
}

/// Roll-up counters across every entity type in a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub total: u64,
    pub processed: u64,
    pub encrypted: u64,
    pub skipped: u64,
    pub errors: u64,
}

/// Result of a complete migration run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationSummary {
    /// Whether the run was a dry run (no writes).
    pub dry_run: bool,
    /// Per entity type, in processing order.
    pub models: Vec<ModelSummary>,
    /// Global roll-up.
    pub totals: Totals,
}

impl MigrationSummary {
    /// Create an empty summary.
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    /// Append a finished entity type and fold it into the totals.
    pub fn push(&mut self, model: ModelSummary) {
        self.totals.total += model.total;
        self.totals.processed += model.processed;
        self.totals.encrypted += model.encrypted;
        self.totals.skipped += model.skipped;
        self.totals.errors += model.errors;
        self.models.push(model);
    }
}
