//! Row-security health check.
//!
//! Each tenant-scoped table is classified from the catalog:
//!
//! | enabled | forced | policies >= threshold | status    |
//! |---------|--------|-----------------------|-----------|
//! | no      | any    | any                   | `error`   |
//! | yes     | no     | any                   | `warning` |
//! | yes     | any    | no                    | `warning` |
//! | yes     | yes    | yes                   | `ok`      |

use common::protocol::{CheckStatus, HealthReport, TableHealth};
use tracing::{error, info, warn};

use crate::storage::{RowSecurityStatus, Session};

/// Policies per table (select, insert, update, delete) expected by default.
pub const DEFAULT_MIN_POLICY_COUNT: u32 = 4;

/// Catalog state of `table`. Introspection failures report all-false.
pub async fn verify_row_security(session: &mut dyn Session, table: &str) -> RowSecurityStatus {
    match session.row_security(table).await {
        Ok(status) => status,
        Err(e) => {
            error!(table, error = %e, "failed to verify row security");
            RowSecurityStatus::default()
        }
    }
}

pub fn classify(status: &RowSecurityStatus, min_policy_count: u32) -> CheckStatus {
    if !status.enabled {
        CheckStatus::Error
    } else if !status.forced || status.policy_count < min_policy_count {
        CheckStatus::Warning
    } else {
        CheckStatus::Ok
    }
}

pub async fn run_health_check(
    session: &mut dyn Session,
    tables: &[String],
    min_policy_count: u32,
) -> HealthReport {
    let mut results = Vec::with_capacity(tables.len());
    for table in tables {
        let status = verify_row_security(session, table).await;
        let verdict = classify(&status, min_policy_count);
        if verdict != CheckStatus::Ok {
            warn!(
                table = %table,
                enabled = status.enabled,
                forced = status.forced,
                policy_count = status.policy_count,
                "row security not fully configured"
            );
        }
        results.push(TableHealth {
            table: table.clone(),
            enabled: status.enabled,
            forced: status.forced,
            policy_count: status.policy_count,
            status: verdict,
        });
    }

    let errors = results.iter().filter(|t| t.status == CheckStatus::Error).count();
    let warnings = results.iter().filter(|t| t.status == CheckStatus::Warning).count();
    let (verdict, summary) = if errors > 0 {
        (CheckStatus::Error, format!("{errors} table(s) missing row security"))
    } else if warnings > 0 {
        (CheckStatus::Warning, format!("OK with {warnings} warning(s)"))
    } else {
        (CheckStatus::Ok, "all tables properly configured".to_owned())
    };
    info!(verdict = ?verdict, tables = results.len(), "row security health check finished");

    HealthReport {
        healthy: errors == 0,
        verdict,
        tables: results,
        summary: format!("Row security health check: {summary}"),
    }
}
