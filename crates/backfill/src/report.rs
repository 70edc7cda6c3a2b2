//! Human-readable migration summary.

use std::fmt::Write;

use common::protocol::MigrationSummary;

pub fn render(summary: &MigrationSummary) -> String {
    let mut out = String::new();
    let mode = if summary.dry_run { "DRY RUN" } else { "LIVE" };
    let _ = writeln!(out, "Field encryption backfill ({mode})");
    let _ = writeln!(
        out,
        "{:<20} {:>8} {:>10} {:>10} {:>8} {:>7}",
        "model", "total", "processed", "encrypted", "skipped", "errors"
    );
    for m in &summary.models {
        let _ = writeln!(
            out,
            "{:<20} {:>8} {:>10} {:>10} {:>8} {:>7}",
            m.model, m.total, m.processed, m.encrypted, m.skipped, m.errors
        );
        for e in &m.error_details {
            let _ = writeln!(out, "    ! {}: {}", e.record_id, e.detail);
        }
        if m.errors_truncated > 0 {
            let _ = writeln!(out, "    ... and {} more error(s)", m.errors_truncated);
        }
    }
    let t = &summary.totals;
    let _ = writeln!(
        out,
        "{:<20} {:>8} {:>10} {:>10} {:>8} {:>7}",
        "TOTAL", t.total, t.processed, t.encrypted, t.skipped, t.errors
    );
    if summary.dry_run && t.encrypted > 0 {
        let _ = writeln!(out, "Re-run without --dry-run to encrypt {} row(s).", t.encrypted);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::protocol::ModelSummary;

    #[test]
    fn renders_rows_errors_and_totals() {
        let mut summary = MigrationSummary::new(true);
        let mut patient = ModelSummary::new("Patient");
        patient.total = 3;
        patient.processed = 3;
        patient.encrypted = 1;
        patient.skipped = 1;
        patient.record_error("p3", "storage error: timeout");
        summary.push(patient);

        let text = render(&summary);
        assert!(text.contains("DRY RUN"));
        assert!(text.contains("Patient"));
        assert!(text.contains("! p3: storage error: timeout"));
        assert!(text.contains("TOTAL"));
        assert!(text.contains("Re-run without --dry-run"));
    }
}
