//! Human-readable output for each command.
//!
//! Every renderer returns the full text so callers decide where it goes and
//! tests can compare it directly.

use std::fmt::Write;

use doctor_core::{
    numbered_listing, BackupObject, CheckReport, RepairCheck, RepairReport, RestorePlan,
    VerifyReport, QUEUE_DELAYED_THRESHOLD,
};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

fn ok_fail(ok: bool) -> &'static str {
    if ok {
        "OK"
    } else {
        "FAIL"
    }
}

/// One line per probe that produced data.
pub fn check_text(report: &CheckReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "API         {}    {}ms", ok_fail(report.api.ok), report.api.ms);

    if let Some(meta) = &report.meta {
        let federation = if meta.federation { "enabled" } else { "disabled" };
        let _ = writeln!(out, "Version     OK    {}", meta.version);
        let _ = writeln!(out, "Name        OK    {}", meta.name);
        let _ = writeln!(out, "Federation  OK    {federation}");
    }

    if let Some(stream) = &report.stream {
        let _ = writeln!(out, "Streaming   {}    {}ms", ok_fail(stream.ok), stream.ms);
    }

    if let Some(stats) = &report.stats {
        let _ = writeln!(out, "Stats       OK    notes:{} users:{}", stats.notes, stats.users);
    }

    if let Some(queue) = &report.queue {
        let q = &queue.info;
        let status = if q.delayed > QUEUE_DELAYED_THRESHOLD {
            "WARN"
        } else {
            "OK"
        };
        let _ = writeln!(
            out,
            "Queue       {status}    deliver:{} inbox:{} db:{} delayed:{}",
            q.deliver, q.inbox, q.db, q.delayed
        );
    }

    if let Some(server) = &report.server {
        let s = &server.info;
        let _ = writeln!(
            out,
            "Server      OK    {} ({} cores) mem:{:.1}GB disk:{:.1}%",
            s.cpu_model,
            s.cpu_cores,
            s.mem_total as f64 / GIB,
            s.fs_percent
        );
    }
    out
}

pub fn backup_listing(backups: &[BackupObject]) -> String {
    if backups.is_empty() {
        return "No backups found.\n".to_string();
    }
    format!("Available backups:\n{}\n", numbered_listing(backups))
}

pub fn restore_plan(plan: &RestorePlan) -> String {
    let mut out = String::from("[DRY RUN] Would execute:\n");
    for (i, step) in plan.steps.iter().enumerate() {
        let _ = writeln!(out, "  {}. {}: {}", i + 1, step.label, step.subject);
    }
    out
}

pub fn verify_text(report: &VerifyReport) -> String {
    let mut out = String::new();
    let verdict = if report.ok { "PASS" } else { "FAIL" };
    let _ = writeln!(out, "=== Verification Result: {verdict} ===");
    let _ = writeln!(out, "Backup:     {}", report.backup_file);
    let _ = writeln!(out, "Download:   {}", ok_fail(report.download_ok));
    let _ = writeln!(out, "Extract:    {}", ok_fail(report.extract_ok));
    let _ = writeln!(out, "Restore:    {}", ok_fail(report.restore_ok));
    let _ = writeln!(out, "Integrity:  {}", ok_fail(report.integrity_ok));
    if let Some(error) = &report.error {
        let _ = writeln!(out, "Error:      {error}");
    }

    if !report.checks.is_empty() {
        out.push_str("\nIntegrity Checks:\n");
        for check in &report.checks {
            let _ = writeln!(
                out,
                "  {:<15} {}  {}",
                check.name,
                ok_fail(check.ok),
                check.detail
            );
        }
    }

    out.push('\n');
    out.push_str(if report.ok {
        "Backup is valid and can be restored.\n"
    } else {
        "Backup verification failed.\n"
    });
    out
}

fn repair_line(out: &mut String, check: &RepairCheck) {
    let status = if check.error().is_some() { "ERROR" } else { "OK" };
    let name = check.name();
    if check.found() == 0 {
        let _ = writeln!(out, "  {name:<22} {status}  (none found)");
    } else if check.skipped() {
        let _ = writeln!(out, "  {name:<22} {status}  (found {}, would fix)", check.found());
    } else {
        let _ = writeln!(
            out,
            "  {name:<22} {status}  (fixed {}/{})",
            check.fixed_count(),
            check.found()
        );
    }
    if let Some(error) = check.error() {
        let _ = writeln!(out, "      Error: {error}");
    }
}

pub fn repair_text(report: &RepairReport) -> String {
    let mut out = String::new();
    for check in &report.repairs {
        repair_line(&mut out, check);
    }

    out.push('\n');
    out.push_str(if report.dry_run {
        "=== Dry Run Summary ===\n"
    } else {
        "=== Repair Summary ===\n"
    });
    let _ = writeln!(out, "Issues found:  {}", report.total_found());
    if report.dry_run {
        let _ = writeln!(out, "Would fix:     {}", report.total_found());
    } else {
        let _ = writeln!(out, "Issues fixed:  {}", report.total_fixed());
    }
    if report.error_count() > 0 {
        let _ = writeln!(out, "Errors:        {}", report.error_count());
    }

    out.push('\n');
    out.push_str(match (report.ok, report.dry_run) {
        (true, true) => "Dry run completed. Use without --dry-run to apply fixes.\n",
        (true, false) => "Repair completed successfully.\n",
        (false, _) => "Repair completed with errors.\n",
    });
    out
}
