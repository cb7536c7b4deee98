//! Integrity audit of a restored database.
//!
//! A fixed battery of read-only checks. Every check is best effort: a failed
//! query becomes `ok = false` with the error as detail, and the remaining
//! checks still run. Only `table_*` checks decide the overall result.

use doctor_tools::{quote_literal, SqlExecutor};
use serde::Serialize;
use tracing::{debug, info};

/// Tables a usable Misskey dump must contain.
pub const CRITICAL_TABLES: [&str; 4] = ["user", "note", "meta", "instance"];

/// Check names with this prefix gate the overall verdict.
pub const GATING_PREFIX: &str = "table_";

pub const TABLE_COUNT_SQL: &str =
    "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'public'";
pub const USER_COUNT_SQL: &str = r#"SELECT COUNT(*) FROM "user""#;
pub const NOTE_COUNT_SQL: &str = "SELECT COUNT(*) FROM note";
pub const ORPHAN_NOTES_SQL: &str =
    r#"SELECT COUNT(*) FROM note WHERE "userId" NOT IN (SELECT id FROM "user")"#;

/// Existence query for one table in schema `public`.
pub fn table_exists_sql(table: &str) -> String {
    format!(
        "SELECT COUNT(*) FROM information_schema.tables \
         WHERE table_schema = 'public' AND table_name = {}",
        quote_literal(table)
    )
}

/// Result of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

impl IntegrityCheck {
    fn new(name: impl Into<String>, ok: bool, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok,
            detail: detail.into(),
        }
    }

    /// Whether this check decides the overall result.
    pub fn is_gating(&self) -> bool {
        self.name.starts_with(GATING_PREFIX)
    }
}

/// Checks in execution order plus the public table count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub checks: Vec<IntegrityCheck>,
    pub table_count: i64,
}

impl AuditReport {
    pub fn integrity_ok(&self) -> bool {
        integrity_ok(&self.checks)
    }
}

/// Conjunction of the `table_*` checks. Informational checks never gate.
pub fn integrity_ok(checks: &[IntegrityCheck]) -> bool {
    checks.iter().filter(|c| c.is_gating()).all(|c| c.ok)
}

/// Runs the audit battery through a [`SqlExecutor`].
pub struct IntegrityAuditor<'a> {
    sql: &'a dyn SqlExecutor,
}

impl<'a> IntegrityAuditor<'a> {
    pub fn new(sql: &'a dyn SqlExecutor) -> Self {
        Self { sql }
    }

    pub async fn audit(&self, database: &str) -> AuditReport {
        let mut report = AuditReport::default();

        match self.sql.query_count(database, TABLE_COUNT_SQL).await {
            Ok(count) => {
                report.table_count = count;
                report.checks.push(IntegrityCheck::new(
                    "table_count",
                    count > 0,
                    format!("{count} tables"),
                ));
            }
            Err(e) => report
                .checks
                .push(IntegrityCheck::new("table_count", false, e.to_string())),
        }

        for table in CRITICAL_TABLES {
            let name = format!("{GATING_PREFIX}{table}");
            let check = match self.sql.query_count(database, &table_exists_sql(table)).await {
                Ok(count) => IntegrityCheck::new(
                    name,
                    count > 0,
                    format!("table '{table}' exists: {}", count > 0),
                ),
                Err(e) => IntegrityCheck::new(name, false, e.to_string()),
            };
            report.checks.push(check);
        }

        report.checks.push(
            self.informational(database, "user_count", USER_COUNT_SQL, "users")
                .await,
        );
        report.checks.push(
            self.informational(database, "note_count", NOTE_COUNT_SQL, "notes")
                .await,
        );

        let orphans = match self.sql.query_count(database, ORPHAN_NOTES_SQL).await {
            Ok(count) => {
                IntegrityCheck::new("orphan_notes", count == 0, format!("{count} orphan notes"))
            }
            Err(e) => IntegrityCheck::new("orphan_notes", false, e.to_string()),
        };
        report.checks.push(orphans);

        for check in report.checks.iter().filter(|c| !c.ok) {
            debug!(check = %check.name, detail = %check.detail, "Integrity check failed");
        }
        info!(
            database = %database,
            tables = report.table_count,
            integrity_ok = report.integrity_ok(),
            "Integrity audit complete"
        );
        report
    }

    async fn informational(
        &self,
        database: &str,
        name: &str,
        sql: &str,
        unit: &str,
    ) -> IntegrityCheck {
        match self.sql.query_count(database, sql).await {
            Ok(count) => IntegrityCheck::new(name, true, format!("{count} {unit}")),
            Err(e) => IntegrityCheck::new(name, false, e.to_string()),
        }
    }
}
