//! Detect-and-fix repairs against the live database.
//!
//! Orphan classes are declared in [`ORPHAN_RULES`] and run by one loop.
//! Maintenance operations (reindex, vacuum) follow. Each repair is recorded
//! independently; one failure never stops its siblings.

use doctor_tools::{quote_ident, PgConnection, SqlExecutor};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::RunMode;
use crate::confirm::Confirmer;
use crate::error::{DoctorError, Result};

/// One orphan-record class: how to count it and how to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrphanRule {
    pub name: &'static str,
    pub detect: &'static str,
    pub fix: &'static str,
}

pub const ORPHAN_RULES: [OrphanRule; 4] = [
    OrphanRule {
        name: "orphan_notes",
        detect: r#"SELECT COUNT(*) FROM note WHERE "userId" NOT IN (SELECT id FROM "user")"#,
        fix: r#"DELETE FROM note WHERE "userId" NOT IN (SELECT id FROM "user")"#,
    },
    OrphanRule {
        name: "orphan_reactions",
        detect: r#"SELECT COUNT(*) FROM note_reaction WHERE "noteId" NOT IN (SELECT id FROM note)"#,
        fix: r#"DELETE FROM note_reaction WHERE "noteId" NOT IN (SELECT id FROM note)"#,
    },
    OrphanRule {
        name: "orphan_notifications",
        detect: concat!(
            r#"SELECT COUNT(*) FROM notification "#,
            r#"WHERE "notifieeId" NOT IN (SELECT id FROM "user")"#,
        ),
        fix: r#"DELETE FROM notification WHERE "notifieeId" NOT IN (SELECT id FROM "user")"#,
    },
    OrphanRule {
        name: "orphan_drive_files",
        detect: concat!(
            r#"SELECT COUNT(*) FROM drive_file "#,
            r#"WHERE "userId" IS NOT NULL AND "userId" NOT IN (SELECT id FROM "user")"#,
        ),
        fix: concat!(
            r#"DELETE FROM drive_file "#,
            r#"WHERE "userId" IS NOT NULL AND "userId" NOT IN (SELECT id FROM "user")"#,
        ),
    },
];

pub const REINDEX: &str = "reindex";
pub const VACUUM_ANALYZE: &str = "vacuum_analyze";
pub const VACUUM_ANALYZE_SQL: &str = "VACUUM ANALYZE";

pub fn reindex_concurrently_sql(database: &str) -> String {
    format!("REINDEX DATABASE CONCURRENTLY {}", quote_ident(database))
}

pub fn reindex_sql(database: &str) -> String {
    format!("REINDEX DATABASE {}", quote_ident(database))
}

/// Which repairs run. The selective scopes are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepairScope {
    #[default]
    All,
    Orphans,
    Reindex,
    Vacuum,
}

impl RepairScope {
    /// Scope from the CLI's mutually exclusive flags.
    pub fn from_flags(orphans: bool, reindex: bool, vacuum: bool) -> Result<Self> {
        match (orphans, reindex, vacuum) {
            (false, false, false) => Ok(RepairScope::All),
            (true, false, false) => Ok(RepairScope::Orphans),
            (false, true, false) => Ok(RepairScope::Reindex),
            (false, false, true) => Ok(RepairScope::Vacuum),
            _ => Err(DoctorError::Config(
                "--orphans, --reindex and --vacuum are mutually exclusive".to_string(),
            )),
        }
    }

    pub fn runs_orphans(&self) -> bool {
        matches!(self, RepairScope::All | RepairScope::Orphans)
    }

    pub fn runs_reindex(&self) -> bool {
        matches!(self, RepairScope::All | RepairScope::Reindex)
    }

    pub fn runs_vacuum(&self) -> bool {
        matches!(self, RepairScope::All | RepairScope::Vacuum)
    }
}

/// Outcome of one repair.
///
/// Built only through the constructors, which keep `skipped ⇒ fixed = 0`
/// and `found = 0 ⇒ fixed = 0 ∧ ¬skipped`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairCheck {
    name: String,
    found: i64,
    fixed: i64,
    skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl RepairCheck {
    /// Nothing to do.
    pub fn clean(name: &str) -> Self {
        Self {
            name: name.to_string(),
            found: 0,
            fixed: 0,
            skipped: false,
            error: None,
        }
    }

    /// Found but left alone (dry run).
    pub fn pending(name: &str, found: i64) -> Self {
        if found <= 0 {
            return Self::clean(name);
        }
        Self {
            skipped: true,
            found,
            ..Self::clean(name)
        }
    }

    /// Found and fixed.
    pub fn fixed(name: &str, found: i64) -> Self {
        if found <= 0 {
            return Self::clean(name);
        }
        Self {
            found,
            fixed: found,
            ..Self::clean(name)
        }
    }

    pub fn failed(name: &str, found: i64, error: impl Into<String>) -> Self {
        Self {
            found: found.max(0),
            error: Some(error.into()),
            ..Self::clean(name)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn found(&self) -> i64 {
        self.found
    }

    pub fn fixed_count(&self) -> i64 {
        self.fixed
    }

    pub fn skipped(&self) -> bool {
        self.skipped
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// All repairs from one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    pub ok: bool,
    pub dry_run: bool,
    pub repairs: Vec<RepairCheck>,
}

impl RepairReport {
    fn new(dry_run: bool, repairs: Vec<RepairCheck>) -> Self {
        Self {
            ok: repairs.iter().all(|r| r.error.is_none()),
            dry_run,
            repairs,
        }
    }

    pub fn total_found(&self) -> i64 {
        self.repairs.iter().map(|r| r.found).sum()
    }

    pub fn total_fixed(&self) -> i64 {
        self.repairs.iter().map(|r| r.fixed).sum()
    }

    pub fn error_count(&self) -> usize {
        self.repairs.iter().filter(|r| r.error.is_some()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Confirmation refused; nothing ran.
    Cancelled,
    Completed(RepairReport),
}

/// Runs repairs against one database.
pub struct RepairEngine<'a> {
    sql: &'a dyn SqlExecutor,
    target: PgConnection,
}

impl<'a> RepairEngine<'a> {
    pub fn new(sql: &'a dyn SqlExecutor, target: PgConnection) -> Self {
        Self { sql, target }
    }

    fn warning(&self) -> String {
        format!(
            "WARNING: This will modify database '{}'\n   Host: {}:{}\n\n   \
             Use --dry-run to preview changes without modifying data.",
            self.target.database, self.target.host, self.target.port
        )
    }

    pub async fn run(
        &self,
        scope: RepairScope,
        mode: RunMode,
        confirmer: &dyn Confirmer,
    ) -> RepairOutcome {
        if mode.needs_confirmation() && !confirmer.confirm(&self.warning()).await {
            info!(database = %self.target.database, "Repair cancelled");
            return RepairOutcome::Cancelled;
        }

        info!(
            database = %self.target.database,
            dry_run = mode.dry_run,
            ?scope,
            "Running repairs"
        );
        let mut repairs = Vec::new();
        if scope.runs_orphans() {
            for rule in &ORPHAN_RULES {
                repairs.push(self.run_rule(rule, mode.dry_run).await);
            }
        }
        if scope.runs_reindex() {
            repairs.push(self.reindex(mode.dry_run).await);
        }
        if scope.runs_vacuum() {
            repairs.push(self.vacuum(mode.dry_run).await);
        }

        let report = RepairReport::new(mode.dry_run, repairs);
        info!(
            ok = report.ok,
            found = report.total_found(),
            fixed = report.total_fixed(),
            "Repairs finished"
        );
        RepairOutcome::Completed(report)
    }

    async fn run_rule(&self, rule: &OrphanRule, dry_run: bool) -> RepairCheck {
        let db = &self.target.database;
        let found = match self.sql.query_count(db, rule.detect).await {
            Ok(found) => found,
            Err(e) => {
                warn!(repair = rule.name, error = %e, "Orphan count failed");
                return RepairCheck::failed(rule.name, 0, format!("failed to count: {e}"));
            }
        };
        if found == 0 {
            return RepairCheck::clean(rule.name);
        }
        if dry_run {
            return RepairCheck::pending(rule.name, found);
        }
        match self.sql.execute(db, rule.fix).await {
            Ok(()) => {
                info!(repair = rule.name, fixed = found, "Orphans removed");
                RepairCheck::fixed(rule.name, found)
            }
            Err(e) => {
                warn!(repair = rule.name, error = %e, "Orphan delete failed");
                RepairCheck::failed(rule.name, found, format!("failed to delete: {e}"))
            }
        }
    }

    async fn reindex(&self, dry_run: bool) -> RepairCheck {
        if dry_run {
            return RepairCheck::pending(REINDEX, 1);
        }
        let db = &self.target.database;
        if let Err(e) = self.sql.execute(db, &reindex_concurrently_sql(db)).await {
            warn!(error = %e, "Concurrent reindex failed, retrying without CONCURRENTLY");
            if let Err(e) = self.sql.execute(db, &reindex_sql(db)).await {
                return RepairCheck::failed(REINDEX, 0, format!("failed: {e}"));
            }
        }
        RepairCheck::fixed(REINDEX, 1)
    }

    async fn vacuum(&self, dry_run: bool) -> RepairCheck {
        if dry_run {
            return RepairCheck::pending(VACUUM_ANALYZE, 1);
        }
        match self.sql.execute(&self.target.database, VACUUM_ANALYZE_SQL).await {
            Ok(()) => RepairCheck::fixed(VACUUM_ANALYZE, 1),
            Err(e) => RepairCheck::failed(VACUUM_ANALYZE, 0, format!("failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::AlwaysYes;
    use crate::fakes::ScriptedConfirmer;
    use doctor_tools::fakes::{FakeDatabase, MemorySqlExecutor};

    fn target() -> PgConnection {
        PgConnection {
            host: "localhost".to_string(),
            port: 5432,
            user: "misskey".to_string(),
            password: None,
            database: "mk1".to_string(),
        }
    }

    fn clean_db() -> FakeDatabase {
        ORPHAN_RULES
            .iter()
            .fold(FakeDatabase::new(), |db, rule| db.with_count(rule.detect, 0))
    }

    fn apply() -> RunMode {
        RunMode {
            dry_run: false,
            force: true,
        }
    }

    fn dry_run() -> RunMode {
        RunMode {
            dry_run: true,
            force: false,
        }
    }

    fn completed(outcome: RepairOutcome) -> RepairReport {
        match outcome {
            RepairOutcome::Completed(report) => report,
            RepairOutcome::Cancelled => panic!("unexpected cancel"),
        }
    }

    #[test]
    fn test_scope_flags() {
        assert_eq!(RepairScope::from_flags(false, false, false).unwrap(), RepairScope::All);
        assert_eq!(RepairScope::from_flags(false, true, false).unwrap(), RepairScope::Reindex);
        assert!(RepairScope::from_flags(true, true, false).is_err());
        assert!(RepairScope::All.runs_orphans() && RepairScope::All.runs_vacuum());
        assert!(!RepairScope::Vacuum.runs_orphans());
        assert!(!RepairScope::Orphans.runs_reindex());
    }

    #[test]
    fn test_constructor_invariants() {
        let pending = RepairCheck::pending("x", 5);
        assert!(pending.skipped() && pending.fixed_count() == 0);
        let none = RepairCheck::pending("x", 0);
        assert!(!none.skipped() && none.fixed_count() == 0);
        let fixed = RepairCheck::fixed("x", 0);
        assert_eq!(fixed, RepairCheck::clean("x"));
        let failed = RepairCheck::failed("x", 3, "boom");
        assert_eq!(failed.fixed_count(), 0);
        assert!(!failed.skipped());
    }

    #[tokio::test]
    async fn test_clean_database_issues_no_deletes() {
        let sql = MemorySqlExecutor::new().with_database("mk1", clean_db());
        let engine = RepairEngine::new(&sql, target());
        let report = completed(engine.run(RepairScope::Orphans, apply(), &AlwaysYes).await);
        assert!(report.ok);
        assert_eq!(report.repairs.len(), 4);
        assert!(report.repairs.iter().all(|r| r.found() == 0 && !r.skipped()));
        assert!(sql.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_issues_no_mutations() {
        let db = clean_db().with_count(ORPHAN_RULES[0].detect, 5);
        let sql = MemorySqlExecutor::new().with_database("mk1", db);
        let engine = RepairEngine::new(&sql, target());
        let report = completed(engine.run(RepairScope::All, dry_run(), &AlwaysYes).await);
        assert!(report.dry_run);
        let names: Vec<&str> = report.repairs.iter().map(|r| r.name()).collect();
        assert_eq!(
            names,
            vec![
                "orphan_notes",
                "orphan_reactions",
                "orphan_notifications",
                "orphan_drive_files",
                "reindex",
                "vacuum_analyze",
            ]
        );
        let notes = &report.repairs[0];
        assert_eq!((notes.found(), notes.fixed_count(), notes.skipped()), (5, 0, true));
        let reindex = &report.repairs[4];
        assert_eq!((reindex.found(), reindex.skipped()), (1, true));
        assert!(sql.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_siblings() {
        let db = clean_db()
            .with_count(ORPHAN_RULES[1].detect, 2)
            .with_failure(ORPHAN_RULES[1].fix)
            .with_failure(ORPHAN_RULES[2].detect)
            .with_count(ORPHAN_RULES[3].detect, 4)
            .with_effect(ORPHAN_RULES[3].fix, ORPHAN_RULES[3].detect, 0);
        let sql = MemorySqlExecutor::new().with_database("mk1", db);
        let engine = RepairEngine::new(&sql, target());
        let report = completed(engine.run(RepairScope::Orphans, apply(), &AlwaysYes).await);
        assert!(!report.ok);
        assert_eq!(report.error_count(), 2);
        assert!(report.repairs[1].error().unwrap().starts_with("failed to delete"));
        assert_eq!(report.repairs[1].found(), 2);
        assert!(report.repairs[2].error().unwrap().starts_with("failed to count"));
        assert_eq!(report.repairs[3].fixed_count(), 4);
    }

    #[tokio::test]
    async fn test_reindex_falls_back_without_concurrently() {
        let db = FakeDatabase::new().with_failure(reindex_concurrently_sql("mk1"));
        let sql = MemorySqlExecutor::new().with_database("mk1", db);
        let engine = RepairEngine::new(&sql, target());
        let report = completed(engine.run(RepairScope::Reindex, apply(), &AlwaysYes).await);
        assert!(report.ok);
        assert_eq!(report.repairs[0].fixed_count(), 1);
        let statements: Vec<String> = sql.mutations().into_iter().map(|c| c.sql).collect();
        assert_eq!(
            statements,
            vec![
                "REINDEX DATABASE CONCURRENTLY \"mk1\"".to_string(),
                "REINDEX DATABASE \"mk1\"".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_vacuum_failure_reported() {
        let db = FakeDatabase::new().with_failure(VACUUM_ANALYZE_SQL);
        let sql = MemorySqlExecutor::new().with_database("mk1", db);
        let engine = RepairEngine::new(&sql, target());
        let report = completed(engine.run(RepairScope::Vacuum, apply(), &AlwaysYes).await);
        assert!(!report.ok);
        assert_eq!(report.repairs.len(), 1);
        assert!(report.repairs[0].error().unwrap().starts_with("failed:"));
    }

    #[tokio::test]
    async fn test_refused_confirmation_runs_nothing() {
        let sql = MemorySqlExecutor::new().with_database("mk1", clean_db());
        let engine = RepairEngine::new(&sql, target());
        let confirmer = ScriptedConfirmer::refusing();
        let outcome = engine.run(RepairScope::All, RunMode::default(), &confirmer).await;
        assert_eq!(outcome, RepairOutcome::Cancelled);
        assert!(sql.calls().is_empty());
        assert_eq!(confirmer.prompts().len(), 1);
        assert!(confirmer.prompts()[0].contains("'mk1'"));
    }

    #[tokio::test]
    async fn test_report_json_shape() {
        let report = RepairReport::new(
            true,
            vec![RepairCheck::pending("orphan_notes", 5), RepairCheck::clean("orphan_reactions")],
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["dryRun"], true);
        assert_eq!(json["repairs"][0]["found"], 5);
        assert_eq!(json["repairs"][0]["fixed"], 0);
        assert_eq!(json["repairs"][0]["skipped"], true);
        assert!(json["repairs"][0].get("error").is_none());
    }
}
