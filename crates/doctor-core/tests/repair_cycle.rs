//! Detect → fix → re-detect cycles against an in-memory database.

use doctor_core::repair::{reindex_concurrently_sql, VACUUM_ANALYZE_SQL};
use doctor_core::{
    AlwaysYes, DoctorConfig, RepairEngine, RepairOutcome, RepairReport, RepairScope, RunMode,
    ORPHAN_RULES,
};
use doctor_tools::fakes::{FakeDatabase, MemorySqlExecutor};

fn config() -> DoctorConfig {
    DoctorConfig::from_lookup(|_| None).unwrap()
}

/// `mk1` with five orphan notes and one orphan reaction; deletes clear them.
fn damaged() -> MemorySqlExecutor {
    let mut db = FakeDatabase::new();
    for rule in &ORPHAN_RULES {
        db = db.with_count(rule.detect, 0).with_effect(rule.fix, rule.detect, 0);
    }
    db = db
        .with_count(ORPHAN_RULES[0].detect, 5)
        .with_count(ORPHAN_RULES[1].detect, 1);
    MemorySqlExecutor::new().with_database("mk1", db)
}

fn report(outcome: RepairOutcome) -> RepairReport {
    match outcome {
        RepairOutcome::Completed(report) => report,
        RepairOutcome::Cancelled => panic!("repair was cancelled"),
    }
}

fn apply() -> RunMode {
    RunMode {
        dry_run: false,
        force: true,
    }
}

#[tokio::test]
async fn test_dry_run_then_apply_then_idempotent() {
    let sql = damaged();
    let engine = RepairEngine::new(&sql, config().database);

    let preview = report(
        engine
            .run(
                RepairScope::Orphans,
                RunMode {
                    dry_run: true,
                    force: false,
                },
                &AlwaysYes,
            )
            .await,
    );
    let notes = &preview.repairs[0];
    assert_eq!(notes.name(), "orphan_notes");
    assert_eq!((notes.found(), notes.fixed_count(), notes.skipped()), (5, 0, true));
    assert!(sql.mutations().is_empty(), "dry run must not mutate");

    let applied = report(engine.run(RepairScope::Orphans, apply(), &AlwaysYes).await);
    let notes = &applied.repairs[0];
    assert_eq!((notes.found(), notes.fixed_count(), notes.skipped()), (5, 5, false));
    assert_eq!(applied.total_found(), 6);
    assert_eq!(applied.total_fixed(), 6);
    assert!(applied.ok);
    assert_eq!(sql.mutations().len(), 2);

    let second = report(engine.run(RepairScope::Orphans, apply(), &AlwaysYes).await);
    assert!(second.repairs.iter().all(|r| r.found() == 0 && r.fixed_count() == 0));
    assert_eq!(sql.mutations().len(), 2, "second pass must not delete anything");
}

#[tokio::test]
async fn test_full_scope_runs_maintenance_last() {
    let sql = damaged();
    let engine = RepairEngine::new(&sql, config().database);

    let applied = report(engine.run(RepairScope::All, apply(), &AlwaysYes).await);

    assert!(applied.ok);
    assert!(!applied.dry_run);
    assert_eq!(applied.repairs.len(), 6);
    let statements: Vec<String> = sql.mutations().into_iter().map(|c| c.sql).collect();
    assert_eq!(
        &statements[statements.len() - 2..],
        &[reindex_concurrently_sql("mk1"), VACUUM_ANALYZE_SQL.to_string()]
    );
    for maintenance in &applied.repairs[4..] {
        assert_eq!((maintenance.found(), maintenance.fixed_count()), (1, 1));
    }
}

#[tokio::test]
async fn test_repair_targets_overridden_database() {
    let sql = MemorySqlExecutor::new().with_database("mk2", FakeDatabase::new());
    let engine = RepairEngine::new(&sql, config().with_database("mk2").database);

    let applied = report(engine.run(RepairScope::Vacuum, apply(), &AlwaysYes).await);

    assert!(applied.ok);
    assert!(sql.mutations().iter().all(|c| c.database == "mk2"));
}

#[tokio::test]
async fn test_missing_tables_are_reported_not_fatal() {
    let sql = MemorySqlExecutor::new().with_database("mk1", FakeDatabase::new());
    let engine = RepairEngine::new(&sql, config().database);

    let applied = report(engine.run(RepairScope::Orphans, apply(), &AlwaysYes).await);

    assert!(!applied.ok);
    assert_eq!(applied.repairs.len(), 4);
    assert_eq!(applied.error_count(), 4);
    assert!(sql.mutations().is_empty());
}
