//! Backup lifecycle: select → fetch → extract → restore → verify.
//!
//! A session walks [`PipelineStage`]s in order. Every temporary artifact is
//! registered before the step that creates it and released on every exit
//! path: files through [`Artifacts`] (dropped at scope end), the scratch
//! database through an explicit drop after the guarded steps complete.

use std::fmt;
use std::path::{Path, PathBuf};

use doctor_tools::{PgConnection, ScriptMode, SqlExecutor};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::archive::{dump_path_for, Extractor};
use crate::audit::{AuditReport, IntegrityAuditor, IntegrityCheck};
use crate::config::{DoctorConfig, RunMode};
use crate::confirm::{BackupChooser, Choice, Confirmer};
use crate::error::{DoctorError, Result};
use crate::storage::{BackupObject, StorageCatalog};

/// Prefix of every scratch database name.
pub const SCRATCH_PREFIX: &str = "yamisskey_verify_";

/// Pipeline progress markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Downloaded,
    Extracted,
    Restored,
    Verified,
}

impl PipelineStage {
    /// Verb naming the step that produces this stage.
    pub fn step(&self) -> &'static str {
        match self {
            PipelineStage::Downloaded => "download",
            PipelineStage::Extracted => "extract",
            PipelineStage::Restored => "restore",
            PipelineStage::Verified => "verify",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.step())
    }
}

// ---------------------------------------------------------------------------
// Artifact release
// ---------------------------------------------------------------------------

/// Files owned by one session; all are removed when this is dropped.
#[derive(Debug, Default)]
pub struct Artifacts {
    paths: Vec<PathBuf>,
}

impl Artifacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `path`, which may not exist yet.
    pub fn register(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Drop for Artifacts {
    fn drop(&mut self) {
        for path in self.paths.drain(..).rev() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed artifact"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Could not remove artifact"),
            }
        }
    }
}

/// `yamisskey_verify_<unix seconds>_<8 hex>`, unique per invocation.
pub fn scratch_database_name() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{SCRATCH_PREFIX}{}_{}",
        chrono::Utc::now().timestamp(),
        &suffix[..8]
    )
}

/// Reject names that could escape the work directory.
pub fn validate_backup_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name == "."
        || name == ".."
    {
        return Err(DoctorError::InvalidSelection(format!(
            "'{name}' is not a backup object name"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// How the backup to operate on is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupSelector {
    /// Exact object name; no listing needed.
    Named(String),
    /// Newest listed backup.
    Latest,
    /// Ask the operator.
    Interactive,
}

/// Result of resolving a [`BackupSelector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Chosen(String),
    /// The operator backed out.
    Cancelled,
    /// The store holds no backups.
    NoBackups,
}

// ---------------------------------------------------------------------------
// Restore
// ---------------------------------------------------------------------------

/// One step a dry-run restore would execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    pub stage: PipelineStage,
    pub label: &'static str,
    pub subject: String,
}

/// Ordered steps a restore would run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestorePlan {
    pub backup: String,
    pub steps: Vec<PlannedStep>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Dry run: nothing fetched, nothing touched.
    Planned(RestorePlan),
    /// Confirmation refused; no side effects.
    Cancelled,
    Completed { backup: String, target: String },
}

// ---------------------------------------------------------------------------
// Verify
// ---------------------------------------------------------------------------

/// Outcome of a verify session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub backup_file: String,
    pub ok: bool,
    pub download_ok: bool,
    pub extract_ok: bool,
    pub restore_ok: bool,
    pub integrity_ok: bool,
    pub tables: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checks: Vec<IntegrityCheck>,
    /// Scratch database used for the restore.
    #[serde(skip)]
    pub scratch_database: Option<String>,
    /// Furthest stage reached.
    #[serde(skip)]
    pub reached: Option<PipelineStage>,
    /// Stage whose step failed, if any.
    #[serde(skip)]
    pub failed_at: Option<PipelineStage>,
}

impl VerifyReport {
    fn new(backup_file: impl Into<String>) -> Self {
        Self {
            backup_file: backup_file.into(),
            ok: false,
            download_ok: false,
            extract_ok: false,
            restore_ok: false,
            integrity_ok: false,
            tables: 0,
            error: None,
            checks: Vec::new(),
            scratch_database: None,
            reached: None,
            failed_at: None,
        }
    }

    fn advance(&mut self, stage: PipelineStage) {
        match stage {
            PipelineStage::Downloaded => self.download_ok = true,
            PipelineStage::Extracted => self.extract_ok = true,
            PipelineStage::Restored => self.restore_ok = true,
            PipelineStage::Verified => {}
        }
        self.reached = Some(stage);
        info!(backup = %self.backup_file, stage = %stage, "Stage complete");
    }

    fn fail(mut self, stage: PipelineStage, err: DoctorError) -> Self {
        let message = match err {
            DoctorError::StageFailed { .. } => err.to_string(),
            other => format!("{stage} failed: {other}"),
        };
        warn!(
            backup = %self.backup_file,
            stage = %stage,
            error = %message,
            "Verification step failed"
        );
        self.failed_at = Some(stage);
        self.error = Some(message);
        self.ok = false;
        self
    }

    fn complete(mut self, audit: AuditReport) -> Self {
        self.integrity_ok = audit.integrity_ok();
        self.tables = audit.table_count;
        self.checks = audit.checks;
        self.advance(PipelineStage::Verified);
        self.ok = self.download_ok && self.extract_ok && self.restore_ok && self.integrity_ok;
        self
    }
}

// ---------------------------------------------------------------------------
// BackupLifecycle
// ---------------------------------------------------------------------------

/// Drives restore and verify sessions over the storage, archive, and SQL
/// capabilities.
pub struct BackupLifecycle<'a> {
    catalog: &'a dyn StorageCatalog,
    extractor: &'a dyn Extractor,
    sql: &'a dyn SqlExecutor,
    work_dir: PathBuf,
    target: PgConnection,
}

impl<'a> BackupLifecycle<'a> {
    pub fn new(
        catalog: &'a dyn StorageCatalog,
        extractor: &'a dyn Extractor,
        sql: &'a dyn SqlExecutor,
        config: &DoctorConfig,
    ) -> Self {
        Self {
            catalog,
            extractor,
            sql,
            work_dir: config.work_dir.clone(),
            target: config.database.clone(),
        }
    }

    pub async fn list(&self) -> Result<Vec<BackupObject>> {
        self.catalog.list().await
    }

    /// Resolve `selector` to one backup name. Only lists when it must.
    pub async fn select(
        &self,
        selector: &BackupSelector,
        chooser: &dyn BackupChooser,
    ) -> Result<Selection> {
        let backups = match selector {
            BackupSelector::Named(name) => {
                validate_backup_name(name)?;
                return Ok(Selection::Chosen(name.clone()));
            }
            BackupSelector::Latest | BackupSelector::Interactive => self.list().await?,
        };
        if backups.is_empty() {
            return Ok(Selection::NoBackups);
        }
        match selector {
            BackupSelector::Latest => {
                info!(backup = %backups[0].name, "Selected latest backup");
                Ok(Selection::Chosen(backups[0].name.clone()))
            }
            _ => match chooser.choose(&backups).await? {
                Choice::Selected(name) => Ok(Selection::Chosen(name)),
                Choice::Cancelled => Ok(Selection::Cancelled),
            },
        }
    }

    /// The steps a restore of `backup` would execute.
    pub fn plan_restore(&self, backup: &str) -> RestorePlan {
        RestorePlan {
            backup: backup.to_string(),
            steps: vec![
                PlannedStep {
                    stage: PipelineStage::Downloaded,
                    label: "Download",
                    subject: backup.to_string(),
                },
                PlannedStep {
                    stage: PipelineStage::Extracted,
                    label: "Extract",
                    subject: backup.strip_suffix(".7z").unwrap_or(backup).to_string(),
                },
                PlannedStep {
                    stage: PipelineStage::Restored,
                    label: "Restore to",
                    subject: self.target.describe(),
                },
            ],
        }
    }

    fn restore_warning(&self, backup: &str) -> String {
        format!(
            "WARNING: This will restore backup to database '{}'\n   Backup: {}\n   Host: {}:{}",
            self.target.database, backup, self.target.host, self.target.port
        )
    }

    /// Restore `backup` into the configured target database.
    pub async fn restore(
        &self,
        backup: &str,
        mode: RunMode,
        confirmer: &dyn Confirmer,
    ) -> Result<RestoreOutcome> {
        validate_backup_name(backup)?;
        if mode.dry_run {
            return Ok(RestoreOutcome::Planned(self.plan_restore(backup)));
        }
        if mode.needs_confirmation() && !confirmer.confirm(&self.restore_warning(backup)).await {
            info!(backup = %backup, "Restore cancelled");
            return Ok(RestoreOutcome::Cancelled);
        }

        let mut artifacts = Artifacts::new();
        let dump = self.fetch_and_extract(backup, &mut artifacts).await?;

        info!(target = %self.target.describe(), "Restoring");
        self.sql
            .apply_script(&self.target.database, &dump, ScriptMode::Lenient)
            .await
            .map_err(|e| DoctorError::at_stage(PipelineStage::Restored, e))?;
        info!(backup = %backup, target = %self.target.describe(), "Restore complete");

        Ok(RestoreOutcome::Completed {
            backup: backup.to_string(),
            target: self.target.describe(),
        })
    }

    async fn fetch_and_extract(&self, backup: &str, artifacts: &mut Artifacts) -> Result<PathBuf> {
        let expected = self.work_dir.join(backup);
        artifacts.register(&expected);
        let archive = self.catalog.fetch(backup, &self.work_dir).await?;
        artifacts.register(&archive);
        info!(archive = %archive.display(), "Downloaded");

        let dump = dump_path_for(&archive)?;
        artifacts.register(&dump);
        self.extractor.extract(&archive).await
    }

    /// Fetch, extract, restore into a scratch database, and audit it.
    ///
    /// Failures are reported inside the returned [`VerifyReport`].
    pub async fn verify(&self, backup: &str) -> VerifyReport {
        let mut report = VerifyReport::new(backup);
        if let Err(e) = validate_backup_name(backup) {
            return report.fail(PipelineStage::Downloaded, e);
        }

        let mut artifacts = Artifacts::new();
        artifacts.register(self.work_dir.join(backup));
        let archive = match self.catalog.fetch(backup, &self.work_dir).await {
            Ok(path) => path,
            Err(e) => return report.fail(PipelineStage::Downloaded, e),
        };
        artifacts.register(&archive);
        report.advance(PipelineStage::Downloaded);

        match dump_path_for(&archive) {
            Ok(dump) => artifacts.register(dump),
            Err(e) => return report.fail(PipelineStage::Extracted, e),
        }
        let dump = match self.extractor.extract(&archive).await {
            Ok(path) => path,
            Err(e) => return report.fail(PipelineStage::Extracted, e),
        };
        artifacts.register(&dump);
        report.advance(PipelineStage::Extracted);

        self.verify_dump(&dump, report).await
    }

    /// Verify a SQL dump already on disk. The file is left in place.
    pub async fn verify_local(&self, dump: &Path) -> Result<VerifyReport> {
        if !dump.is_file() {
            return Err(DoctorError::NotFound(dump.display().to_string()));
        }
        let mut report = VerifyReport::new(dump.display().to_string());
        report.download_ok = true;
        report.extract_ok = true;
        Ok(self.verify_dump(dump, report).await)
    }

    async fn verify_dump(&self, dump: &Path, mut report: VerifyReport) -> VerifyReport {
        let scratch = scratch_database_name();
        report.scratch_database = Some(scratch.clone());
        info!(scratch = %scratch, dump = %dump.display(), "Restoring into scratch database");

        let restored: Result<AuditReport> = async {
            self.sql
                .create_database(&scratch)
                .await
                .map_err(|e| DoctorError::at_stage(PipelineStage::Restored, e))?;
            self.sql
                .apply_script(&scratch, dump, ScriptMode::Strict)
                .await
                .map_err(|e| DoctorError::at_stage(PipelineStage::Restored, e))?;
            Ok(IntegrityAuditor::new(self.sql).audit(&scratch).await)
        }
        .await;

        self.release_scratch(&scratch).await;

        match restored {
            Ok(audit) => {
                report.advance(PipelineStage::Restored);
                report.complete(audit)
            }
            Err(e) => report.fail(PipelineStage::Restored, e),
        }
    }

    async fn release_scratch(&self, name: &str) {
        info!(scratch = %name, "Dropping scratch database");
        if let Err(e) = self.sql.drop_database(name).await {
            warn!(scratch = %name, error = %e, "Could not drop scratch database");
        }
    }
}
