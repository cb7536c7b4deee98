//! yamisskey-doctor - diagnostics and backup tooling for a Misskey instance
//!
//! ## Commands
//!
//! - `check`: probe a running instance and classify its health
//! - `restore`: download, extract and restore a backup into the database
//! - `verify`: restore a backup into a scratch database and audit it
//! - `repair`: fix orphan records, rebuild indexes, vacuum

mod render;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use doctor_core::{
    classify, preflight, AlwaysYes, BackupLifecycle, BackupSelector, CheckReport, CommandSpan,
    Confirmer, DoctorConfig, DoctorError, ProbeClient, PromptStdin, RcloneCatalog, RepairEngine,
    RepairOutcome, RepairScope, RestoreOutcome, RetryPolicy, RunMode, Selection,
    SevenZipExtractor, StdinChooser, StorageKind, PIPELINE_TOOLS, SQL_TOOLS,
};
use doctor_tools::PsqlExecutor;
use serde::Serialize;
use tracing::{debug, Level};

#[derive(Parser)]
#[command(name = "yamisskey-doctor")]
#[command(author = "yamisskey")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Health checks, backup restore/verify and repair for Misskey", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe a Misskey instance (exit 0 healthy, 1 degraded, 2 unhealthy)
    Check {
        /// Instance URL; `https://` is assumed without a scheme
        target: String,

        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,

        /// Overall probe deadline in seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,

        /// Print nothing; only the exit code reports health
        #[arg(short, long)]
        quiet: bool,
    },

    /// Restore a backup into the configured database
    Restore {
        /// List available backups
        #[arg(short, long)]
        list: bool,

        /// Restore the latest backup
        #[arg(long, conflicts_with = "file")]
        latest: bool,

        /// Storage backend: r2 or linode
        #[arg(short, long)]
        storage: Option<StorageKind>,

        /// Specific backup file to restore
        #[arg(short, long)]
        file: Option<String>,

        /// Target database name
        #[arg(short, long)]
        database: Option<String>,

        /// Show what would be done without executing
        #[arg(long)]
        dry_run: bool,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Verify that a backup can be restored
    Verify {
        /// List available backups
        #[arg(short, long)]
        list: bool,

        /// Verify the latest backup
        #[arg(long, conflicts_with = "file")]
        latest: bool,

        /// Storage backend: r2 or linode
        #[arg(short, long)]
        storage: Option<StorageKind>,

        /// Specific backup file to verify
        #[arg(short, long)]
        file: Option<String>,

        /// Verify a local SQL file (skip download and extract)
        #[arg(long, conflicts_with_all = ["list", "latest", "file", "storage"])]
        local: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Repair orphan records, rebuild indexes and vacuum
    Repair {
        /// Report issues without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,

        /// Target database name
        #[arg(short, long)]
        database: Option<String>,

        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,

        /// Only repair orphan records
        #[arg(long, conflicts_with_all = ["reindex", "vacuum"])]
        orphans: bool,

        /// Only rebuild indexes
        #[arg(long, conflicts_with = "vacuum")]
        reindex: bool,

        /// Only run VACUUM ANALYZE
        #[arg(long)]
        vacuum: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let quiet = matches!(cli.command, Commands::Check { quiet: true, .. });
    let level = if cli.verbose {
        Level::DEBUG
    } else if quiet {
        Level::ERROR
    } else {
        Level::INFO
    };
    doctor_core::init_tracing(cli.log_json, level);

    match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(failure_code(&err))
        }
    }
}

/// Configuration problems are usage errors (2); everything else is 1.
fn failure_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<DoctorError>() {
        Some(DoctorError::Config(_)) => 2,
        _ => 1,
    }
}

fn exit_on(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn load_config(storage: Option<StorageKind>, database: Option<String>) -> Result<DoctorConfig> {
    let mut config = DoctorConfig::from_env().context("Invalid configuration")?;
    if let Some(kind) = storage {
        config = config.with_storage(kind);
    }
    if let Some(name) = database {
        config = config.with_database(name);
    }
    Ok(config)
}

fn selector(file: Option<String>, latest: bool) -> BackupSelector {
    match (file, latest) {
        (Some(name), _) => BackupSelector::Named(name),
        (None, true) => BackupSelector::Latest,
        (None, false) => BackupSelector::Interactive,
    }
}

fn confirmer(force: bool) -> Box<dyn Confirmer> {
    if force {
        Box::new(AlwaysYes)
    } else {
        Box::new(PromptStdin)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to encode JSON output")?
    );
    Ok(())
}

/// Remote pipeline capabilities built from one configuration.
struct Pipeline {
    catalog: RcloneCatalog,
    extractor: SevenZipExtractor,
    sql: PsqlExecutor,
}

impl Pipeline {
    fn new(config: &DoctorConfig) -> Self {
        let retry = RetryPolicy {
            max_retries: config.fetch_retries,
            ..RetryPolicy::default()
        };
        Self {
            catalog: RcloneCatalog::new(config.storage.clone())
                .with_timeout_secs(config.tool_timeout_secs)
                .with_retry(retry),
            extractor: SevenZipExtractor::new().with_timeout_secs(config.tool_timeout_secs),
            sql: PsqlExecutor::new(config.database.clone())
                .with_timeout_secs(config.tool_timeout_secs),
        }
    }

    fn lifecycle<'a>(&'a self, config: &DoctorConfig) -> BackupLifecycle<'a> {
        BackupLifecycle::new(&self.catalog, &self.extractor, &self.sql, config)
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Check {
            target,
            format,
            timeout,
            quiet,
        } => {
            let _span = CommandSpan::enter("check");
            cmd_check(&target, format, timeout, quiet).await
        }
        Commands::Restore {
            list,
            latest,
            storage,
            file,
            database,
            dry_run,
            force,
        } => {
            let _span = CommandSpan::enter("restore");
            let config = load_config(storage, database)?;
            cmd_restore(
                &config,
                list,
                selector(file, latest),
                RunMode { dry_run, force },
            )
            .await
        }
        Commands::Verify {
            list,
            latest,
            storage,
            file,
            local,
            format,
        } => {
            let _span = CommandSpan::enter("verify");
            let config = load_config(storage, None)?;
            match local {
                Some(path) => cmd_verify_local(&config, &path, format).await,
                None => cmd_verify(&config, list, selector(file, latest), format).await,
            }
        }
        Commands::Repair {
            dry_run,
            force,
            database,
            format,
            orphans,
            reindex,
            vacuum,
        } => {
            let _span = CommandSpan::enter("repair");
            let config = load_config(None, database)?;
            let scope = RepairScope::from_flags(orphans, reindex, vacuum)?;
            cmd_repair(&config, scope, RunMode { dry_run, force }, format).await
        }
    }
}

async fn cmd_check(target: &str, format: Format, timeout: u64, quiet: bool) -> Result<ExitCode> {
    let token = DoctorConfig::token_from_env();
    let client = ProbeClient::new(target)?;
    debug!(target = %client.target(), timeout, "Probing instance");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout);
    let verdict = classify(&client, token.as_deref(), deadline).await;
    let report = CheckReport::from(&verdict);

    if !quiet {
        match format {
            Format::Json => print_json(&report)?,
            Format::Text => print!("{}", render::check_text(&report)),
        }
    }
    Ok(ExitCode::from(verdict.status().exit_code()))
}

async fn cmd_restore(
    config: &DoctorConfig,
    list: bool,
    selector: BackupSelector,
    mode: RunMode,
) -> Result<ExitCode> {
    preflight(&PIPELINE_TOOLS)?;
    let pipeline = Pipeline::new(config);
    let lifecycle = pipeline.lifecycle(config);

    if list {
        let backups = lifecycle
            .list()
            .await
            .with_context(|| format!("Failed to list backups from {}", config.storage.kind))?;
        print!("{}", render::backup_listing(&backups));
        return Ok(ExitCode::SUCCESS);
    }

    let backup = match lifecycle.select(&selector, &StdinChooser).await? {
        Selection::Chosen(name) => name,
        Selection::Cancelled => {
            println!("Cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
        Selection::NoBackups => {
            println!("No backups found.");
            return Ok(ExitCode::SUCCESS);
        }
    };

    let confirmer = confirmer(mode.force);
    let outcome = lifecycle
        .restore(&backup, mode, confirmer.as_ref())
        .await
        .with_context(|| format!("Restore of {backup} failed"))?;
    match outcome {
        RestoreOutcome::Planned(plan) => print!("{}", render::restore_plan(&plan)),
        RestoreOutcome::Cancelled => println!("Cancelled."),
        RestoreOutcome::Completed { backup, target } => {
            println!("Restore completed successfully: {backup} -> {target}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_verify(
    config: &DoctorConfig,
    list: bool,
    selector: BackupSelector,
    format: Format,
) -> Result<ExitCode> {
    preflight(&PIPELINE_TOOLS)?;
    let pipeline = Pipeline::new(config);
    let lifecycle = pipeline.lifecycle(config);

    if list {
        let backups = lifecycle
            .list()
            .await
            .with_context(|| format!("Failed to list backups from {}", config.storage.kind))?;
        match format {
            Format::Json => print_json(&backups)?,
            Format::Text => print!("{}", render::backup_listing(&backups)),
        }
        return Ok(ExitCode::SUCCESS);
    }

    let backup = match lifecycle.select(&selector, &StdinChooser).await? {
        Selection::Chosen(name) => name,
        Selection::Cancelled => {
            println!("Cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
        Selection::NoBackups => {
            println!("No backups found.");
            return Ok(ExitCode::SUCCESS);
        }
    };

    let report = lifecycle.verify(&backup).await;
    match format {
        Format::Json => print_json(&report)?,
        Format::Text => print!("{}", render::verify_text(&report)),
    }
    Ok(exit_on(report.ok))
}

async fn cmd_verify_local(
    config: &DoctorConfig,
    path: &std::path::Path,
    format: Format,
) -> Result<ExitCode> {
    preflight(&SQL_TOOLS)?;
    let pipeline = Pipeline::new(config);
    let report = pipeline.lifecycle(config).verify_local(path).await?;
    match format {
        Format::Json => print_json(&report)?,
        Format::Text => print!("{}", render::verify_text(&report)),
    }
    Ok(exit_on(report.ok))
}

async fn cmd_repair(
    config: &DoctorConfig,
    scope: RepairScope,
    mode: RunMode,
    format: Format,
) -> Result<ExitCode> {
    preflight(&SQL_TOOLS)?;
    let sql =
        PsqlExecutor::new(config.database.clone()).with_timeout_secs(config.tool_timeout_secs);
    let engine = RepairEngine::new(&sql, config.database.clone());

    let confirmer = confirmer(mode.force);
    match engine.run(scope, mode, confirmer.as_ref()).await {
        RepairOutcome::Cancelled => {
            println!("Cancelled.");
            Ok(ExitCode::SUCCESS)
        }
        RepairOutcome::Completed(report) => {
            match format {
                Format::Json => print_json(&report)?,
                Format::Text => print!("{}", render::repair_text(&report)),
            }
            Ok(exit_on(report.ok))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn parse(args: &[&str]) -> std::result::Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("yamisskey-doctor").chain(args.iter().copied()))
    }

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_check_defaults() {
        let cli = parse(&["check", "misskey.example"]).unwrap();
        match cli.command {
            Commands::Check {
                target,
                format,
                timeout,
                quiet,
            } => {
                assert_eq!(target, "misskey.example");
                assert_eq!(format, Format::Text);
                assert_eq!(timeout, 5);
                assert!(!quiet);
            }
            _ => panic!("expected check"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = parse(&["check", "x", "--verbose", "--log-json"]).unwrap();
        assert!(cli.verbose);
        assert!(cli.log_json);
    }

    #[test]
    fn test_check_requires_target() {
        let err = parse(&["check"]).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_restore_flags() {
        let cli = parse(&[
            "restore", "-s", "linode", "-f", "mk1.sql.7z", "-d", "mk2", "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Restore {
                storage,
                file,
                database,
                dry_run,
                force,
                ..
            } => {
                assert_eq!(storage, Some(StorageKind::Linode));
                assert_eq!(file.as_deref(), Some("mk1.sql.7z"));
                assert_eq!(database.as_deref(), Some("mk2"));
                assert!(dry_run);
                assert!(!force);
            }
            _ => panic!("expected restore"),
        }
    }

    #[test]
    fn test_unknown_storage_is_usage_error() {
        let err = parse(&["restore", "--storage", "s3"]).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_latest_conflicts_with_file() {
        let err = parse(&["verify", "--latest", "--file", "a.sql.7z"]).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_local_conflicts_with_remote_selection() {
        assert!(parse(&["verify", "--local", "/tmp/a.sql", "--latest"]).is_err());
        let cli = parse(&["verify", "--local", "/tmp/a.sql", "--format", "json"]).unwrap();
        match cli.command {
            Commands::Verify { local, format, .. } => {
                assert_eq!(local, Some(PathBuf::from("/tmp/a.sql")));
                assert_eq!(format, Format::Json);
            }
            _ => panic!("expected verify"),
        }
    }

    #[test]
    fn test_repair_scopes_are_exclusive() {
        for pair in [
            ["--orphans", "--reindex"],
            ["--orphans", "--vacuum"],
            ["--reindex", "--vacuum"],
        ] {
            let err = parse(&["repair", pair[0], pair[1]]).err().unwrap();
            assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
        }
        assert!(parse(&["repair", "--vacuum", "--dry-run"]).is_ok());
    }

    #[test]
    fn test_selector_precedence() {
        assert_eq!(
            selector(Some("a.sql.7z".to_string()), false),
            BackupSelector::Named("a.sql.7z".to_string())
        );
        assert_eq!(selector(None, true), BackupSelector::Latest);
        assert_eq!(selector(None, false), BackupSelector::Interactive);
    }

    #[test]
    fn test_config_errors_exit_with_usage_code() {
        let err = anyhow::Error::new(DoctorError::Config("bad port".to_string()))
            .context("Invalid configuration");
        assert_eq!(failure_code(&err), 2);
        let err = anyhow::Error::new(DoctorError::NotFound("a.sql".to_string()));
        assert_eq!(failure_code(&err), 1);
    }
}
