//! yamisskey-doctor core library
//!
//! Diagnostics, backup lifecycle, integrity audit, and repair for a Misskey
//! instance. External systems are reached through capabilities so every
//! workflow can run against fakes:
//!
//! - [`Prober`]: health probes against the instance API and streaming endpoint
//! - [`StorageCatalog`]: list/fetch backup objects (`rclone`)
//! - [`Extractor`]: unpack archives (`7z`)
//! - [`doctor_tools::SqlExecutor`]: run SQL (`psql`)
//! - [`Confirmer`] / [`BackupChooser`]: operator interaction

pub mod archive;
pub mod audit;
pub mod config;
pub mod confirm;
pub mod error;
pub mod fakes;
pub mod health;
pub mod lifecycle;
pub mod preflight;
pub mod probe;
pub mod repair;
pub mod storage;
pub mod telemetry;

pub use archive::{dump_path_for, Extractor, SevenZipExtractor};
pub use audit::{integrity_ok, AuditReport, IntegrityAuditor, IntegrityCheck, CRITICAL_TABLES};
pub use config::{DoctorConfig, RunMode, StorageConfig, StorageKind, MAX_FETCH_RETRIES};
pub use confirm::{
    numbered_listing, parse_choice, AlwaysYes, BackupChooser, Choice, Confirmer, PromptStdin,
    StdinChooser,
};
pub use error::{DoctorError, ProbeError, Result};
pub use health::{
    classify, CheckReport, HealthStatus, HealthVerdict, ProbeKind, ProbePayload, ProbeResult,
    QUEUE_DELAYED_THRESHOLD,
};
pub use lifecycle::{
    scratch_database_name, Artifacts, BackupLifecycle, BackupSelector, PipelineStage, PlannedStep,
    RestoreOutcome, RestorePlan, Selection, VerifyReport,
};
pub use preflight::{preflight, PIPELINE_TOOLS, SQL_TOOLS};
pub use probe::{
    normalize_target, MetaInfo, ProbeClient, Prober, QueueInfo, ServerInfo, StatsInfo, StreamInfo,
};
pub use repair::{
    OrphanRule, RepairCheck, RepairEngine, RepairOutcome, RepairReport, RepairScope, ORPHAN_RULES,
};
pub use storage::{
    parse_listing, BackupObject, RcloneCatalog, RetryPolicy, StorageCatalog, MAX_BACKOFF,
};
pub use telemetry::{init_tracing, CommandSpan};
