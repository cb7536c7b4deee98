//! Process-scoped configuration.
//!
//! [`DoctorConfig`] is built once at startup from the environment (plus CLI
//! overrides) and passed by reference into every component. Nothing below
//! this module reads environment variables.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use doctor_tools::PgConnection;
use serde::{Deserialize, Serialize};

use crate::error::{DoctorError, Result};

/// Largest accepted `DOCTOR_FETCH_RETRIES`.
pub const MAX_FETCH_RETRIES: u32 = 10;

/// Remote backup storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Cloudflare R2 via the `r2` rclone remote.
    R2,
    /// Linode Object Storage via the `linode` rclone remote.
    Linode,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::R2 => "r2",
            StorageKind::Linode => "linode",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageKind {
    type Err = DoctorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "r2" => Ok(StorageKind::R2),
            "linode" => Ok(StorageKind::Linode),
            other => Err(DoctorError::Config(format!(
                "unknown storage type '{other}' (expected r2 or linode)"
            ))),
        }
    }
}

/// Where backups live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub kind: StorageKind,
    pub r2_prefix: String,
    pub linode_bucket: String,
    pub linode_prefix: String,
}

impl StorageConfig {
    /// rclone remote path of the backup directory.
    pub fn remote_root(&self) -> String {
        match self.kind {
            StorageKind::R2 => format!("r2:{}", self.r2_prefix),
            StorageKind::Linode => format!("linode:{}/{}", self.linode_bucket, self.linode_prefix),
        }
    }

    /// rclone remote path of one backup object.
    pub fn remote_object(&self, name: &str) -> String {
        format!("{}/{}", self.remote_root(), name)
    }
}

/// Everything a command needs to know about its environment.
#[derive(Debug, Clone)]
pub struct DoctorConfig {
    /// Admin token for authenticated probes (`MISSKEY_TOKEN`).
    pub token: Option<String>,
    pub storage: StorageConfig,
    pub database: PgConnection,
    /// Scratch directory for downloads and extracted dumps.
    pub work_dir: PathBuf,
    /// Deadline for each external tool call, 0 = none.
    pub tool_timeout_secs: u64,
    /// Extra attempts for transient storage transfer failures.
    pub fetch_retries: u32,
}

impl DoctorConfig {
    /// Build from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Only the probe credential. Other keys are not read, so a malformed
    /// database or storage setting cannot fail `check`.
    pub fn token_from_env() -> Option<String> {
        Self::token_from_lookup(|key| std::env::var(key).ok())
    }

    pub fn token_from_lookup<F>(lookup: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup("MISSKEY_TOKEN").filter(|v| !v.trim().is_empty())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let port = or("POSTGRES_PORT", "5432");
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| DoctorError::Config(format!("invalid POSTGRES_PORT '{port}'")))?;

        let parse_num = |key: &str, default: u64| -> Result<u64> {
            match get(key) {
                Some(v) => v
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| DoctorError::Config(format!("invalid {key} '{v}'"))),
                None => Ok(default),
            }
        };

        let fetch_retries = parse_num("DOCTOR_FETCH_RETRIES", 2)?;
        let fetch_retries = u32::try_from(fetch_retries)
            .ok()
            .filter(|n| *n <= MAX_FETCH_RETRIES)
            .ok_or_else(|| {
                DoctorError::Config(format!(
                    "DOCTOR_FETCH_RETRIES must be at most {MAX_FETCH_RETRIES}, got {fetch_retries}"
                ))
            })?;

        Ok(Self {
            token: Self::token_from_lookup(&lookup),
            storage: StorageConfig {
                kind: or("STORAGE_TYPE", "r2").parse()?,
                r2_prefix: or("R2_PREFIX", "backups"),
                linode_bucket: or("LINODE_BUCKET", "yamisskey-backup"),
                linode_prefix: or("LINODE_PREFIX", "backups"),
            },
            database: PgConnection {
                host: or("POSTGRES_HOST", "localhost"),
                port,
                user: or("POSTGRES_USER", "misskey"),
                password: get("PGPASSWORD"),
                database: or("POSTGRES_DB", "mk1"),
            },
            work_dir: PathBuf::from(or("WORK_DIR", "/tmp/yamisskey-restore")),
            tool_timeout_secs: parse_num("DOCTOR_TOOL_TIMEOUT", 0)?,
            fetch_retries,
        })
    }

    pub fn with_storage(mut self, kind: StorageKind) -> Self {
        self.storage.kind = kind;
        self
    }

    pub fn with_database(mut self, name: impl Into<String>) -> Self {
        self.database.database = name.into();
        self
    }
}

/// Detect-vs-apply switches for one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunMode {
    /// Report what would happen; issue no mutating call.
    pub dry_run: bool,
    /// Skip the interactive confirmation.
    pub force: bool,
}

impl RunMode {
    /// Whether a destructive step needs an interactive "yes" first.
    pub fn needs_confirmation(&self) -> bool {
        !self.force && !self.dry_run
    }
}
