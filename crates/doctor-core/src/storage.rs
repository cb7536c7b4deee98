//! Remote backup catalog.
//!
//! [`StorageCatalog`] lists and fetches backup archives by name.
//! [`RcloneCatalog`] implements it with `rclone` against the configured
//! remote (`r2:<prefix>` or `linode:<bucket>/<prefix>`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use doctor_tools::{ToolCommand, ToolError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::{DoctorError, Result};

/// Suffix every backup archive carries.
pub const BACKUP_SUFFIX: &str = ".sql.7z";

/// One listed backup archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupObject {
    /// Object name, e.g. `mk1_2025-01-01_03-00.sql.7z`. Sorts chronologically.
    pub name: String,
    /// Size reported by the store, in bytes.
    pub size: u64,
}

/// Listing and fetching of backup objects.
#[async_trait]
pub trait StorageCatalog: Send + Sync {
    /// Backups sorted by name, newest first.
    async fn list(&self) -> Result<Vec<BackupObject>>;

    /// Download `name` into `dest_dir` and return the local path.
    ///
    /// Never returns a path to a partial file.
    async fn fetch(&self, name: &str, dest_dir: &Path) -> Result<PathBuf>;
}

/// Parse `rclone ls` output (`<size> <path>` per line) into newest-first backups.
pub fn parse_listing(output: &str) -> Vec<BackupObject> {
    let mut backups: Vec<BackupObject> = output
        .lines()
        .filter_map(|line| {
            let (size, name) = line.trim().split_once(char::is_whitespace)?;
            let name = name.trim();
            if !name.ends_with(BACKUP_SUFFIX) {
                return None;
            }
            Some(BackupObject {
                name: name.to_string(),
                size: size.parse().unwrap_or(0),
            })
        })
        .collect();
    backups.sort_by(|a, b| b.name.cmp(&a.name));
    backups
}

/// Retry settings for transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first (0 = run once).
    pub max_retries: u32,
    /// Base delay for exponential backoff (milliseconds).
    pub backoff_base_ms: u64,
}

/// Longest single wait between transfer attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at [`MAX_BACKOFF`].
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor)).min(MAX_BACKOFF)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 500,
        }
    }
}

/// [`StorageCatalog`] backed by the `rclone` CLI.
#[derive(Debug, Clone)]
pub struct RcloneCatalog {
    storage: StorageConfig,
    program: Vec<String>,
    timeout_secs: u64,
    retry: RetryPolicy,
}

impl RcloneCatalog {
    pub fn new(storage: StorageConfig) -> Self {
        Self {
            storage,
            program: vec!["rclone".to_string()],
            timeout_secs: 0,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the `rclone` invocation, e.g. `["sh", "fake-rclone.sh"]`.
    pub fn with_program<I, S>(mut self, program: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let program: Vec<String> = program.into_iter().map(Into::into).collect();
        if !program.is_empty() {
            self.program = program;
        }
        self
    }

    fn command(&self) -> ToolCommand {
        let mut parts = self.program.iter();
        let program = parts.next().map(String::as_str).unwrap_or("rclone");
        ToolCommand::new(program)
            .args(parts.cloned())
            .timeout_secs(self.timeout_secs)
    }

    async fn copy_once(&self, name: &str, dest_dir: &Path) -> std::result::Result<(), ToolError> {
        self.command()
            .arg("copy")
            .arg(self.storage.remote_object(name))
            .arg(dest_dir.display().to_string())
            .run_checked()
            .await
            .map(|_| ())
    }
}

fn looks_missing(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    lower.contains("not found")
        || lower.contains("doesn't exist")
        || lower.contains("does not exist")
}

fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove partial download"),
    }
}

#[async_trait]
impl StorageCatalog for RcloneCatalog {
    async fn list(&self) -> Result<Vec<BackupObject>> {
        let remote = self.storage.remote_root();
        info!(remote = %remote, "Listing backups");
        let output = self
            .command()
            .arg("ls")
            .arg(&remote)
            .run_checked()
            .await
            .map_err(|e| match e {
                ToolError::ToolMissing(tool) => DoctorError::ToolMissing(tool),
                other => DoctorError::Unreachable(format!("{remote}: {other}")),
            })?;
        Ok(parse_listing(&output.stdout))
    }

    async fn fetch(&self, name: &str, dest_dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let local = dest_dir.join(name);
        let max_attempts = self.retry.max_retries.saturating_add(1);

        for attempt in 1..=max_attempts {
            info!(backup = %name, attempt, "Downloading backup");
            match self.copy_once(name, dest_dir).await {
                Ok(()) if local.is_file() => {
                    info!(path = %local.display(), "Downloaded");
                    return Ok(local);
                }
                Ok(()) => {
                    remove_partial(&local);
                    return Err(DoctorError::NotFound(name.to_string()));
                }
                Err(ToolError::ToolMissing(tool)) => return Err(DoctorError::ToolMissing(tool)),
                Err(ToolError::Failed { output, .. }) if looks_missing(&output) => {
                    remove_partial(&local);
                    return Err(DoctorError::NotFound(name.to_string()));
                }
                Err(e) => {
                    remove_partial(&local);
                    if attempt == max_attempts {
                        return Err(DoctorError::TransferFailed {
                            name: name.to_string(),
                            message: e.to_string(),
                        });
                    }
                    let delay = self.retry.delay(attempt);
                    warn!(backup = %name, attempt, error = %e, ?delay, "Transfer failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(DoctorError::TransferFailed {
            name: name.to_string(),
            message: "exhausted all attempts".to_string(),
        })
    }
}
