//! Archive extraction.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use doctor_tools::ToolCommand;
use tracing::info;

use crate::error::{DoctorError, Result};
use crate::lifecycle::PipelineStage;

/// Unpacks a backup archive.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Unpack `archive` into its own directory and return the SQL dump path.
    async fn extract(&self, archive: &Path) -> Result<PathBuf>;
}

/// Dump path an archive unpacks to: the archive path minus `.7z`.
pub fn dump_path_for(archive: &Path) -> Result<PathBuf> {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DoctorError::stage(PipelineStage::Extracted, "archive has no file name"))?;
    let stem = name.strip_suffix(".7z").ok_or_else(|| {
        DoctorError::stage(
            PipelineStage::Extracted,
            format!("'{name}' is not a .7z archive"),
        )
    })?;
    Ok(archive.with_file_name(stem))
}

/// [`Extractor`] backed by `7z x`.
#[derive(Debug, Clone)]
pub struct SevenZipExtractor {
    timeout_secs: u64,
}

impl SevenZipExtractor {
    pub fn new() -> Self {
        Self { timeout_secs: 0 }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

impl Default for SevenZipExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extractor for SevenZipExtractor {
    async fn extract(&self, archive: &Path) -> Result<PathBuf> {
        let dump = dump_path_for(archive)?;
        let out_dir = archive.parent().unwrap_or_else(|| Path::new("."));
        info!(archive = %archive.display(), "Extracting");

        ToolCommand::new("7z")
            .arg("x")
            .arg("-y")
            .arg(format!("-o{}", out_dir.display()))
            .arg(archive.display().to_string())
            .timeout_secs(self.timeout_secs)
            .run_checked()
            .await
            .map_err(|e| DoctorError::at_stage(PipelineStage::Extracted, e))?;

        if !dump.is_file() {
            return Err(DoctorError::stage(
                PipelineStage::Extracted,
                format!("extracted SQL file not found: {}", dump.display()),
            ));
        }
        info!(dump = %dump.display(), "Extracted");
        Ok(dump)
    }
}
