//! External tool preflight.
//!
//! Each command checks for the tools it needs before doing anything, so a
//! missing binary fails the run up front instead of halfway through a
//! pipeline.

use doctor_tools::ensure_available;

use crate::error::Result;

/// Tools for restore and remote verify.
pub const PIPELINE_TOOLS: [&str; 3] = ["rclone", "7z", "psql"];

/// Tools for local verify and repair.
pub const SQL_TOOLS: [&str; 1] = ["psql"];

/// Fail with [`crate::DoctorError::ToolMissing`] for the first tool not on `PATH`.
pub fn preflight(tools: &[&str]) -> Result<()> {
    ensure_available(tools)?;
    Ok(())
}
