//! Error taxonomy for yamisskey-doctor.
//!
//! Probe-level failures ([`ProbeError`]) never escape the health classifier;
//! they become verdict degradation. Everything else surfaces as
//! [`DoctorError`] at the command boundary.

use doctor_tools::ToolError;

use crate::lifecycle::PipelineStage;

/// Failure of one health probe.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    /// Transport failure or deadline exceeded before a response arrived.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The peer answered with a non-200 status.
    #[error("unexpected status {0}")]
    BadStatus(u16),

    /// The peer answered 200 but the body could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for ProbeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProbeError::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            ProbeError::BadStatus(status.as_u16())
        } else {
            ProbeError::Unreachable(err.to_string())
        }
    }
}

/// Command-level errors.
#[derive(Debug, thiserror::Error)]
pub enum DoctorError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("required tool '{0}' not found in PATH")]
    ToolMissing(String),

    #[error("storage unreachable: {0}")]
    Unreachable(String),

    #[error("backup not found: {0}")]
    NotFound(String),

    #[error("transfer of {name} failed: {message}")]
    TransferFailed { name: String, message: String },

    #[error("{stage} failed: {message}")]
    StageFailed {
        stage: PipelineStage,
        message: String,
    },

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error("tool error: {0}")]
    Tool(ToolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DoctorError {
    pub fn stage(stage: PipelineStage, err: impl std::fmt::Display) -> Self {
        DoctorError::StageFailed {
            stage,
            message: err.to_string(),
        }
    }

    /// Attribute a tool failure to `stage`, keeping a missing tool distinct.
    pub fn at_stage(stage: PipelineStage, err: ToolError) -> Self {
        match err {
            ToolError::ToolMissing(name) => DoctorError::ToolMissing(name),
            other => Self::stage(stage, other),
        }
    }
}

impl From<ToolError> for DoctorError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::ToolMissing(name) => DoctorError::ToolMissing(name),
            other => DoctorError::Tool(other),
        }
    }
}

/// Result type for doctor operations.
pub type Result<T> = std::result::Result<T, DoctorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_missing_is_lifted() {
        let err: DoctorError = ToolError::ToolMissing("rclone".to_string()).into();
        assert!(matches!(err, DoctorError::ToolMissing(ref name) if name == "rclone"));
    }

    #[test]
    fn test_stage_failed_display_names_stage() {
        let err = DoctorError::stage(PipelineStage::Extracted, "bad archive");
        assert_eq!(err.to_string(), "extract failed: bad archive");
    }

    #[test]
    fn test_probe_error_display() {
        assert_eq!(ProbeError::BadStatus(503).to_string(), "unexpected status 503");
        assert!(ProbeError::Unreachable("dns".to_string())
            .to_string()
            .contains("dns"));
    }
}
