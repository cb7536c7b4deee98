//! Error types for doctor-tools

use thiserror::Error;

/// Errors raised while invoking external tools or talking to PostgreSQL.
#[derive(Error, Debug)]
pub enum ToolError {
    /// A required executable is not on `PATH`
    #[error("required tool '{0}' not found in PATH")]
    ToolMissing(String),

    /// The process could not be started
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exceeded its configured deadline and was killed
    #[error("{program} timed out after {secs} seconds")]
    Timeout { program: String, secs: u64 },

    /// The process ran but exited non-zero
    #[error("{program} exited with code {code}: {output}")]
    Failed {
        program: String,
        code: i32,
        output: String,
    },

    /// A SQL statement was rejected by the server
    #[error("query failed: {0}")]
    Query(String),

    /// A scalar query returned something that is not an integer
    #[error("unexpected query output: {0:?}")]
    UnparsableOutput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for tool operations
pub type ToolResult<T> = std::result::Result<T, ToolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_missing_names_the_tool() {
        let err = ToolError::ToolMissing("7z".to_string());
        assert_eq!(err.to_string(), "required tool '7z' not found in PATH");
    }

    #[test]
    fn test_failed_includes_exit_code_and_output() {
        let err = ToolError::Failed {
            program: "psql".to_string(),
            code: 3,
            output: "ERROR:  relation \"user\" does not exist".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("psql"));
        assert!(msg.contains("code 3"));
        assert!(msg.contains("does not exist"));
    }
}
