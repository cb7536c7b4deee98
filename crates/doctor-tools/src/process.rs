//! External process execution with optional deadline.

use crate::error::{ToolError, ToolResult};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// Captured result of one external process invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Exit code (-1 when terminated by a signal).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl ToolOutput {
    /// Whether the process exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim().to_string();
        let err = self.stderr.trim();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }
}

/// Builder for an external tool invocation.
///
/// Environment entries are never logged; callers pass secrets (e.g.
/// `PGPASSWORD`) through [`ToolCommand::env`].
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    timeout_secs: u64,
}

impl ToolCommand {
    /// Start building an invocation of `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            timeout_secs: 0,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Kill the process if it runs longer than `secs`. Zero disables the deadline.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Program and arguments joined for log lines.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run to completion and capture output. A non-zero exit is not an error here.
    pub async fn output(&self) -> ToolResult<ToolOutput> {
        let start = Instant::now();
        debug!(command = %self.display(), "Running external tool");

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.envs {
            command.env(key, value);
        }

        let child = command.spawn().map_err(|source| ToolError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let output = if self.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(self.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| ToolError::Timeout {
                program: self.program.clone(),
                secs: self.timeout_secs,
            })??
        } else {
            child.wait_with_output().await?
        };

        let result = ToolOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        debug!(
            program = %self.program,
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            "External tool finished"
        );
        Ok(result)
    }

    /// Run to completion, turning a non-zero exit into [`ToolError::Failed`].
    pub async fn run_checked(&self) -> ToolResult<ToolOutput> {
        let output = self.output().await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ToolError::Failed {
                program: self.program.clone(),
                code: output.exit_code,
                output: output.combined(),
            })
        }
    }
}

/// Fail fast with [`ToolError::ToolMissing`] for the first tool not on `PATH`.
pub fn ensure_available(tools: &[&str]) -> ToolResult<()> {
    for tool in tools {
        if which::which(tool).is_err() {
            return Err(ToolError::ToolMissing((*tool).to_string()));
        }
    }
    Ok(())
}
