//! `psql`-backed [`SqlExecutor`].

use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{ToolError, ToolResult};
use crate::process::{ToolCommand, ToolOutput};
use crate::sql::{PgConnection, ScriptMode, SqlExecutor};

/// Runs SQL through the `psql` command-line client.
#[derive(Debug, Clone)]
pub struct PsqlExecutor {
    conn: PgConnection,
    timeout_secs: u64,
}

impl PsqlExecutor {
    pub fn new(conn: PgConnection) -> Self {
        Self {
            conn,
            timeout_secs: 0,
        }
    }

    /// Per-invocation deadline in seconds (0 = none).
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    fn base_command(&self, database: &str) -> ToolCommand {
        let port = self.conn.port.to_string();
        let mut cmd = ToolCommand::new("psql")
            .args([
                "-X",
                "-h",
                self.conn.host.as_str(),
                "-p",
                port.as_str(),
                "-U",
                self.conn.user.as_str(),
                "-d",
                database,
            ])
            .timeout_secs(self.timeout_secs);
        if let Some(password) = &self.conn.password {
            cmd = cmd.env("PGPASSWORD", password.as_str());
        }
        cmd
    }
}

/// Parse the first non-empty line of tuples-only output as an integer.
pub fn parse_count(output: &str) -> ToolResult<i64> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| ToolError::UnparsableOutput(output.to_string()))?;
    line.parse::<i64>()
        .map_err(|_| ToolError::UnparsableOutput(line.to_string()))
}

fn query_error(output: &ToolOutput) -> ToolError {
    ToolError::Query(output.combined())
}

#[async_trait]
impl SqlExecutor for PsqlExecutor {
    async fn query_count(&self, database: &str, sql: &str) -> ToolResult<i64> {
        let output = self
            .base_command(database)
            .args(["-v", "ON_ERROR_STOP=1", "-t", "-A", "-c", sql])
            .output()
            .await?;
        if !output.success() {
            return Err(query_error(&output));
        }
        parse_count(&output.stdout)
    }

    async fn execute(&self, database: &str, sql: &str) -> ToolResult<()> {
        let output = self
            .base_command(database)
            .args(["-v", "ON_ERROR_STOP=1", "-c", sql])
            .output()
            .await?;
        if !output.success() {
            return Err(query_error(&output));
        }
        debug!(database = %database, "Statement executed");
        Ok(())
    }

    async fn apply_script(
        &self,
        database: &str,
        script: &Path,
        mode: ScriptMode,
    ) -> ToolResult<()> {
        let path = script.to_string_lossy().to_string();
        let mut cmd = self.base_command(database).args(["-q", "-f", path.as_str()]);
        if mode == ScriptMode::Strict {
            cmd = cmd.args(["-v", "ON_ERROR_STOP=1"]);
        }
        let output = cmd.output().await?;
        if !output.success() {
            return Err(ToolError::Failed {
                program: "psql".to_string(),
                code: output.exit_code,
                output: output.combined(),
            });
        }
        if mode == ScriptMode::Lenient && output.stderr.contains("ERROR:") {
            warn!(database = %database, "Script applied with statement errors");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("42\n").unwrap(), 42);
        assert_eq!(parse_count("\n   7   \n\n").unwrap(), 7);
    }

    #[test]
    fn test_parse_count_rejects_garbage() {
        assert!(matches!(
            parse_count(""),
            Err(ToolError::UnparsableOutput(_))
        ));
        assert!(matches!(
            parse_count("count\n-----"),
            Err(ToolError::UnparsableOutput(_))
        ));
    }

    #[test]
    fn test_base_command_targets_requested_database() {
        let exec = PsqlExecutor::new(PgConnection {
            host: "localhost".to_string(),
            port: 5432,
            user: "misskey".to_string(),
            password: Some("pw".to_string()),
            database: "mk1".to_string(),
        });
        let display = exec.base_command("postgres").display();
        assert!(display.starts_with("psql -X -h localhost -p 5432 -U misskey -d postgres"));
        assert!(!display.contains("pw"));
    }
}
