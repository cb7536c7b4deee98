//! SQL capability definitions.
//!
//! The relational engine is reached only through [`SqlExecutor`]: a small
//! async surface that runs scalar queries, statements, and script files
//! against a named database on one server. [`crate::PsqlExecutor`] drives the
//! `psql` client; [`crate::fakes::MemorySqlExecutor`] is an in-memory stand-in
//! for tests.

use async_trait::async_trait;
use std::path::Path;

use crate::error::ToolResult;

/// Database every server has; used for CREATE/DROP DATABASE.
pub const MAINTENANCE_DATABASE: &str = "postgres";

/// Coordinates of one PostgreSQL server plus the default target database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgConnection {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
}

impl PgConnection {
    /// `user@host:port/database`, without the password.
    pub fn describe(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }

    /// The same server with a different default database.
    pub fn with_database(&self, database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..self.clone()
        }
    }
}

/// How failures inside a script file are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptMode {
    /// Stop at the first failing statement and report it.
    Strict,
    /// Keep going past failing statements; only a fatal client error fails.
    Lenient,
}

/// SQL-executing capability bound to one server.
///
/// Every method names the database it targets so one executor can serve the
/// live database, a scratch database, and the maintenance database.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run a query returning a single integer (e.g. `SELECT COUNT(*) ...`).
    async fn query_count(&self, database: &str, sql: &str) -> ToolResult<i64>;

    /// Run a statement for its side effect.
    async fn execute(&self, database: &str, sql: &str) -> ToolResult<()>;

    /// Apply a SQL script file (a plain-text dump).
    async fn apply_script(&self, database: &str, script: &Path, mode: ScriptMode)
        -> ToolResult<()>;

    /// Create an empty database.
    async fn create_database(&self, name: &str) -> ToolResult<()> {
        self.execute(
            MAINTENANCE_DATABASE,
            &format!("CREATE DATABASE {}", quote_ident(name)),
        )
        .await
    }

    /// Terminate other sessions on `name` (best effort), then drop it if present.
    async fn drop_database(&self, name: &str) -> ToolResult<()> {
        if let Err(e) = self.execute(MAINTENANCE_DATABASE, &terminate_sql(name)).await {
            tracing::warn!(
                database = %name,
                error = %e,
                "Could not terminate connections before drop"
            );
        }
        self.execute(
            MAINTENANCE_DATABASE,
            &format!("DROP DATABASE IF EXISTS {}", quote_ident(name)),
        )
        .await
    }
}

/// Statement ending every other session connected to `database`.
pub fn terminate_sql(database: &str) -> String {
    format!(
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
         WHERE datname = {} AND pid <> pg_backend_pid()",
        quote_literal(database)
    )
}

/// Quote an SQL identifier (`"name"`, embedded quotes doubled).
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote an SQL string literal (`'value'`, embedded quotes doubled).
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
