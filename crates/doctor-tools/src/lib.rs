//! doctor-tools: external capabilities for yamisskey-doctor
//!
//! Everything the diagnostic core needs from the outside world that is not
//! HTTP lives here: spawning external tools with an optional deadline, and
//! executing SQL against PostgreSQL.
//!
//! ## Layer 0 - Capabilities
//!
//! - `ToolCommand`: builder and runner for external processes
//! - `SqlExecutor`: async SQL capability (scalar queries, statements, scripts)
//! - `PsqlExecutor`: `SqlExecutor` over the `psql` client
//! - `fakes::MemorySqlExecutor`: in-memory server for tests

mod error;
pub mod fakes;
pub mod process;
mod psql;
pub mod sql;

pub use error::{ToolError, ToolResult};
pub use process::{ensure_available, ToolCommand, ToolOutput};
pub use psql::{parse_count, PsqlExecutor};
pub use sql::{
    quote_ident, quote_literal, terminate_sql, PgConnection, ScriptMode, SqlExecutor,
    MAINTENANCE_DATABASE,
};
