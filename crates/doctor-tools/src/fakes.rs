//! In-memory fakes for the SQL capability (testing only)
//!
//! [`MemorySqlExecutor`] models a server as a set of named databases. Each
//! [`FakeDatabase`] answers scalar queries from a table of scripted results
//! and applies scripted effects when statements run, which is enough to
//! exercise detect/fix cycles, scratch-database lifecycles, and dry-run
//! invariance without a PostgreSQL server.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{ToolError, ToolResult};
use crate::sql::{ScriptMode, SqlExecutor};

/// Scripted behaviour of one database.
#[derive(Debug, Clone, Default)]
pub struct FakeDatabase {
    counts: HashMap<String, i64>,
    effects: HashMap<String, Vec<(String, i64)>>,
    failing: HashSet<String>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `sql` with `value`.
    pub fn with_count(mut self, sql: impl Into<String>, value: i64) -> Self {
        self.counts.insert(sql.into(), value);
        self
    }

    /// After `statement` succeeds, `query` answers `value`.
    pub fn with_effect(
        mut self,
        statement: impl Into<String>,
        query: impl Into<String>,
        value: i64,
    ) -> Self {
        self.effects
            .entry(statement.into())
            .or_default()
            .push((query.into(), value));
        self
    }

    /// Make `sql` (query or statement) fail.
    pub fn with_failure(mut self, sql: impl Into<String>) -> Self {
        self.failing.insert(sql.into());
        self
    }
}

/// One recorded call against the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub database: String,
    pub sql: String,
    pub mutating: bool,
}

#[derive(Debug, Default)]
struct State {
    databases: HashMap<String, FakeDatabase>,
    script_seed: Option<FakeDatabase>,
    fail_create: bool,
    fail_scripts: bool,
    calls: Vec<RecordedCall>,
}

/// In-memory SQL server backed by `HashMap<database, FakeDatabase>`.
#[derive(Debug, Default)]
pub struct MemorySqlExecutor {
    state: Mutex<State>,
}

impl MemorySqlExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing database.
    pub fn with_database(self, name: impl Into<String>, db: FakeDatabase) -> Self {
        self.lock().databases.insert(name.into(), db);
        self
    }

    /// Contents a database takes on once any script is applied to it.
    pub fn with_script_seed(self, db: FakeDatabase) -> Self {
        self.lock().script_seed = Some(db);
        self
    }

    /// Make CREATE DATABASE fail.
    pub fn failing_create(self) -> Self {
        self.lock().fail_create = true;
        self
    }

    /// Make every script application fail.
    pub fn failing_scripts(self) -> Self {
        self.lock().fail_scripts = true;
        self
    }

    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().databases.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.lock().databases.contains_key(name)
    }

    /// Every call in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Only the calls that could change server state.
    pub fn mutations(&self) -> Vec<RecordedCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.mutating)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking test thread may poison the lock; the data is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn missing_database(name: &str) -> ToolError {
    ToolError::Query(format!("FATAL:  database \"{name}\" does not exist"))
}

impl State {
    fn record(&mut self, database: &str, sql: &str, mutating: bool) {
        self.calls.push(RecordedCall {
            database: database.to_string(),
            sql: sql.to_string(),
            mutating,
        });
    }
}

#[async_trait]
impl SqlExecutor for MemorySqlExecutor {
    async fn query_count(&self, database: &str, sql: &str) -> ToolResult<i64> {
        let mut state = self.lock();
        state.record(database, sql, false);
        let db = state
            .databases
            .get(database)
            .ok_or_else(|| missing_database(database))?;
        if db.failing.contains(sql) {
            return Err(ToolError::Query(format!("ERROR:  scripted failure: {sql}")));
        }
        db.counts
            .get(sql)
            .copied()
            .ok_or_else(|| ToolError::Query("ERROR:  relation does not exist".to_string()))
    }

    async fn execute(&self, database: &str, sql: &str) -> ToolResult<()> {
        let mut state = self.lock();
        state.record(database, sql, true);
        let db = state
            .databases
            .get_mut(database)
            .ok_or_else(|| missing_database(database))?;
        if db.failing.contains(sql) {
            return Err(ToolError::Query(format!("ERROR:  scripted failure: {sql}")));
        }
        if let Some(effects) = db.effects.get(sql).cloned() {
            for (query, value) in effects {
                db.counts.insert(query, value);
            }
        }
        Ok(())
    }

    async fn apply_script(
        &self,
        database: &str,
        script: &Path,
        _mode: ScriptMode,
    ) -> ToolResult<()> {
        if !script.exists() {
            return Err(ToolError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", script.display()),
            )));
        }
        let mut state = self.lock();
        state.record(database, &format!("\\i {}", script.display()), true);
        if state.fail_scripts {
            return Err(ToolError::Failed {
                program: "psql".to_string(),
                code: 3,
                output: "ERROR:  syntax error at or near \"garbage\"".to_string(),
            });
        }
        let seed = state.script_seed.clone();
        let db = state
            .databases
            .get_mut(database)
            .ok_or_else(|| missing_database(database))?;
        if let Some(seed) = seed {
            *db = seed;
        }
        Ok(())
    }

    async fn create_database(&self, name: &str) -> ToolResult<()> {
        let mut state = self.lock();
        state.record(
            crate::sql::MAINTENANCE_DATABASE,
            &format!("CREATE DATABASE {name}"),
            true,
        );
        if state.fail_create {
            return Err(ToolError::Query(
                "ERROR:  permission denied to create database".to_string(),
            ));
        }
        if state.databases.contains_key(name) {
            return Err(ToolError::Query(format!(
                "ERROR:  database \"{name}\" already exists"
            )));
        }
        state.databases.insert(name.to_string(), FakeDatabase::new());
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> ToolResult<()> {
        let mut state = self.lock();
        state.record(
            crate::sql::MAINTENANCE_DATABASE,
            &format!("DROP DATABASE IF EXISTS {name}"),
            true,
        );
        state.databases.remove(name);
        Ok(())
    }
}
