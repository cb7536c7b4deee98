//! In-memory fakes for the doctor capabilities (testing only)
//!
//! Scripted implementations of [`Prober`], [`StorageCatalog`], [`Extractor`],
//! [`Confirmer`] and [`BackupChooser`], plus [`misskey_dump`] for seeding a
//! [`FakeDatabase`] that answers the integrity audit.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use doctor_tools::fakes::FakeDatabase;

use crate::archive::{dump_path_for, Extractor};
use crate::audit::{
    table_exists_sql, CRITICAL_TABLES, NOTE_COUNT_SQL, ORPHAN_NOTES_SQL, TABLE_COUNT_SQL,
    USER_COUNT_SQL,
};
use crate::confirm::{BackupChooser, Choice, Confirmer};
use crate::error::{DoctorError, ProbeError, Result};
use crate::lifecycle::PipelineStage;
use crate::probe::{MetaInfo, Prober, QueueInfo, ServerInfo, StatsInfo, StreamInfo};
use crate::storage::{BackupObject, StorageCatalog};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A database as restored from a Misskey dump containing `tables`.
///
/// Critical tables that are absent answer the existence query with 0, and
/// queries against them fail like a missing relation would.
pub fn misskey_dump(tables: &[&str], orphan_notes: i64) -> FakeDatabase {
    let has = |t: &str| tables.contains(&t);
    let mut db = FakeDatabase::new().with_count(TABLE_COUNT_SQL, tables.len() as i64);
    for table in CRITICAL_TABLES {
        db = db.with_count(table_exists_sql(table), i64::from(has(table)));
    }
    if has("user") {
        db = db.with_count(USER_COUNT_SQL, 42);
    }
    if has("note") {
        db = db.with_count(NOTE_COUNT_SQL, 1337);
    }
    if has("user") && has("note") {
        db = db.with_count(ORPHAN_NOTES_SQL, orphan_notes);
    }
    db
}

// ---------------------------------------------------------------------------
// Prober
// ---------------------------------------------------------------------------

/// [`Prober`] answering from fixed results and recording call order.
pub struct ScriptedProber {
    meta: std::result::Result<MetaInfo, ProbeError>,
    meta_delay: Option<Duration>,
    stats: std::result::Result<StatsInfo, ProbeError>,
    stream_ok: bool,
    queue: std::result::Result<QueueInfo, ProbeError>,
    server: std::result::Result<ServerInfo, ProbeError>,
    calls: Mutex<Vec<&'static str>>,
}

impl ScriptedProber {
    /// Every probe succeeds; version 13.0 with federation on.
    pub fn healthy() -> Self {
        Self {
            meta: Ok(MetaInfo {
                version: "13.0".to_string(),
                name: "yamisskey".to_string(),
                federation: true,
            }),
            meta_delay: None,
            stats: Ok(StatsInfo {
                notes: 1000,
                users: 10,
            }),
            stream_ok: true,
            queue: Ok(QueueInfo {
                deliver: 0,
                inbox: 0,
                db: 0,
                delayed: 0,
            }),
            server: Ok(ServerInfo::new(
                "AMD EPYC".to_string(),
                4,
                8 * 1024 * 1024 * 1024,
                50,
                100,
            )),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_meta(mut self, err: ProbeError) -> Self {
        self.meta = Err(err);
        self
    }

    pub fn with_meta_delay(mut self, delay: Duration) -> Self {
        self.meta_delay = Some(delay);
        self
    }

    pub fn failing_stats(mut self) -> Self {
        self.stats = Err(ProbeError::BadStatus(500));
        self
    }

    pub fn failing_stream(mut self) -> Self {
        self.stream_ok = false;
        self
    }

    pub fn with_queue(mut self, queue: QueueInfo) -> Self {
        self.queue = Ok(queue);
        self
    }

    pub fn failing_queue(mut self) -> Self {
        self.queue = Err(ProbeError::BadStatus(401));
        self
    }

    pub fn failing_server(mut self) -> Self {
        self.server = Err(ProbeError::Malformed("expected object".to_string()));
        self
    }

    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: &'static str) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn fetch_meta(&self) -> std::result::Result<MetaInfo, ProbeError> {
        self.record("meta");
        if let Some(delay) = self.meta_delay {
            tokio::time::sleep(delay).await;
        }
        self.meta.clone()
    }

    async fn fetch_stats(&self) -> std::result::Result<StatsInfo, ProbeError> {
        self.record("stats");
        self.stats.clone()
    }

    async fn probe_streaming(&self) -> StreamInfo {
        self.record("stream");
        StreamInfo {
            ok: self.stream_ok,
            latency_ms: 3,
        }
    }

    async fn fetch_queue_stats(
        &self,
        _credential: &str,
    ) -> std::result::Result<QueueInfo, ProbeError> {
        self.record("queue");
        self.queue.clone()
    }

    async fn fetch_server_info(
        &self,
        _credential: &str,
    ) -> std::result::Result<ServerInfo, ProbeError> {
        self.record("server");
        self.server.clone()
    }
}

// ---------------------------------------------------------------------------
// StorageCatalog
// ---------------------------------------------------------------------------

/// In-memory backup store.
#[derive(Default)]
pub struct MemoryCatalog {
    objects: Vec<(String, String)>,
    fail_list: bool,
    fail_fetch: bool,
    fetches: Mutex<Vec<String>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(mut self, name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.objects.push((name.into(), contents.into()));
        self
    }

    pub fn failing_list(mut self) -> Self {
        self.fail_list = true;
        self
    }

    /// Fetch leaves a partial file behind and fails.
    pub fn failing_fetch(mut self) -> Self {
        self.fail_fetch = true;
        self
    }

    /// Names fetched so far.
    pub fn fetches(&self) -> Vec<String> {
        lock(&self.fetches).clone()
    }
}

#[async_trait]
impl StorageCatalog for MemoryCatalog {
    async fn list(&self) -> Result<Vec<BackupObject>> {
        if self.fail_list {
            return Err(DoctorError::Unreachable("memory: remote offline".to_string()));
        }
        let mut backups: Vec<BackupObject> = self
            .objects
            .iter()
            .map(|(name, contents)| BackupObject {
                name: name.clone(),
                size: contents.len() as u64,
            })
            .collect();
        backups.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(backups)
    }

    async fn fetch(&self, name: &str, dest_dir: &Path) -> Result<PathBuf> {
        lock(&self.fetches).push(name.to_string());
        std::fs::create_dir_all(dest_dir)?;
        let local = dest_dir.join(name);
        if self.fail_fetch {
            std::fs::write(&local, "partial")?;
            return Err(DoctorError::TransferFailed {
                name: name.to_string(),
                message: "connection reset by peer".to_string(),
            });
        }
        let (_, contents) = self
            .objects
            .iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| DoctorError::NotFound(name.to_string()))?;
        std::fs::write(&local, contents)?;
        Ok(local)
    }
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

/// Writes a placeholder dump next to the archive.
#[derive(Default)]
pub struct FakeExtractor {
    fail: bool,
    calls: Mutex<Vec<PathBuf>>,
}

impl FakeExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave a partial dump behind and fail.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<PathBuf> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn extract(&self, archive: &Path) -> Result<PathBuf> {
        lock(&self.calls).push(archive.to_path_buf());
        let dump = dump_path_for(archive)?;
        if self.fail {
            std::fs::write(&dump, "-- truncated")?;
            return Err(DoctorError::stage(
                PipelineStage::Extracted,
                "Data Error in encrypted file. Wrong password?",
            ));
        }
        std::fs::write(&dump, "-- PostgreSQL database dump\n")?;
        Ok(dump)
    }
}

// ---------------------------------------------------------------------------
// Operator
// ---------------------------------------------------------------------------

/// Gives a fixed answer and records every prompt.
pub struct ScriptedConfirmer {
    answer: bool,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedConfirmer {
    pub fn agreeing() -> Self {
        Self {
            answer: true,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn refusing() -> Self {
        Self {
            answer: false,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

#[async_trait]
impl Confirmer for ScriptedConfirmer {
    async fn confirm(&self, warning: &str) -> bool {
        lock(&self.prompts).push(warning.to_string());
        self.answer
    }
}

/// Answers "which backup?" with a typed string.
pub struct ScriptedChooser {
    input: String,
}

impl ScriptedChooser {
    pub fn typing(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

#[async_trait]
impl BackupChooser for ScriptedChooser {
    async fn choose(&self, backups: &[BackupObject]) -> Result<Choice> {
        crate::confirm::parse_choice(&self.input, backups)
    }
}
