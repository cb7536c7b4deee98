//! Individual health probes against one Misskey instance.
//!
//! [`Prober`] is the capability the health classifier consumes; [`ProbeClient`]
//! implements it over HTTP (reqwest) and a WebSocket handshake
//! (tokio-tungstenite). Deadlines are imposed by the caller.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DoctorError, ProbeError};

/// Handshake budget for the streaming probe.
pub const STREAMING_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed path of the streaming endpoint.
pub const STREAMING_PATH: &str = "/streaming";

/// Instance identity from `/api/meta`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaInfo {
    pub version: String,
    pub name: String,
    /// `!disableGlobalTimeline`
    pub federation: bool,
}

/// Public counters from `/api/stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsInfo {
    pub notes: i64,
    pub users: i64,
}

/// Outcome of the streaming handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub ok: bool,
    pub latency_ms: u64,
}

/// Job queue depth from `/api/admin/queue/stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    /// Waiting jobs in the deliver lane.
    pub deliver: i64,
    /// Waiting jobs in the inbox lane.
    pub inbox: i64,
    /// Waiting jobs in the db lane.
    pub db: i64,
    /// Delayed jobs summed over all three lanes.
    pub delayed: i64,
}

/// Host resources from `/api/admin/server-info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub cpu_model: String,
    pub cpu_cores: u32,
    pub mem_total: i64,
    pub fs_used: i64,
    pub fs_total: i64,
    pub fs_percent: f64,
}

impl ServerInfo {
    pub fn new(
        cpu_model: String,
        cpu_cores: u32,
        mem_total: i64,
        fs_used: i64,
        fs_total: i64,
    ) -> Self {
        let fs_percent = if fs_total > 0 {
            fs_used as f64 / fs_total as f64 * 100.0
        } else {
            0.0
        };
        Self {
            cpu_model,
            cpu_cores,
            mem_total,
            fs_used,
            fs_total,
            fs_percent,
        }
    }
}

/// Probe capability bound to one target instance.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn fetch_meta(&self) -> Result<MetaInfo, ProbeError>;

    async fn fetch_stats(&self) -> Result<StatsInfo, ProbeError>;

    /// Open and immediately close a streaming connection. Never errors.
    async fn probe_streaming(&self) -> StreamInfo;

    async fn fetch_queue_stats(&self, credential: &str) -> Result<QueueInfo, ProbeError>;

    async fn fetch_server_info(&self, credential: &str) -> Result<ServerInfo, ProbeError>;
}

/// Prefix `https://` when the target has no scheme and drop trailing slashes.
pub fn normalize_target(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

/// Same host and port, `http→ws` / `https→wss`, path [`STREAMING_PATH`].
pub fn streaming_url(base: &Url) -> Result<Url, ProbeError> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ProbeError::Unreachable(format!(
                "unsupported scheme '{other}'"
            )))
        }
    };
    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|_| ProbeError::Unreachable("failed to set websocket scheme".to_string()))?;
    url.set_path(STREAMING_PATH);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct MetaResponse {
    version: String,
    name: Option<String>,
    disable_global_timeline: bool,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct StatsResponse {
    notes_count: i64,
    users_count: i64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LaneStats {
    waiting: i64,
    delayed: i64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct QueueResponse {
    deliver: LaneStats,
    inbox: LaneStats,
    db: LaneStats,
}

impl From<QueueResponse> for QueueInfo {
    fn from(queue: QueueResponse) -> Self {
        Self {
            deliver: queue.deliver.waiting,
            inbox: queue.inbox.waiting,
            db: queue.db.waiting,
            delayed: queue
                .deliver
                .delayed
                .saturating_add(queue.inbox.delayed)
                .saturating_add(queue.db.delayed),
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CpuSection {
    model: String,
    cores: u32,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct MemSection {
    total: i64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FsSection {
    total: i64,
    used: i64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ServerInfoResponse {
    cpu: CpuSection,
    mem: MemSection,
    fs: FsSection,
}

// ---------------------------------------------------------------------------
// ProbeClient
// ---------------------------------------------------------------------------

/// [`Prober`] over the instance's HTTP API and streaming endpoint.
#[derive(Debug, Clone)]
pub struct ProbeClient {
    base: Url,
    http: reqwest::Client,
}

impl ProbeClient {
    /// Bind to `target` (already normalized or a bare host).
    pub fn new(target: &str) -> Result<Self, DoctorError> {
        let normalized = normalize_target(target);
        let base = Url::parse(&normalized)
            .map_err(|e| DoctorError::Config(format!("invalid target '{target}': {e}")))?;
        if base.host_str().is_none() {
            return Err(DoctorError::Config(format!("target '{target}' has no host")));
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("yamisskey-doctor/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DoctorError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { base, http })
    }

    pub fn target(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base.as_str().trim_end_matches('/'), path)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, ProbeError> {
        let url = self.endpoint(path);
        debug!(url = %url, "POST probe");
        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ProbeError::BadStatus(status.as_u16()));
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ProbeError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl Prober for ProbeClient {
    async fn fetch_meta(&self) -> Result<MetaInfo, ProbeError> {
        let meta: MetaResponse = self.post("/api/meta", serde_json::json!({})).await?;
        Ok(MetaInfo {
            version: meta.version,
            name: meta.name.unwrap_or_default(),
            federation: !meta.disable_global_timeline,
        })
    }

    async fn fetch_stats(&self) -> Result<StatsInfo, ProbeError> {
        let stats: StatsResponse = self.post("/api/stats", serde_json::json!({})).await?;
        Ok(StatsInfo {
            notes: stats.notes_count,
            users: stats.users_count,
        })
    }

    async fn probe_streaming(&self) -> StreamInfo {
        let start = Instant::now();
        let url = match streaming_url(&self.base) {
            Ok(url) => url,
            Err(e) => {
                debug!(error = %e, "Streaming URL could not be derived");
                return StreamInfo {
                    ok: false,
                    latency_ms: 0,
                };
            }
        };

        let handshake = tokio::time::timeout(
            STREAMING_HANDSHAKE_TIMEOUT,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let ok = match handshake {
            Ok(Ok((mut stream, _response))) => {
                if let Err(e) = stream.close(None).await {
                    debug!(error = %e, "Streaming close failed");
                }
                true
            }
            Ok(Err(e)) => {
                debug!(url = %url, error = %e, "Streaming handshake failed");
                false
            }
            Err(_) => {
                debug!(url = %url, "Streaming handshake timed out");
                false
            }
        };
        StreamInfo { ok, latency_ms }
    }

    async fn fetch_queue_stats(&self, credential: &str) -> Result<QueueInfo, ProbeError> {
        let queue: QueueResponse = self
            .post("/api/admin/queue/stats", serde_json::json!({ "i": credential }))
            .await?;
        Ok(queue.into())
    }

    async fn fetch_server_info(&self, credential: &str) -> Result<ServerInfo, ProbeError> {
        let info: ServerInfoResponse = self
            .post("/api/admin/server-info", serde_json::json!({ "i": credential }))
            .await?;
        Ok(ServerInfo::new(
            info.cpu.model,
            info.cpu.cores,
            info.mem.total,
            info.fs.used,
            info.fs.total,
        ))
    }
}
