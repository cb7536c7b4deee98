//! Health classification.
//!
//! [`classify`] runs the probes in a fixed order and folds them into one
//! [`HealthVerdict`]. The status only ever moves toward worse within a run
//! and is never set by callers.

use std::future::Future;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ProbeError;
use crate::probe::{MetaInfo, Prober, QueueInfo, ServerInfo, StatsInfo};

/// Delayed jobs above this degrade the verdict.
pub const QUEUE_DELAYED_THRESHOLD: i64 = 1000;

/// Overall instance health, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    /// Process exit code for `check`.
    pub fn exit_code(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }

    /// Move to `to` if it is worse than the current status.
    fn worsen(&mut self, to: HealthStatus) {
        if to > *self {
            *self = to;
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which probe produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Api,
    Stats,
    Stream,
    Queue,
    Server,
}

/// Data carried by a probe result.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbePayload {
    Meta(MetaInfo),
    Stats(StatsInfo),
    Queue(QueueInfo),
    Server(ServerInfo),
    /// Reason the probe failed.
    Failed(String),
    Empty,
}

/// Outcome of one probe within one check.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub kind: ProbeKind,
    pub ok: bool,
    pub latency_ms: u64,
    pub payload: ProbePayload,
}

/// Aggregated verdict. Only [`classify`] builds one.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthVerdict {
    status: HealthStatus,
    probes: Vec<ProbeResult>,
}

impl HealthVerdict {
    pub fn status(&self) -> HealthStatus {
        self.status
    }

    /// Probe results in execution order.
    pub fn probes(&self) -> &[ProbeResult] {
        &self.probes
    }

    pub fn probe(&self, kind: ProbeKind) -> Option<&ProbeResult> {
        self.probes.iter().find(|p| p.kind == kind)
    }

    pub fn meta(&self) -> Option<&MetaInfo> {
        match self.probe(ProbeKind::Api).map(|p| &p.payload) {
            Some(ProbePayload::Meta(meta)) => Some(meta),
            _ => None,
        }
    }

    pub fn stats(&self) -> Option<&StatsInfo> {
        match self.probe(ProbeKind::Stats).map(|p| &p.payload) {
            Some(ProbePayload::Stats(stats)) => Some(stats),
            _ => None,
        }
    }

    pub fn queue(&self) -> Option<&QueueInfo> {
        match self.probe(ProbeKind::Queue).map(|p| &p.payload) {
            Some(ProbePayload::Queue(queue)) => Some(queue),
            _ => None,
        }
    }

    pub fn server(&self) -> Option<&ServerInfo> {
        match self.probe(ProbeKind::Server).map(|p| &p.payload) {
            Some(ProbePayload::Server(server)) => Some(server),
            _ => None,
        }
    }
}

async fn within<T, F>(deadline: tokio::time::Instant, probe: F) -> Result<T, ProbeError>
where
    F: Future<Output = Result<T, ProbeError>>,
{
    match tokio::time::timeout_at(deadline, probe).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Unreachable("deadline exceeded".to_string())),
    }
}

/// Run the probe sequence and classify the instance.
///
/// 1. meta: failure is `unhealthy` and nothing else runs
/// 2. stats: best effort
/// 3. streaming: failure degrades
/// 4. with a credential: queue (backlog above [`QUEUE_DELAYED_THRESHOLD`]
///    degrades) and server info
///
/// Best-effort probes that fail are left out of the verdict. All probes share
/// `deadline`; running past it fails only the probe in flight.
pub async fn classify(
    prober: &dyn Prober,
    credential: Option<&str>,
    deadline: tokio::time::Instant,
) -> HealthVerdict {
    let mut status = HealthStatus::Healthy;
    let mut probes = Vec::new();

    let start = Instant::now();
    let meta = within(deadline, prober.fetch_meta()).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    match meta {
        Ok(meta) => probes.push(ProbeResult {
            kind: ProbeKind::Api,
            ok: true,
            latency_ms,
            payload: ProbePayload::Meta(meta),
        }),
        Err(e) => {
            warn!(error = %e, "API probe failed");
            status.worsen(HealthStatus::Unhealthy);
            probes.push(ProbeResult {
                kind: ProbeKind::Api,
                ok: false,
                latency_ms,
                payload: ProbePayload::Failed(e.to_string()),
            });
            return HealthVerdict { status, probes };
        }
    }

    let start = Instant::now();
    match within(deadline, prober.fetch_stats()).await {
        Ok(stats) => probes.push(ProbeResult {
            kind: ProbeKind::Stats,
            ok: true,
            latency_ms: start.elapsed().as_millis() as u64,
            payload: ProbePayload::Stats(stats),
        }),
        Err(e) => debug!(error = %e, "Stats probe failed"),
    }

    let start = Instant::now();
    let stream = match tokio::time::timeout_at(deadline, prober.probe_streaming()).await {
        Ok(stream) => stream,
        Err(_) => crate::probe::StreamInfo {
            ok: false,
            latency_ms: start.elapsed().as_millis() as u64,
        },
    };
    if !stream.ok {
        warn!("Streaming probe failed");
        status.worsen(HealthStatus::Degraded);
    }
    probes.push(ProbeResult {
        kind: ProbeKind::Stream,
        ok: stream.ok,
        latency_ms: stream.latency_ms,
        payload: ProbePayload::Empty,
    });

    if let Some(credential) = credential {
        let start = Instant::now();
        match within(deadline, prober.fetch_queue_stats(credential)).await {
            Ok(queue) => {
                if queue.delayed > QUEUE_DELAYED_THRESHOLD {
                    warn!(delayed = queue.delayed, "Queue backlog above threshold");
                    status.worsen(HealthStatus::Degraded);
                }
                probes.push(ProbeResult {
                    kind: ProbeKind::Queue,
                    ok: true,
                    latency_ms: start.elapsed().as_millis() as u64,
                    payload: ProbePayload::Queue(queue),
                });
            }
            Err(e) => debug!(error = %e, "Queue probe failed"),
        }

        let start = Instant::now();
        match within(deadline, prober.fetch_server_info(credential)).await {
            Ok(server) => probes.push(ProbeResult {
                kind: ProbeKind::Server,
                ok: true,
                latency_ms: start.elapsed().as_millis() as u64,
                payload: ProbePayload::Server(server),
            }),
            Err(e) => debug!(error = %e, "Server info probe failed"),
        }
    }

    info!(status = %status, probes = probes.len(), "Health check complete");
    HealthVerdict { status, probes }
}

// ---------------------------------------------------------------------------
// JSON report
// ---------------------------------------------------------------------------

/// `{ok, ms}` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimedCheck {
    pub ok: bool,
    pub ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueReport {
    pub ok: bool,
    #[serde(flatten)]
    pub info: QueueInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerReport {
    pub ok: bool,
    #[serde(flatten)]
    pub info: ServerInfo,
}

/// Machine-readable `check` output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckReport {
    pub status: HealthStatus,
    pub api: TimedCheck,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<MetaInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<TimedCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerReport>,
}

impl From<&HealthVerdict> for CheckReport {
    fn from(verdict: &HealthVerdict) -> Self {
        let timed = |kind| {
            verdict.probe(kind).map(|p: &ProbeResult| TimedCheck {
                ok: p.ok,
                ms: p.latency_ms,
            })
        };
        Self {
            status: verdict.status(),
            api: timed(ProbeKind::Api).unwrap_or(TimedCheck { ok: false, ms: 0 }),
            meta: verdict.meta().cloned(),
            stream: timed(ProbeKind::Stream),
            stats: verdict.stats().copied(),
            queue: verdict.queue().map(|q| QueueReport { ok: true, info: *q }),
            server: verdict.server().map(|s| ServerReport {
                ok: true,
                info: s.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedProber;
    use std::time::Duration;

    fn deadline() -> tokio::time::Instant {
        tokio::time::Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn test_status_order_and_exit_codes() {
        assert!(HealthStatus::Healthy < HealthStatus::Degraded);
        assert!(HealthStatus::Degraded < HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::Healthy.exit_code(), 0);
        assert_eq!(HealthStatus::Degraded.exit_code(), 1);
        assert_eq!(HealthStatus::Unhealthy.exit_code(), 2);
    }

    #[test]
    fn test_worsen_never_improves() {
        let mut status = HealthStatus::Degraded;
        status.worsen(HealthStatus::Healthy);
        assert_eq!(status, HealthStatus::Degraded);
        status.worsen(HealthStatus::Unhealthy);
        status.worsen(HealthStatus::Degraded);
        assert_eq!(status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_healthy_without_credential() {
        let prober = ScriptedProber::healthy();
        let verdict = classify(&prober, None, deadline()).await;
        assert_eq!(verdict.status(), HealthStatus::Healthy);
        assert!(verdict.probes().iter().all(|p| p.ok));
        assert_eq!(prober.calls(), vec!["meta", "stats", "stream"]);

        let report = serde_json::to_value(CheckReport::from(&verdict)).unwrap();
        assert_eq!(report["status"], "healthy");
        assert_eq!(report["api"]["ok"], true);
        assert_eq!(report["meta"]["version"], "13.0");
        assert_eq!(report["meta"]["federation"], true);
        assert_eq!(report["stream"]["ok"], true);
        assert!(report.get("queue").is_none());
        assert!(report.get("server").is_none());
    }

    #[tokio::test]
    async fn test_api_failure_is_unhealthy_and_stops() {
        let prober = ScriptedProber::healthy()
            .failing_meta(ProbeError::BadStatus(502))
            .failing_stream()
            .with_queue(QueueInfo {
                deliver: 0,
                inbox: 0,
                db: 0,
                delayed: 5000,
            });
        let verdict = classify(&prober, Some("token"), deadline()).await;
        assert_eq!(verdict.status(), HealthStatus::Unhealthy);
        assert_eq!(verdict.probes().len(), 1);
        assert_eq!(prober.calls(), vec!["meta"]);
        assert!(verdict.meta().is_none());
    }

    #[tokio::test]
    async fn test_streaming_failure_degrades() {
        let prober = ScriptedProber::healthy().failing_stream();
        let verdict = classify(&prober, None, deadline()).await;
        assert_eq!(verdict.status(), HealthStatus::Degraded);
        assert!(!verdict.probe(ProbeKind::Stream).unwrap().ok);
    }

    #[tokio::test]
    async fn test_queue_backlog_threshold() {
        let at_threshold = ScriptedProber::healthy().with_queue(QueueInfo {
            deliver: 1,
            inbox: 2,
            db: 3,
            delayed: QUEUE_DELAYED_THRESHOLD,
        });
        let verdict = classify(&at_threshold, Some("t"), deadline()).await;
        assert_eq!(verdict.status(), HealthStatus::Healthy);

        let above = ScriptedProber::healthy().with_queue(QueueInfo {
            deliver: 1,
            inbox: 2,
            db: 3,
            delayed: QUEUE_DELAYED_THRESHOLD + 1,
        });
        let verdict = classify(&above, Some("t"), deadline()).await;
        assert_eq!(verdict.status(), HealthStatus::Degraded);
        assert_eq!(verdict.queue().unwrap().delayed, 1001);
    }

    #[tokio::test]
    async fn test_failed_best_effort_probes_are_omitted() {
        let prober = ScriptedProber::healthy()
            .failing_stats()
            .failing_queue()
            .failing_server();
        let verdict = classify(&prober, Some("t"), deadline()).await;
        assert_eq!(verdict.status(), HealthStatus::Healthy);
        assert!(verdict.stats().is_none());
        assert!(verdict.queue().is_none());
        assert!(verdict.server().is_none());
        assert!(verdict.probes().iter().all(|p| p.ok));
        assert_eq!(
            prober.calls(),
            vec!["meta", "stats", "stream", "queue", "server"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fails_in_flight_probe() {
        let prober = ScriptedProber::healthy().with_meta_delay(Duration::from_secs(10));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let verdict = classify(&prober, None, deadline).await;
        assert_eq!(verdict.status(), HealthStatus::Unhealthy);
        match &verdict.probes()[0].payload {
            ProbePayload::Failed(reason) => assert!(reason.contains("deadline")),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_healthy_implies_all_probes_ok() {
        let scenarios = vec![
            ScriptedProber::healthy(),
            ScriptedProber::healthy().failing_stream(),
            ScriptedProber::healthy().failing_stats(),
            ScriptedProber::healthy().failing_meta(ProbeError::Malformed("x".into())),
            ScriptedProber::healthy().with_queue(QueueInfo {
                deliver: 0,
                inbox: 0,
                db: 0,
                delayed: 99_999,
            }),
        ];
        for prober in scenarios {
            let verdict = classify(&prober, Some("t"), deadline()).await;
            if verdict.status() == HealthStatus::Healthy {
                assert!(verdict.probes().iter().all(|p| p.ok));
            }
        }
    }
}
