//! Probe and classifier tests against a local Misskey-shaped server.
//!
//! An axum app on `127.0.0.1:0` serves the API endpoints and the streaming
//! WebSocket upgrade on the same port.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use doctor_core::{classify, CheckReport, HealthStatus, ProbeClient, ProbeError, Prober};

const TOKEN: &str = "secret";

#[derive(Clone)]
struct Instance {
    meta_status: StatusCode,
    malformed_meta: bool,
    streaming: bool,
    delayed: i64,
}

impl Default for Instance {
    fn default() -> Self {
        Self {
            meta_status: StatusCode::OK,
            malformed_meta: false,
            streaming: true,
            delayed: 0,
        }
    }
}

async fn meta(State(inst): State<Instance>) -> Response {
    if inst.meta_status != StatusCode::OK {
        return inst.meta_status.into_response();
    }
    if inst.malformed_meta {
        return (StatusCode::OK, "<html>maintenance</html>").into_response();
    }
    Json(json!({
        "version": "13.0",
        "name": "yamisskey",
        "disableGlobalTimeline": false
    }))
    .into_response()
}

async fn stats() -> Json<Value> {
    Json(json!({ "notesCount": 1234, "usersCount": 56 }))
}

async fn queue(State(inst): State<Instance>, Json(body): Json<Value>) -> Response {
    if body["i"] != TOKEN {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({
        "deliver": { "waiting": 1, "delayed": inst.delayed },
        "inbox": { "waiting": 2, "delayed": 0 },
        "db": { "waiting": 3, "delayed": 0 }
    }))
    .into_response()
}

async fn server_info(Json(body): Json<Value>) -> Response {
    if body["i"] != TOKEN {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({
        "cpu": { "model": "AMD EPYC 7B13", "cores": 8 },
        "mem": { "total": 17179869184i64 },
        "fs": { "total": 1000, "used": 250 }
    }))
    .into_response()
}

async fn streaming(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|_socket| async {})
}

async fn spawn_instance(inst: Instance) -> SocketAddr {
    let mut router = Router::new()
        .route("/api/meta", post(meta))
        .route("/api/stats", post(stats))
        .route("/api/admin/queue/stats", post(queue))
        .route("/api/admin/server-info", post(server_info));
    if inst.streaming {
        router = router.route("/streaming", get(streaming));
    }
    let router = router.with_state(inst);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn client(addr: SocketAddr) -> ProbeClient {
    ProbeClient::new(&format!("http://{addr}")).unwrap()
}

fn deadline() -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(5)
}

// =============================================================================
// Classifier end to end
// =============================================================================

#[tokio::test]
async fn test_healthy_instance_without_credential() {
    let addr = spawn_instance(Instance::default()).await;
    let verdict = classify(&client(addr), None, deadline()).await;

    assert_eq!(verdict.status(), HealthStatus::Healthy);
    let report = serde_json::to_value(CheckReport::from(&verdict)).unwrap();
    assert_eq!(report["status"], "healthy");
    assert_eq!(report["api"]["ok"], true);
    assert_eq!(report["meta"]["version"], "13.0");
    assert_eq!(report["meta"]["federation"], true);
    assert_eq!(report["stream"]["ok"], true);
    assert_eq!(report["stats"]["notes"], 1234);
    assert_eq!(report["stats"]["users"], 56);
    assert!(report.get("queue").is_none());
}

#[tokio::test]
async fn test_credentialed_probes() {
    let addr = spawn_instance(Instance::default()).await;
    let verdict = classify(&client(addr), Some(TOKEN), deadline()).await;

    assert_eq!(verdict.status(), HealthStatus::Healthy);
    let report = serde_json::to_value(CheckReport::from(&verdict)).unwrap();
    assert_eq!(report["queue"]["ok"], true);
    assert_eq!(report["queue"]["deliver"], 1);
    assert_eq!(report["queue"]["db"], 3);
    assert_eq!(report["server"]["cpuCores"], 8);
    assert_eq!(report["server"]["fsPercent"], 25.0);
}

#[tokio::test]
async fn test_rejected_credential_leaves_verdict_alone() {
    let addr = spawn_instance(Instance::default()).await;
    let verdict = classify(&client(addr), Some("wrong"), deadline()).await;
    assert_eq!(verdict.status(), HealthStatus::Healthy);
    assert!(verdict.queue().is_none());
    assert!(verdict.server().is_none());
}

#[tokio::test]
async fn test_missing_streaming_endpoint_degrades() {
    let addr = spawn_instance(Instance {
        streaming: false,
        ..Instance::default()
    })
    .await;
    let verdict = classify(&client(addr), None, deadline()).await;
    assert_eq!(verdict.status(), HealthStatus::Degraded);
    assert!(verdict.meta().is_some());
}

#[tokio::test]
async fn test_queue_backlog_degrades() {
    let addr = spawn_instance(Instance {
        delayed: 1500,
        ..Instance::default()
    })
    .await;
    let verdict = classify(&client(addr), Some(TOKEN), deadline()).await;
    assert_eq!(verdict.status(), HealthStatus::Degraded);
    assert_eq!(verdict.queue().unwrap().delayed, 1500);
}

#[tokio::test]
async fn test_api_error_is_unhealthy() {
    let addr = spawn_instance(Instance {
        meta_status: StatusCode::SERVICE_UNAVAILABLE,
        ..Instance::default()
    })
    .await;
    let verdict = classify(&client(addr), Some(TOKEN), deadline()).await;
    assert_eq!(verdict.status(), HealthStatus::Unhealthy);
    assert_eq!(verdict.probes().len(), 1);
}

// =============================================================================
// Individual probes
// =============================================================================

#[tokio::test]
async fn test_meta_bad_status() {
    let addr = spawn_instance(Instance {
        meta_status: StatusCode::BAD_GATEWAY,
        ..Instance::default()
    })
    .await;
    let err = client(addr).fetch_meta().await.unwrap_err();
    assert_eq!(err, ProbeError::BadStatus(502));
}

#[tokio::test]
async fn test_meta_malformed_body() {
    let addr = spawn_instance(Instance {
        malformed_meta: true,
        ..Instance::default()
    })
    .await;
    let err = client(addr).fetch_meta().await.unwrap_err();
    assert!(matches!(err, ProbeError::Malformed(_)));
}

#[tokio::test]
async fn test_unreachable_target() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let probe = client(addr);
    assert!(matches!(
        probe.fetch_meta().await,
        Err(ProbeError::Unreachable(_))
    ));
    assert!(!probe.probe_streaming().await.ok);
}
