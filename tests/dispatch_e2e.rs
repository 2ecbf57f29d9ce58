//! End-to-end dispatch tests against a stub backend
//!
//! A real OS process stands in for llama-server (a shell script that just
//! sleeps) while a small in-process axum server answers the backend's HTTP
//! surface on the model's port. This exercises the full path: cold start,
//! early-exit check, health polling, request relay and teardown.

#![cfg(unix)]

use axum::{
    Json, Router,
    body::{Body, Bytes},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_test::TestServer;
use llama_dispatch::{
    HttpHealthProbe, LifecycleManager, ModelConfig, ServerConfig, SystemProcessManager, Timings,
    api::{AppState, create_router},
    metrics,
};
use serde_json::{Value, json};
use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tempfile::TempDir;

static METRICS_HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> metrics_exporter_prometheus::PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| metrics::setup_metrics().expect("Failed to setup metrics"))
        .clone()
}

/// Stub backend answering the routes llama-server exposes
async fn spawn_stub_backend() -> u16 {
    async fn echo(Json(body): Json<Value>) -> Json<Value> {
        Json(json!({ "object": "chat.completion", "echo": body }))
    }

    async fn stream() -> Response {
        let chunks: Vec<Result<Bytes, std::convert::Infallible>> = vec![
            Ok(Bytes::from_static(b"data: {\"token\":\"one\"}\n\n")),
            Ok(Bytes::from_static(b"data: {\"token\":\"two\"}\n\n")),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ];

        (
            [(header::CONTENT_TYPE, "text/event-stream")],
            Body::from_stream(futures::stream::iter(chunks)),
        )
            .into_response()
    }

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/v1/chat/completions", post(echo))
        .route("/v1/embeddings", post(echo))
        .route("/v1/completions", post(stream));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind stub backend");
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    port
}

/// Fake backend binary: parses nothing, just stays alive until signalled
fn write_fake_backend(dir: &TempDir) {
    let path = dir.path().join("fake-server");
    std::fs::write(&path, "#!/bin/sh\nsleep 30\n").expect("Failed to write fake backend");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("Failed to mark fake backend executable");
}

fn fast_timings() -> Timings {
    Timings {
        start_timeout: Duration::from_secs(5),
        spawn_grace: Duration::from_millis(20),
        poll_interval: Duration::from_millis(25),
        stop_grace: Duration::from_millis(500),
    }
}

async fn create_dispatcher(backend_port: u16) -> (TestServer, Arc<LifecycleManager>, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    write_fake_backend(&dir);

    let artifact = dir.path().join("alpha.gguf");
    std::fs::write(&artifact, b"gguf").expect("Failed to write artifact fixture");

    let server_config = ServerConfig {
        backend_dir: dir.path().to_path_buf(),
        backend_bin: "./fake-server".to_string(),
        host: "127.0.0.1".to_string(),
    };

    let models = vec![ModelConfig {
        name: "alpha".to_string(),
        port: backend_port,
        model_path: artifact.to_str().unwrap().to_string(),
        args: vec![],
    }];

    let manager = Arc::new(LifecycleManager::new(
        server_config,
        models,
        fast_timings(),
        Arc::new(SystemProcessManager::new()),
        Arc::new(HttpHealthProbe::new()),
    ));

    let state = AppState {
        manager: manager.clone(),
        http: reqwest::Client::new(),
        request_timeout: Duration::from_secs(30),
        prometheus_handle: get_metrics_handle(),
    };

    let server = TestServer::new(create_router(state));

    (server, manager, dir)
}

#[tokio::test]
async fn test_cold_start_and_relay() {
    let backend_port = spawn_stub_backend().await;
    let (server, manager, _dir) = create_dispatcher(backend_port).await;

    assert!(!manager.is_running("alpha"));

    let request = json!({
        "model": "alpha",
        "messages": [{"role": "user", "content": "hello"}]
    });
    let response = server.post("/v1/chat/completions").json(&request).await;

    // First request triggered an implicit start, then relayed unchanged
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["echo"], request);
    assert!(manager.is_running("alpha"));

    // Backend stays up and serves the next request without a restart
    let response = server.post("/v1/chat/completions").json(&request).await;
    assert_eq!(response.status_code(), 200);

    // Health endpoint reflects the running backend
    let health = server.get("/health").await;
    let body: Value = health.json();
    assert_eq!(body["active_models"], json!(["alpha"]));

    manager.stop_all().await;
    assert!(manager.running_models().is_empty());
}

#[tokio::test]
async fn test_streaming_relay_preserves_chunks() {
    let backend_port = spawn_stub_backend().await;
    let (server, manager, _dir) = create_dispatcher(backend_port).await;

    let response = server
        .post("/v1/completions")
        .json(&json!({ "model": "alpha", "prompt": "count", "stream": true }))
        .await;

    assert_eq!(response.status_code(), 200);
    assert!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"))
    );

    let text = response.text();
    assert!(text.contains("data: {\"token\":\"one\"}"));
    assert!(text.contains("data: {\"token\":\"two\"}"));
    assert!(text.ends_with("data: [DONE]\n\n"));

    manager.stop_all().await;
}

#[tokio::test]
async fn test_stop_terminates_backend_process() {
    let backend_port = spawn_stub_backend().await;
    let (_server, manager, _dir) = create_dispatcher(backend_port).await;

    manager.start("alpha", Duration::from_secs(5)).await.unwrap();
    assert!(manager.is_running("alpha"));

    // SIGTERM is enough for the stub; this returns well inside the grace window
    manager.stop("alpha").await.unwrap();
    assert!(!manager.is_running("alpha"));

    // Stopping again is a no-op
    manager.stop("alpha").await.unwrap();
}

#[tokio::test]
async fn test_stop_escalates_when_backend_ignores_sigterm() {
    let backend_port = spawn_stub_backend().await;
    let dir = TempDir::new().unwrap();

    // A backend that shrugs off SIGTERM, forcing the SIGKILL escalation
    let path = dir.path().join("fake-server");
    std::fs::write(&path, "#!/bin/sh\ntrap '' TERM\nsleep 30\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let artifact = dir.path().join("alpha.gguf");
    std::fs::write(&artifact, b"gguf").unwrap();

    let manager = LifecycleManager::new(
        ServerConfig {
            backend_dir: dir.path().to_path_buf(),
            backend_bin: "./fake-server".to_string(),
            host: "127.0.0.1".to_string(),
        },
        vec![ModelConfig {
            name: "alpha".to_string(),
            port: backend_port,
            model_path: artifact.to_str().unwrap().to_string(),
            args: vec![],
        }],
        fast_timings(),
        Arc::new(SystemProcessManager::new()),
        Arc::new(HttpHealthProbe::new()),
    );

    manager.start("alpha", Duration::from_secs(5)).await.unwrap();
    assert!(manager.is_running("alpha"));

    let begun = Instant::now();
    manager.stop("alpha").await.unwrap();

    // SIGTERM went unanswered, so stop waited out the whole grace window
    // before the kill; it still returned with the process reaped
    assert!(begun.elapsed() >= fast_timings().stop_grace);
    assert!(!manager.is_running("alpha"));
    assert!(manager.running_models().is_empty());
}

#[tokio::test]
async fn test_early_exit_of_crashing_backend() {
    let dir = TempDir::new().unwrap();

    // A backend that dies immediately, as a bad flag set would
    let path = dir.path().join("fake-server");
    std::fs::write(&path, "#!/bin/sh\nexit 7\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let artifact = dir.path().join("alpha.gguf");
    std::fs::write(&artifact, b"gguf").unwrap();

    // Generous grace so the exit is always observed before polling starts
    let timings = Timings {
        spawn_grace: Duration::from_millis(300),
        ..fast_timings()
    };

    let manager = LifecycleManager::new(
        ServerConfig {
            backend_dir: dir.path().to_path_buf(),
            backend_bin: "./fake-server".to_string(),
            host: "127.0.0.1".to_string(),
        },
        vec![ModelConfig {
            name: "alpha".to_string(),
            port: 9001,
            model_path: artifact.to_str().unwrap().to_string(),
            args: vec![],
        }],
        timings,
        Arc::new(SystemProcessManager::new()),
        Arc::new(HttpHealthProbe::new()),
    );

    let err = manager.start("alpha", Duration::from_secs(5)).await.unwrap_err();
    match err {
        llama_dispatch::DispatchError::ExitedEarly { code, .. } => {
            assert_eq!(code, Some(7));
        }
        other => panic!("expected ExitedEarly, got {other:?}"),
    }
    assert!(!manager.is_running("alpha"));
}
