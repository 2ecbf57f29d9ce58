//! API request handlers

use super::models::{HealthResponse, ModelCard, ModelList};
use super::routes::AppState;
use crate::error::DispatchError;
use axum::{
    Json,
    body::Body,
    extract::{OriginalUri, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::Value;

/// GET /health - dispatcher status plus currently running backends
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_models: state.manager.running_models(),
        gpus: crate::gpu::collect().await,
        timestamp: chrono::Utc::now(),
    })
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// GET /v1/models - list configured models
pub async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    let data = state
        .manager
        .configs()
        .into_iter()
        .map(|config| ModelCard::from_config(config, state.manager.is_running(&config.name)))
        .collect();

    Json(ModelList {
        object: "list".to_string(),
        data,
    })
}

/// POST /v1/completions, /v1/chat/completions, /v1/embeddings
///
/// Ensures the backend serving the named model is up, then relays the
/// request. Streamed (SSE) responses are forwarded chunk-by-chunk.
pub async fn dispatch(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<Value>,
) -> Result<Response, DispatchError> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or(DispatchError::MissingModel)?
        .to_string();

    crate::metrics::record_dispatch(&model);

    // Stamp the idle clock before starting, so the reaper can never stop a
    // backend that a request is about to use.
    state.manager.touch(&model).await;

    // Always go through start; the already-running path is a cheap no-op.
    state
        .manager
        .start(&model, state.manager.start_timeout())
        .await?;

    let config = state
        .manager
        .model(&model)
        .ok_or_else(|| DispatchError::ModelNotFound {
            model: model.clone(),
        })?;

    let target = format!(
        "http://{}:{}{}",
        state.manager.host(),
        config.port,
        uri.path()
    );

    let upstream = state
        .http
        .post(&target)
        .timeout(state.request_timeout)
        .json(&body)
        .send()
        .await
        .map_err(|source| DispatchError::Upstream {
            model: model.clone(),
            source,
        })?;

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    if content_type.starts_with("text/event-stream") {
        // Relay chunks as they arrive rather than buffering the whole stream
        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        let ct = header::HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| header::HeaderValue::from_static("text/event-stream"));
        response.headers_mut().insert(header::CONTENT_TYPE, ct);
        return Ok(response);
    }

    let payload: Value = upstream
        .json()
        .await
        .map_err(|source| DispatchError::Upstream { model, source })?;

    Ok((status, Json(payload)).into_response())
}
