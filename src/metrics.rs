//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record a proxied request for a model
pub fn record_dispatch(model: &str) {
    metrics::counter!("llama_dispatch_requests_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record a backend cold start
pub fn record_cold_start(model: &str) {
    metrics::counter!("llama_dispatch_cold_starts_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record a backend stop
pub fn record_backend_stopped(model: &str) {
    metrics::counter!("llama_dispatch_backends_stopped_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record an idle reap
pub fn record_backend_reaped(model: &str) {
    metrics::counter!("llama_dispatch_backends_reaped_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Update the running backend gauge
pub fn update_running_count(count: usize) {
    metrics::gauge!("llama_dispatch_running_backends").set(count as f64);
}
