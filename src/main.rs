//! llama-dispatch - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use llama_dispatch::{DispatcherConfig, IdleReaper, LifecycleManager, api, metrics};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "llama-dispatch")]
#[command(about = "On-demand dispatcher for llama-server backends", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override API port
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting llama-dispatch");

    // Load configuration
    let mut config = DispatcherConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.port {
        config.api_port = port;
    }

    config.validate()?;

    tracing::info!(
        api_port = config.api_port,
        models = config.models.len(),
        pre_start = config.pre_start,
        backend_dir = ?config.server.backend_dir,
        "Configuration loaded"
    );

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    // Initialize the lifecycle manager with every configured model
    let manager = Arc::new(LifecycleManager::from_config(&config));

    // Eager mode brings everything up at boot; lazy mode reaps idle backends
    let reaper_handle = if config.pre_start {
        tracing::info!("Pre-start enabled, starting all configured backends");
        manager.pre_start().await;
        None
    } else {
        let reaper = Arc::new(IdleReaper::new(
            manager.clone(),
            Duration::from_secs(config.reap_interval_secs),
            Duration::from_secs(config.idle_timeout_secs),
        ));
        Some(tokio::spawn(async move {
            reaper.run().await;
        }))
    };

    // Setup API
    let app_state = api::AppState {
        manager: manager.clone(),
        http: reqwest::Client::new(),
        request_timeout: Duration::from_secs(config.request_timeout_secs),
        prometheus_handle,
    };

    let app = api::create_router(app_state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind API server")?;

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    tracing::info!("Shutting down...");

    // Stop all backends before exiting
    manager.stop_all().await;

    // Cancel the reaper
    if let Some(handle) = reaper_handle {
        handle.abort();
    }

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
