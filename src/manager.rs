//! Backend process lifecycle management
//!
//! One `ModelRuntime` exists per configured model for the life of the
//! dispatcher, created up front so no lazily-initialized shared structure
//! is ever raced. Start and stop for a given model are totally ordered by
//! that model's slot mutex; independent models never contend.

use crate::config::{DispatcherConfig, ModelConfig, ServerConfig};
use crate::error::DispatchError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};

// ============================================================================
// Trait Definitions
// ============================================================================

/// Everything needed to launch one model's backend
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub model: String,
    pub program: String,
    pub cwd: PathBuf,
    pub artifact: PathBuf,
    pub host: String,
    pub port: u16,
    pub extra_args: Vec<String>,
}

/// Opaque handle to a spawned process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub(crate) id: String,
}

/// Trait for managing OS process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Spawn a backend process
    async fn spawn(&self, spec: LaunchSpec) -> Result<ProcessHandle>;

    /// Check whether the process has exited. `None` means still running;
    /// `Some(code)` means exited, with `code` absent when killed by a signal.
    async fn try_wait(&self, handle: &ProcessHandle) -> Option<Option<i32>>;

    /// Terminate gracefully, escalating to a forced kill after `grace`
    async fn terminate(&self, handle: ProcessHandle, grace: Duration) -> Result<()>;
}

/// Trait for backend readiness probing
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Ok(true)` once the backend reports ready, `Ok(false)` on a
    /// non-success response, `Err` when the probe itself failed to connect
    async fn check(&self, host: &str, port: u16) -> Result<bool>;
}

// ============================================================================
// Production Implementations
// ============================================================================

/// Production process manager using tokio::process
pub struct SystemProcessManager {
    processes: Arc<RwLock<HashMap<String, Child>>>,
}

impl SystemProcessManager {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for SystemProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessManager for SystemProcessManager {
    async fn spawn(&self, spec: LaunchSpec) -> Result<ProcessHandle> {
        let mut cmd = Command::new(&spec.program);
        cmd.current_dir(&spec.cwd);

        cmd.arg("-m").arg(&spec.artifact);
        cmd.arg("--host").arg(&spec.host);
        cmd.arg("--port").arg(spec.port.to_string());

        for arg in &spec.extra_args {
            cmd.arg(arg);
        }

        // Backend output is discarded rather than inherited or piped; an
        // unread pipe would eventually block the child.
        let child = cmd
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn backend '{}'", spec.program))?;

        let pid = child.id().context("Failed to get PID")?;
        let handle_id = format!("backend_{}", pid);

        tracing::info!(
            model = %spec.model,
            port = spec.port,
            pid = pid,
            artifact = %spec.artifact.display(),
            "Backend process spawned"
        );

        let handle = ProcessHandle {
            id: handle_id.clone(),
        };

        self.processes.write().await.insert(handle_id, child);

        Ok(handle)
    }

    async fn try_wait(&self, handle: &ProcessHandle) -> Option<Option<i32>> {
        let mut processes = self.processes.write().await;
        let child = processes.get_mut(&handle.id)?;

        match child.try_wait() {
            Ok(Some(status)) => {
                processes.remove(&handle.id);
                Some(status.code())
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to poll backend exit status");
                None
            }
        }
    }

    async fn terminate(&self, handle: ProcessHandle, grace: Duration) -> Result<()> {
        let mut processes = self.processes.write().await;

        if let Some(mut child) = processes.remove(&handle.id) {
            if let Some(pid) = child.id() {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{Signal, kill};
                    use nix::unistd::Pid;

                    let pid = Pid::from_raw(pid as i32);
                    let _ = kill(pid, Signal::SIGTERM);

                    tokio::select! {
                        _ = child.wait() => {
                            tracing::info!("Backend stopped gracefully");
                        }
                        _ = tokio::time::sleep(grace) => {
                            tracing::warn!("Graceful shutdown timeout, sending SIGKILL");
                            let _ = kill(pid, Signal::SIGKILL);
                            let _ = child.wait().await;
                        }
                    }
                }

                #[cfg(not(unix))]
                {
                    let _ = child.kill().await;
                }
            } else {
                // Already exited, just reap it
                let _ = child.wait().await;
            }
        }

        Ok(())
    }
}

/// Production readiness probe against the backend's `GET /health`
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { client }
    }
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, host: &str, port: u16) -> Result<bool> {
        let url = format!("http://{}:{}/health", host, port);
        let response = self.client.get(&url).send().await?;
        Ok(response.status().is_success())
    }
}

// ============================================================================
// Lifecycle Manager
// ============================================================================

/// Timing knobs for the start/stop sequences
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// Overall deadline for health-check convergence after spawn
    pub start_timeout: Duration,
    /// Pause between spawn and the early-exit check
    pub spawn_grace: Duration,
    /// Interval between health polls
    pub poll_interval: Duration,
    /// SIGTERM-to-SIGKILL escalation window
    pub stop_grace: Duration,
}

impl Timings {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            start_timeout: Duration::from_secs(config.start_timeout_secs),
            spawn_grace: Duration::from_secs(config.spawn_grace_secs),
            poll_interval: Duration::from_secs(config.health_poll_interval_secs),
            stop_grace: Duration::from_secs(config.stop_grace_secs),
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(120),
            spawn_grace: Duration::from_secs(2),
            poll_interval: Duration::from_secs(3),
            stop_grace: Duration::from_secs(15),
        }
    }
}

/// Per-model runtime state, created once at manager construction
struct ModelRuntime {
    config: ModelConfig,
    /// The per-model lock. Held across the entire start/verify and stop
    /// sequences; also owns the process handle.
    slot: Mutex<Option<ProcessHandle>>,
    /// Status readable without the slot lock. Written only by the lock
    /// holder; readers tolerate transient staleness.
    running: AtomicBool,
    last_request: RwLock<Option<Instant>>,
}

/// Owns all mutable runtime state for the backend processes
pub struct LifecycleManager {
    models: HashMap<String, ModelRuntime>,
    server: ServerConfig,
    timings: Timings,
    processes: Arc<dyn ProcessManager>,
    probe: Arc<dyn HealthProbe>,
}

impl LifecycleManager {
    /// Create a manager with injected process and probe implementations
    pub fn new(
        server: ServerConfig,
        models: Vec<ModelConfig>,
        timings: Timings,
        processes: Arc<dyn ProcessManager>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let models = models
            .into_iter()
            .map(|config| {
                let runtime = ModelRuntime {
                    config,
                    slot: Mutex::new(None),
                    running: AtomicBool::new(false),
                    last_request: RwLock::new(None),
                };
                (runtime.config.name.clone(), runtime)
            })
            .collect();

        Self {
            models,
            server,
            timings,
            processes,
            probe,
        }
    }

    /// Create a manager backed by real processes and HTTP probes
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self::new(
            config.server.clone(),
            config.models.clone(),
            Timings::from_config(config),
            Arc::new(SystemProcessManager::new()),
            Arc::new(HttpHealthProbe::new()),
        )
    }

    pub fn start_timeout(&self) -> Duration {
        self.timings.start_timeout
    }

    pub fn host(&self) -> &str {
        &self.server.host
    }

    /// Ensure the backend for `name` is running and healthy.
    ///
    /// Idempotent: returns immediately when the backend is already up.
    /// Every failure path leaves `running == false`, the slot cleared and
    /// no live process behind, so a retry by the caller is always safe.
    pub async fn start(&self, name: &str, timeout: Duration) -> Result<(), DispatchError> {
        let runtime = self
            .models
            .get(name)
            .ok_or_else(|| DispatchError::ModelNotFound {
                model: name.to_string(),
            })?;

        let mut slot = runtime.slot.lock().await;

        if runtime.running.load(Ordering::Acquire) {
            tracing::debug!(model = name, "Backend already running");
            return Ok(());
        }

        let artifact = resolve_artifact(&runtime.config.model_path);
        if !validate_artifact(&artifact) {
            return Err(DispatchError::ModelFile {
                model: name.to_string(),
                path: artifact,
            });
        }

        tracing::info!(model = name, port = runtime.config.port, "Cold starting backend");
        crate::metrics::record_cold_start(name);

        let spec = LaunchSpec {
            model: name.to_string(),
            program: self.server.backend_bin.clone(),
            cwd: self.server.backend_dir.clone(),
            artifact,
            host: self.server.host.clone(),
            port: runtime.config.port,
            extra_args: runtime.config.args.clone(),
        };

        let handle =
            self.processes
                .spawn(spec)
                .await
                .map_err(|source| DispatchError::Startup {
                    model: name.to_string(),
                    source,
                })?;

        // Let the process get past argument parsing before checking on it,
        // so a crash reads as "bad flags" rather than "never became healthy".
        tokio::time::sleep(self.timings.spawn_grace).await;

        if let Some(code) = self.processes.try_wait(&handle).await {
            let _ = self.processes.terminate(handle, Duration::from_secs(1)).await;
            return Err(DispatchError::ExitedEarly {
                model: name.to_string(),
                code,
            });
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.probe.check(&self.server.host, runtime.config.port).await {
                Ok(true) => {
                    *slot = Some(handle);
                    // A fresh backend always carries an idle clock, so the
                    // reaper can collect it even if no request ever lands.
                    *runtime.last_request.write().await = Some(Instant::now());
                    runtime.running.store(true, Ordering::Release);
                    crate::metrics::update_running_count(self.running_models().len());
                    tracing::info!(model = name, "Backend is ready");
                    return Ok(());
                }
                Ok(false) => {
                    tracing::warn!(model = name, "Health check returned non-success status");
                }
                Err(e) => {
                    tracing::warn!(model = name, error = %e, "Health check attempt failed");
                }
            }

            if let Some(code) = self.processes.try_wait(&handle).await {
                let _ = self.processes.terminate(handle, Duration::from_secs(1)).await;
                return Err(DispatchError::ExitedEarly {
                    model: name.to_string(),
                    code,
                });
            }

            if Instant::now() >= deadline {
                let _ = self
                    .processes
                    .terminate(handle, self.timings.stop_grace)
                    .await;
                return Err(DispatchError::Unhealthy {
                    model: name.to_string(),
                });
            }

            tokio::time::sleep(self.timings.poll_interval).await;
        }
    }

    /// Stop the backend for `name`. A no-op for unknown models and for
    /// backends that are already stopped.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let Some(runtime) = self.models.get(name) else {
            // Suppressed rather than surfaced; the taxonomy code keeps the
            // log line machine-readable.
            let err = DispatchError::BackendNotFound {
                model: name.to_string(),
            };
            tracing::info!(
                model = name,
                error_code = err.error_code(),
                "Stop requested for unknown model, ignoring"
            );
            return Ok(());
        };

        let mut slot = runtime.slot.lock().await;

        // Flip status and clear the idle clock before touching the process,
        // so a dispatch queued on this lock cold-starts cleanly instead of
        // observing a backend mid-termination.
        runtime.running.store(false, Ordering::Release);
        *runtime.last_request.write().await = None;

        let Some(handle) = slot.take() else {
            tracing::info!(model = name, "Backend already stopped");
            return Ok(());
        };

        tracing::info!(model = name, "Stopping backend");
        self.processes
            .terminate(handle, self.timings.stop_grace)
            .await?;

        crate::metrics::record_backend_stopped(name);
        crate::metrics::update_running_count(self.running_models().len());

        tracing::info!(model = name, "Backend stopped");
        Ok(())
    }

    /// Stop every running backend, best-effort. Used at shutdown.
    pub async fn stop_all(&self) {
        tracing::info!("Stopping all running backends");
        for (name, runtime) in &self.models {
            if !runtime.running.load(Ordering::Acquire) {
                continue;
            }
            if let Err(e) = self.stop(name).await {
                tracing::error!(
                    model = %name,
                    error = %e,
                    "Failed to stop backend during shutdown"
                );
            }
        }
    }

    /// Record a request for `name` regardless of backend state
    pub async fn touch(&self, name: &str) {
        if let Some(runtime) = self.models.get(name) {
            *runtime.last_request.write().await = Some(Instant::now());
        }
    }

    /// Eagerly start every configured backend, continuing past failures
    pub async fn pre_start(&self) {
        let mut names: Vec<&String> = self.models.keys().collect();
        names.sort();

        for name in names {
            if let Err(e) = self.start(name, self.timings.start_timeout).await {
                tracing::error!(model = %name, error = %e, "Failed to pre-start backend");
            }
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.models
            .get(name)
            .is_some_and(|r| r.running.load(Ordering::Acquire))
    }

    /// Names of backends currently marked running, sorted for stable output
    pub fn running_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .models
            .iter()
            .filter(|(_, r)| r.running.load(Ordering::Acquire))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Running backends whose last request is at least `threshold` ago
    pub async fn idle_models(&self, threshold: Duration) -> Vec<String> {
        let mut idle = Vec::new();
        for (name, runtime) in &self.models {
            if !runtime.running.load(Ordering::Acquire) {
                continue;
            }
            let last = *runtime.last_request.read().await;
            if let Some(last) = last
                && last.elapsed() >= threshold
            {
                idle.push(name.clone());
            }
        }
        idle.sort();
        idle
    }

    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.get(name).map(|r| &r.config)
    }

    /// All configured models, sorted by name
    pub fn configs(&self) -> Vec<&ModelConfig> {
        let mut configs: Vec<&ModelConfig> = self.models.values().map(|r| &r.config).collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }
}

// ============================================================================
// Artifact Validation
// ============================================================================

/// Expand `~` and resolve symlinks when the file exists. Missing paths are
/// kept as-is so the shard-name check still applies to them.
fn resolve_artifact(path: &str) -> PathBuf {
    let expanded = if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from(path))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    };
    std::fs::canonicalize(&expanded).unwrap_or(expanded)
}

/// A usable artifact is an existing `.gguf` file, or a path whose file name
/// marks it as the first shard of a split artifact (`...1-of-N.gguf`);
/// the backend resolves the remaining shards itself.
fn validate_artifact(path: &Path) -> bool {
    let is_gguf = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gguf"));
    (path.is_file() && is_gguf) || is_first_shard(path)
}

fn is_first_shard(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let lower = name.to_ascii_lowercase();
    let Some(stem) = lower.strip_suffix(".gguf") else {
        return false;
    };
    let Some(idx) = stem.rfind("-of-") else {
        return false;
    };
    let (head, tail) = stem.split_at(idx);
    let count = &tail["-of-".len()..];
    if count.is_empty() || !count.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    // Shard index must read 1, optionally zero-padded
    head.ends_with('1')
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize};

    /// Mock process manager recording spawns in memory
    pub struct MockProcessManager {
        processes: RwLock<HashMap<String, LaunchSpec>>,
        spawn_count: AtomicUsize,
        next_id: AtomicU32,
        /// When set, spawned processes report this exit immediately
        exit_code: std::sync::Mutex<Option<Option<i32>>>,
    }

    impl Default for MockProcessManager {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockProcessManager {
        pub fn new() -> Self {
            Self {
                processes: RwLock::new(HashMap::new()),
                spawn_count: AtomicUsize::new(0),
                next_id: AtomicU32::new(1000),
                exit_code: std::sync::Mutex::new(None),
            }
        }

        /// Make every spawned process look like it exited with `code`
        pub fn exit_with(&self, code: Option<i32>) {
            *self.exit_code.lock().unwrap() = Some(code);
        }

        pub fn spawn_count(&self) -> usize {
            self.spawn_count.load(Ordering::SeqCst)
        }

        pub async fn live_count(&self) -> usize {
            self.processes.read().await.len()
        }
    }

    #[async_trait]
    impl ProcessManager for MockProcessManager {
        async fn spawn(&self, spec: LaunchSpec) -> Result<ProcessHandle> {
            self.spawn_count.fetch_add(1, Ordering::SeqCst);
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let handle_id = format!("mock_backend_{}", id);

            self.processes
                .write()
                .await
                .insert(handle_id.clone(), spec);

            Ok(ProcessHandle { id: handle_id })
        }

        async fn try_wait(&self, handle: &ProcessHandle) -> Option<Option<i32>> {
            if !self.processes.read().await.contains_key(&handle.id) {
                return Some(None);
            }
            *self.exit_code.lock().unwrap()
        }

        async fn terminate(&self, handle: ProcessHandle, _grace: Duration) -> Result<()> {
            self.processes.write().await.remove(&handle.id);
            Ok(())
        }
    }

    /// Mock probe reporting healthy after a configurable number of failures
    pub struct MockHealthProbe {
        healthy_after: usize,
        calls: AtomicUsize,
    }

    impl MockHealthProbe {
        pub fn healthy() -> Self {
            Self::healthy_after(0)
        }

        pub fn healthy_after(failures: usize) -> Self {
            Self {
                healthy_after: failures,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HealthProbe for MockHealthProbe {
        async fn check(&self, _host: &str, _port: u16) -> Result<bool> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.healthy_after {
                anyhow::bail!("connection refused");
            }
            Ok(true)
        }
    }
}
