//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Main dispatcher configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub api_port: u16,

    /// Eagerly start every configured backend at boot instead of
    /// cold-starting on first request. The idle reaper is not run in
    /// this mode.
    pub pre_start: bool,

    /// Overall deadline for a backend to pass its health check after spawn
    pub start_timeout_secs: u64,

    /// Pause after spawn before the early-exit check
    pub spawn_grace_secs: u64,

    /// Interval between health polls while a backend is warming up
    pub health_poll_interval_secs: u64,

    /// How long a backend gets to exit on SIGTERM before SIGKILL
    pub stop_grace_secs: u64,

    /// Idle reaper scan period
    pub reap_interval_secs: u64,

    /// Idle duration after which a running backend is stopped
    pub idle_timeout_secs: u64,

    /// Timeout for proxied completion requests
    pub request_timeout_secs: u64,

    pub server: ServerConfig,
    pub models: Vec<ModelConfig>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            pre_start: false,
            start_timeout_secs: default_start_timeout(),
            spawn_grace_secs: default_spawn_grace(),
            health_poll_interval_secs: default_health_poll_interval(),
            stop_grace_secs: default_stop_grace(),
            reap_interval_secs: default_reap_interval(),
            idle_timeout_secs: default_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            server: ServerConfig::default(),
            models: Vec::new(),
        }
    }
}

impl DispatcherConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("LLAMA_DISPATCH_API_PORT") {
            config.api_port = port
                .parse()
                .context("Invalid LLAMA_DISPATCH_API_PORT value")?;
        }
        if let Ok(pre_start) = std::env::var("LLAMA_DISPATCH_PRE_START") {
            config.pre_start = pre_start
                .parse()
                .context("Invalid LLAMA_DISPATCH_PRE_START value")?;
        }
        if let Ok(dir) = std::env::var("LLAMA_DISPATCH_BACKEND_DIR") {
            config.server.backend_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }

        let mut ports = HashSet::new();
        let mut names = HashSet::new();

        for model in &self.models {
            if model.port < 1024 {
                anyhow::bail!(
                    "Model '{}' port must be >= 1024 (got {})",
                    model.name,
                    model.port
                );
            }
            if model.port == self.api_port {
                anyhow::bail!(
                    "Model '{}' port {} conflicts with API port",
                    model.name,
                    model.port
                );
            }
            if !ports.insert(model.port) {
                anyhow::bail!("Duplicate port {} in model configs", model.port);
            }

            if model.name.is_empty() {
                anyhow::bail!("Model name cannot be empty");
            }
            if model.name.contains('/') || model.name.contains('\\') {
                anyhow::bail!("Model name '{}' cannot contain path separators", model.name);
            }
            if !names.insert(&model.name) {
                anyhow::bail!("Duplicate model name: {}", model.name);
            }
        }

        Ok(())
    }
}

/// Global backend server settings shared by every model
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Working directory the backend binary is launched from
    pub backend_dir: PathBuf,

    /// Backend executable, resolved relative to `backend_dir`
    pub backend_bin: String,

    /// Host the backends bind to and are probed/proxied at
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backend_dir: PathBuf::from("."),
            backend_bin: default_backend_bin(),
            host: default_host(),
        }
    }
}

/// Launch configuration for a single model's backend
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ModelConfig {
    pub name: String,
    pub port: u16,

    /// Filesystem path to the model artifact (.gguf, or first shard of a split)
    pub model_path: String,

    /// Additional CLI args passed to the backend verbatim, in order
    #[serde(default)]
    pub args: Vec<String>,
}

impl ModelConfig {
    /// Infer the context window from the configured launch flags.
    /// Falls back to the backend's own default when no flag is present.
    pub fn context_length(&self) -> u32 {
        let mut args = self.args.iter();
        while let Some(arg) = args.next() {
            if arg == "-c" || arg == "--ctx-size" {
                if let Some(value) = args.next()
                    && let Ok(parsed) = value.parse()
                {
                    return parsed;
                }
                break;
            }
        }
        DEFAULT_CONTEXT_LENGTH
    }
}

/// llama-server serves 4096 tokens of context unless told otherwise
pub const DEFAULT_CONTEXT_LENGTH: u32 = 4096;

// Default functions
fn default_api_port() -> u16 {
    8000
}
fn default_start_timeout() -> u64 {
    120
}
fn default_spawn_grace() -> u64 {
    2
}
fn default_health_poll_interval() -> u64 {
    3
}
fn default_stop_grace() -> u64 {
    15
}
fn default_reap_interval() -> u64 {
    120
}
fn default_idle_timeout() -> u64 {
    180
}
fn default_request_timeout() -> u64 {
    300
}
fn default_backend_bin() -> String {
    "./llama-server".to_string()
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
