//! llama-dispatch - On-demand dispatcher for llama-server backends
//!
//! A lightweight Rust service that receives OpenAI-compatible requests,
//! cold-starts the backend process serving the named model when needed,
//! relays the (possibly streamed) response, and reaps idle backends.

pub mod api;
pub mod config;
pub mod error;
pub mod gpu;
pub mod manager;
pub mod metrics;
pub mod reaper;

pub use config::{DispatcherConfig, ModelConfig, ServerConfig};
pub use error::DispatchError;
pub use manager::{
    HealthProbe, HttpHealthProbe, LifecycleManager, ProcessManager, SystemProcessManager, Timings,
};
pub use reaper::IdleReaper;
