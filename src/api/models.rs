//! API response models

use crate::config::ModelConfig;
use crate::gpu::GpuStat;
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_models: Vec<String>,
    #[serde(skip_deserializing)]
    pub gpus: Vec<GpuStat>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// OpenAI-style model listing
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelCard>,
}

/// One entry in the model listing
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    pub object: String,
    pub context_length: u32,
    pub running: bool,
}

impl ModelCard {
    pub fn from_config(config: &ModelConfig, running: bool) -> Self {
        Self {
            id: config.name.clone(),
            object: "model".to_string(),
            context_length: config.context_length(),
            running,
        }
    }
}
