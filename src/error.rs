//! Error types for backend lifecycle failures and API responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;

/// Domain errors, each with a stable machine-readable code
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("model '{model}' is not defined in the registry")]
    ModelNotFound { model: String },

    #[error(
        "artifact for model '{model}' at '{path}' failed validation; \
         point at a .gguf file, or at the first shard of a split artifact"
    )]
    ModelFile { model: String, path: PathBuf },

    #[error("backend for model '{model}' exited early with code {code:?}")]
    ExitedEarly { model: String, code: Option<i32> },

    #[error("backend for model '{model}' did not become healthy before the deadline")]
    Unhealthy { model: String },

    #[error("failed to start backend for model '{model}'")]
    Startup {
        model: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("no backend process recorded for model '{model}'")]
    BackendNotFound { model: String },

    #[error("request body is missing the 'model' field")]
    MissingModel,

    #[error("relaying request to backend for model '{model}' failed")]
    Upstream {
        model: String,
        #[source]
        source: reqwest::Error,
    },
}

impl DispatchError {
    /// Stable error code carried in every error response
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ModelNotFound { .. } => "MODEL_NOT_FOUND",
            Self::ModelFile { .. } => "MODEL_FILE_NOT_ACCESSIBLE",
            Self::ExitedEarly { .. } => "BACKEND_EXITED_EARLY",
            Self::Unhealthy { .. } => "BACKEND_UNHEALTHY",
            Self::Startup { .. } => "BACKEND_STARTUP_ERROR",
            Self::BackendNotFound { .. } => "BACKEND_NOT_FOUND",
            Self::MissingModel => "MISSING_MODEL",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::ModelNotFound { .. }
            | Self::ModelFile { .. }
            | Self::BackendNotFound { .. } => StatusCode::NOT_FOUND,
            Self::ExitedEarly { .. } | Self::Unhealthy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Startup { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::MissingModel => StatusCode::BAD_REQUEST,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    fn details(&self) -> serde_json::Value {
        match self {
            Self::ModelNotFound { model }
            | Self::Unhealthy { model }
            | Self::Startup { model, .. }
            | Self::BackendNotFound { model }
            | Self::Upstream { model, .. } => json!({ "model": model }),
            Self::ModelFile { model, path } => json!({ "model": model, "model_path": path }),
            Self::ExitedEarly { model, code } => json!({ "model": model, "exit_code": code }),
            Self::MissingModel => json!({}),
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_code = self.error_code();
        let details = self.details();

        // 500-class failures get full context in the log and a generic
        // outward message to avoid leaking internals
        let message = if status.is_server_error() {
            tracing::error!(
                error_code,
                error = %self,
                source = ?std::error::Error::source(&self),
                "Server error"
            );
            "Unexpected error occurred. Please try again later".to_string()
        } else {
            tracing::info!(error_code, error = %self, "Client error");
            self.to_string()
        };

        let body = Json(ErrorResponse {
            error_code,
            message,
            details,
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error_code: &'static str,
    message: String,
    details: serde_json::Value,
    timestamp: chrono::DateTime<chrono::Utc>,
}
