use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("container runtime error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("upstream error: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("image build failed: {0}")]
    ImageBuildFailed(String),
    #[error("sandbox create failed: {0}")]
    SandboxCreateFailed(String),
    #[error("service unreachable: {0}")]
    ServiceUnreachable(String),
    #[error("upstream timeout")]
    UpstreamTimeout,
    #[error("schema migration failed: {0}")]
    SchemaMigrationFailed(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ImageBuildFailed(_) | AppError::SandboxCreateFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::ServiceUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::SchemaMigrationFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Db(_) | AppError::Docker(_) | AppError::Upstream(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        match status {
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST | StatusCode::CONFLICT => {
                tracing::warn!(error = %self, "request rejected");
            }
            _ => {
                tracing::error!(error = %self, "request failed");
            }
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
