use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::channel::ChannelError;
use crate::store::StoreError;

/// Orchestrator-level error.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Same identifier submitted with different content while not `failed`.
    #[error("{entity} '{id}' already exists with different content (status {status})")]
    DuplicateEntity {
        entity: &'static str,
        id: String,
        status: String,
    },

    /// A message arrived on a topic that never carries it, or with the wrong shape.
    #[error("Unexpected payload: {0}")]
    UnexpectedPayload(String),

    /// A message refers to state that must exist but does not.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl PipelineError {
    /// Whether redelivering the message could ever succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Store(_) | PipelineError::Channel(_))
    }
}

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Pipeline error: {0}")]
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::DuplicateEntity { .. } => AppError::Conflict(e.to_string()),
            PipelineError::Store(store) => AppError::Store(store),
            other => AppError::Pipeline(other),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::Store(e) => {
                tracing::error!("Store error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STORE_ERROR",
                    "A storage error occurred".to_string(),
                )
            }
            AppError::Pipeline(e) => {
                tracing::error!("Pipeline error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "PIPELINE_ERROR",
                    "The pipeline could not accept the request".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_provider_errors_are_retryable() {
        assert!(!PipelineError::UnexpectedPayload("x".into()).is_retryable());
        assert!(!PipelineError::InvariantViolation("x".into()).is_retryable());
        let corrupt = StoreError::Corrupt(crate::models::StatusParseError::new("decision", "maybe"));
        assert!(PipelineError::Store(corrupt).is_retryable());
    }

    #[test]
    fn test_duplicate_entity_maps_to_conflict() {
        let err = AppError::from(PipelineError::DuplicateEntity {
            entity: "job",
            id: "job123".to_string(),
            status: "summarized".to_string(),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
