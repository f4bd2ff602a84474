// crates/server/src/error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use jobcast_server_jobs::RegistryError;
use serde::Serialize;
use thiserror::Error;

/// Structured JSON error response for API errors
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// API error types that map to HTTP status codes
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_response) = match &self {
            ApiError::JobNotFound(id) => {
                tracing::debug!(runner_id = %id, "Job not found");
                (
                    StatusCode::NOT_FOUND,
                    ErrorResponse::with_details("Job not found", format!("Runner ID: {}", id)),
                )
            }
            ApiError::Registry(registry_err) => {
                let (status, error_msg) = match registry_err {
                    RegistryError::DuplicateRunner(id) => {
                        tracing::warn!(runner_id = %id, "Duplicate runner");
                        (StatusCode::CONFLICT, "Runner already registered")
                    }
                    RegistryError::UnknownRunner(id) => {
                        tracing::warn!(runner_id = %id, "Unknown runner");
                        (StatusCode::NOT_FOUND, "Unknown runner")
                    }
                };
                (
                    status,
                    ErrorResponse::with_details(error_msg, registry_err.to_string()),
                )
            }
        };

        (status, Json(error_response)).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    /// Helper to extract status code and body from a response
    async fn extract_response(response: Response) -> (StatusCode, ErrorResponse) {
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let error_response: ErrorResponse = serde_json::from_slice(&body).unwrap();
        (status, error_response)
    }

    #[tokio::test]
    async fn test_job_not_found_returns_404() {
        let response = ApiError::JobNotFound("r42".to_string()).into_response();
        let (status, body) = extract_response(response).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error, "Job not found");
        assert!(body.details.unwrap().contains("r42"));
    }

    #[tokio::test]
    async fn test_duplicate_runner_returns_409() {
        let error: ApiError = RegistryError::DuplicateRunner("r1".into()).into();
        let (status, body) = extract_response(error.into_response()).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.error, "Runner already registered");
        assert!(body.details.unwrap().contains("r1"));
    }

    #[tokio::test]
    async fn test_unknown_runner_returns_404() {
        let error: ApiError = RegistryError::UnknownRunner("ghost".into()).into();
        let (status, body) = extract_response(error.into_response()).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error, "Unknown runner");
    }
}
