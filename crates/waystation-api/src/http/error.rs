//! Application error type mapping to HTTP status codes and envelope format.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use waystation_core::workflow::error::GatewayError;
use waystation_types::error::RepositoryError;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Errors raised while handling a trigger or a cancel.
    Gateway(GatewayError),
    /// Ledger read failures on the query endpoints.
    Repository(RepositoryError),
    /// A run or resource that does not exist.
    NotFound(String),
}

impl From<GatewayError> for AppError {
    fn from(e: GatewayError) -> Self {
        AppError::Gateway(e)
    }
}

impl From<RepositoryError> for AppError {
    fn from(e: RepositoryError) -> Self {
        AppError::Repository(e)
    }
}

impl AppError {
    /// HTTP status and machine-readable code.
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Gateway(GatewayError::Auth(_)) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            AppError::Gateway(GatewayError::UnknownWorkflow(_)) => {
                (StatusCode::NOT_FOUND, "WORKFLOW_NOT_FOUND")
            }
            AppError::Gateway(GatewayError::RunNotFound(_)) | AppError::NotFound(_) => {
                (StatusCode::NOT_FOUND, "RUN_NOT_FOUND")
            }
            AppError::Gateway(GatewayError::WorkflowMismatch { .. }) => {
                (StatusCode::CONFLICT, "WORKFLOW_MISMATCH")
            }
            AppError::Gateway(GatewayError::InvalidRequest(_)) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
            }
            AppError::Gateway(GatewayError::Repository(RepositoryError::Connection))
            | AppError::Repository(RepositoryError::Connection) => {
                (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_UNAVAILABLE")
            }
            AppError::Gateway(GatewayError::Repository(_)) | AppError::Repository(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR")
            }
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::Gateway(e) => e.to_string(),
            AppError::Repository(e) => e.to_string(),
            AppError::NotFound(id) => format!("workflow run '{id}' not found"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = self.message();
        if status.is_server_error() {
            tracing::error!(code, error = %message, "request failed");
        } else {
            tracing::debug!(code, error = %message, "request rejected");
        }

        let body = ApiResponse::error(code, &message, Uuid::now_v7().to_string(), 0);
        (status, Json(body)).into_response()
    }
}
