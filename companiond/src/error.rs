use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use companion_core::PolicyError;
use companion_mcp::ToolServerError;
use companion_runtime::RuntimeError;
use companion_skills::SkillError;
use companion_store::StoreError;

/// Client-visible error kinds. The HTTP layer maps each kind to exactly one
/// status code; permission violations additionally carry a machine-readable
/// `code`.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    PolicyViolation(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Validation(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": message })),
            )
                .into_response(),
            Self::PolicyViolation(message) => (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({
                    "error": message,
                    "code": "permission_policy_violation",
                })),
            )
                .into_response(),
            Self::NotFound(message) => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": message })),
            )
                .into_response(),
            Self::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": message })),
            )
                .into_response(),
        }
    }
}

impl From<PolicyError> for ApiError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::Violation(_) => Self::PolicyViolation(err.to_string()),
            PolicyError::InvalidCwd(_) | PolicyError::InvalidPolicy(_) => {
                Self::Validation(err.to_string())
            }
        }
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::SessionNotFound(_) => Self::NotFound(err.to_string()),
            RuntimeError::Io(_) => Self::Internal(err.to_string()),
            _ => Self::Validation(err.to_string()),
        }
    }
}

impl From<SkillError> for ApiError {
    fn from(err: SkillError) -> Self {
        match err {
            SkillError::NotFound(_) => Self::NotFound(err.to_string()),
            // Extraction I/O problems surface as 400 on this endpoint.
            _ => Self::Validation(err.to_string()),
        }
    }
}

impl From<ToolServerError> for ApiError {
    fn from(err: ToolServerError) -> Self {
        match err {
            ToolServerError::ServerNotFound(_) => Self::NotFound(err.to_string()),
            ToolServerError::AlreadyStarting(_) => Self::Validation(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Internal(err.to_string())
    }
}
