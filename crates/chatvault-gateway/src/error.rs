use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chatvault_access::AccessError;
use chatvault_core::error::ChatvaultError;
use chatvault_sessions::SessionError;
use serde_json::json;

/// Wraps [`ChatvaultError`] for the HTTP boundary: maps each kind to its
/// status code and short uppercase code, per the service's error contract.
pub struct ApiError(ChatvaultError);

impl From<ChatvaultError> for ApiError {
    fn from(e: ChatvaultError) -> Self {
        Self(e)
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        Self(ChatvaultError::from(e))
    }
}

impl From<AccessError> for ApiError {
    fn from(e: AccessError) -> Self {
        Self(ChatvaultError::from(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "unhandled request error");
        }
        let body = Json(json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
