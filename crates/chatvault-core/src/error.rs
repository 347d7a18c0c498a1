use thiserror::Error;

/// The error kinds named by the service's HTTP contract (§7), independent of
/// transport. Gateway handlers map each variant to an HTTP status and a
/// short client-facing code.
#[derive(Debug, Error)]
pub enum ChatvaultError {
    #[error("authentication required")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("rate limited, retry later")]
    RateLimited,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatvaultError {
    /// Short uppercase code surfaced to clients alongside the HTTP status.
    pub fn code(&self) -> &'static str {
        match self {
            ChatvaultError::Unauthenticated => "AUTH_FAILED",
            ChatvaultError::Forbidden(_) => "FORBIDDEN",
            ChatvaultError::RateLimited => "RATE_LIMITED",
            ChatvaultError::NotFound(_) => "NOT_FOUND",
            ChatvaultError::BadRequest(_) => "BAD_REQUEST",
            ChatvaultError::Conflict(_) => "CONFLICT",
            ChatvaultError::Config(_) => "CONFIG_ERROR",
            ChatvaultError::Storage(_) => "INTERNAL",
            ChatvaultError::Internal(_) => "INTERNAL",
        }
    }

    /// HTTP status this error kind maps to.
    pub fn status(&self) -> u16 {
        match self {
            ChatvaultError::Unauthenticated => 401,
            ChatvaultError::Forbidden(_) => 403,
            ChatvaultError::RateLimited => 429,
            ChatvaultError::NotFound(_) => 404,
            ChatvaultError::BadRequest(_) => 400,
            ChatvaultError::Conflict(_) => 409,
            ChatvaultError::Config(_) => 500,
            ChatvaultError::Storage(_) => 500,
            ChatvaultError::Internal(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatvaultError>;
