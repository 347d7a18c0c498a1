use thiserror::Error;

/// Errors raised while resolving visibility scope or administering accounts.
/// Kept separate from `ChatvaultError` so callers can match on specifics
/// before the gateway maps everything down to an HTTP response.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("viewer account not found: {0}")]
    NotFound(String),

    #[error("username already in use: {0}")]
    AlreadyExists(String),

    #[error("only the master account may perform this action")]
    MasterRequired,

    #[error("storage error: {0}")]
    Storage(#[from] chatvault_core::error::ChatvaultError),
}

pub type Result<T> = std::result::Result<T, AccessError>;

impl From<AccessError> for chatvault_core::error::ChatvaultError {
    fn from(e: AccessError) -> Self {
        use chatvault_core::error::ChatvaultError;
        match e {
            AccessError::NotFound(s) => ChatvaultError::NotFound(s),
            AccessError::AlreadyExists(s) => ChatvaultError::Conflict(s),
            AccessError::MasterRequired => ChatvaultError::Forbidden(e.to_string()),
            AccessError::Storage(inner) => inner,
        }
    }
}
