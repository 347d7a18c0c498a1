use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found or expired")]
    NotFound,

    #[error("too many login attempts from this address")]
    RateLimited,
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl From<SessionError> for chatvault_core::error::ChatvaultError {
    fn from(e: SessionError) -> Self {
        use chatvault_core::error::ChatvaultError;
        match e {
            SessionError::NotFound => ChatvaultError::Unauthenticated,
            SessionError::RateLimited => ChatvaultError::RateLimited,
        }
    }
}
