use crate::access::quota::QuotaStatus;
use thiserror::Error;

/// Domain errors for the access-control subsystem and its HTTP surface.
///
/// Callers are expected to match on the variant rather than downcast; each
/// variant maps to exactly one HTTP status in the server layer.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    Conflict(String),
    #[error("Authentication required")]
    Unauthorized,
    #[error("{message}")]
    Denied {
        message: String,
        quota: Option<QuotaStatus>,
    },
    #[error("Database error: {0}")]
    Persistence(#[from] sqlx::Error),
    #[error("Provider error: {0}")]
    Provider(String),
}
