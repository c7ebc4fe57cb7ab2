//! Error hierarchy shared by every component of the memory engine.

use thiserror::Error;
use uuid::Uuid;

/// The kinds of failure this crate's public API can surface.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("vector shape mismatch: expected {expected}, got {actual}")]
    Shape { expected: usize, actual: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate of existing memory {existing_id}")]
    Conflict { existing_id: Uuid },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("embedding provider error: {0}")]
    Upstream(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl MemoryError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn shape(expected: usize, actual: usize) -> Self {
        Self::Shape { expected, actual }
    }

    /// Whether this error reflects a recoverable, caller-actionable situation
    /// as opposed to an unexpected backend failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_) | Self::NotFound(_) | Self::Conflict { .. } | Self::Cancelled
        )
    }
}

/// Convenience alias used throughout the crate's public API.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Bridges lower-level library errors (sqlx, qdrant-client, I/O, join errors)
/// into the crate's own error type without losing context.
pub trait IntoMemoryError<T> {
    fn into_memory_error(self, context: &str) -> MemoryResult<T>;
}

impl<T, E: std::fmt::Display> IntoMemoryError<T> for Result<T, E> {
    fn into_memory_error(self, context: &str) -> MemoryResult<T> {
        self.map_err(|e| MemoryError::Storage(format!("{context}: {e}")))
    }
}

impl From<anyhow::Error> for MemoryError {
    fn from(e: anyhow::Error) -> Self {
        MemoryError::Internal(e.to_string())
    }
}

impl From<sqlx::Error> for MemoryError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => MemoryError::NotFound("row not found".to_string()),
            other => MemoryError::Storage(other.to_string()),
        }
    }
}
