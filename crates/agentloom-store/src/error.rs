//! Error types for the agentloom-store crate.

use agentloom_workflow::MemoryError;
use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the SQLite session store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored payload could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A stored value could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// A blocking task was cancelled or panicked, or the connection lock
    /// was poisoned.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

impl From<StoreError> for MemoryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound {
                entity: "session",
                id,
            } => MemoryError::SessionNotFound { session_id: id },
            other => MemoryError::Backend {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_session_maps_to_session_not_found() {
        let err: MemoryError = StoreError::NotFound {
            entity: "session",
            id: "s-1".into(),
        }
        .into();
        assert_eq!(
            err,
            MemoryError::SessionNotFound {
                session_id: "s-1".into()
            }
        );
    }

    #[test]
    fn other_errors_become_backend_errors() {
        let err: MemoryError = StoreError::TaskJoin("gone".into()).into();
        assert!(matches!(err, MemoryError::Backend { reason } if reason.contains("gone")));
    }
}
