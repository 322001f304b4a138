//! Repository Errors

use crate::domain::ConcurrencyConflict;
use crate::storage::StorageError;

/// Errors that can occur while loading or persisting aggregates
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Stored version no longer matches the expected one
    #[error(transparent)]
    ConcurrencyConflict(#[from] ConcurrencyConflict),

    /// Insert of an id that is already taken
    #[error("{aggregate_type} already exists: {id}")]
    AlreadyExists { aggregate_type: String, id: String },

    /// Save of an aggregate that was never inserted
    #[error("{aggregate_type} not found: {id}")]
    NotFound { aggregate_type: String, id: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RepositoryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Storage(e) if e.is_transient())
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Storage(StorageError::Serialization(err))
    }
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        RepositoryError::Storage(StorageError::from(err))
    }
}
