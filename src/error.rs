//! Error handling module
//!
//! Application-level error type returned by command handlers, and its
//! conversion into a caller-facing error body.

use serde::Serialize;

use crate::domain::{ConcurrencyConflict, DomainError};
use crate::outbox::OutboxError;
use crate::repository::RepositoryError;
use crate::storage::StorageError;
use crate::unit_of_work::Retryable;
use crate::validation::ValidationError;

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Client errors
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    ConcurrencyConflict(ConcurrencyConflict),

    #[error("{aggregate_type} already exists: {id}")]
    AlreadyExists { aggregate_type: String, id: String },

    // Domain errors
    #[error(transparent)]
    Domain(DomainError),

    // Server errors
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Outbox error: {0}")]
    Outbox(OutboxError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ConcurrencyConflict> for AppError {
    fn from(conflict: ConcurrencyConflict) -> Self {
        AppError::ConcurrencyConflict(conflict)
    }
}

impl From<DomainError> for AppError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::ConcurrencyConflict(conflict) => AppError::ConcurrencyConflict(conflict),
            DomainError::Validation(validation) => AppError::Validation(validation),
            other => AppError::Domain(other),
        }
    }
}

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::ConcurrencyConflict(conflict) => {
                AppError::ConcurrencyConflict(conflict)
            }
            RepositoryError::AlreadyExists { aggregate_type, id } => {
                AppError::AlreadyExists { aggregate_type, id }
            }
            RepositoryError::NotFound { aggregate_type, id } => {
                AppError::Domain(DomainError::NotFound { aggregate_type, id })
            }
            RepositoryError::Storage(e) => AppError::Storage(e),
        }
    }
}

impl From<OutboxError> for AppError {
    fn from(err: OutboxError) -> Self {
        match err {
            OutboxError::Storage(e) => AppError::Storage(e),
            other => AppError::Outbox(other),
        }
    }
}

impl Retryable for AppError {
    fn is_transient(&self) -> bool {
        matches!(self, AppError::Storage(e) if e.is_transient())
    }
}

/// Error body handed to callers
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Whether repeating the same request may succeed
    pub retryable: bool,
}

impl AppError {
    /// Stable machine-readable code
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_failed",
            AppError::ConcurrencyConflict(_) => "concurrency_conflict",
            AppError::AlreadyExists { .. } => "already_exists",
            AppError::Domain(DomainError::NotFound { .. }) => "not_found",
            AppError::Domain(DomainError::BusinessRuleViolation(_)) => "business_rule_violation",
            AppError::Domain(DomainError::ConcurrencyConflict(_)) => "concurrency_conflict",
            AppError::Domain(DomainError::Validation(_)) => "validation_failed",
            AppError::Storage(e) if e.is_transient() => "storage_unavailable",
            AppError::Storage(_) => "storage_error",
            AppError::Outbox(_) => "outbox_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Check if this is a client error (caller's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AppError::Validation(_)
                | AppError::ConcurrencyConflict(_)
                | AppError::AlreadyExists { .. }
                | AppError::Domain(_)
        )
    }

    /// Message safe to show to an end user
    pub fn user_message(&self) -> String {
        match self {
            AppError::ConcurrencyConflict(_)
            | AppError::Domain(DomainError::ConcurrencyConflict(_)) => {
                "This record changed since you last read it. Reload it and try again.".to_string()
            }
            AppError::Storage(e) if e.is_transient() => {
                "The service is busy right now. Please try again shortly.".to_string()
            }
            e if e.is_client_error() => e.to_string(),
            _ => "An internal error occurred".to_string(),
        }
    }

    /// Build the caller-facing error body
    ///
    /// Server-side failures are logged here and their details withheld.
    pub fn to_response(&self) -> ErrorResponse {
        let details = match self {
            AppError::ConcurrencyConflict(conflict) => Some(format!(
                "expected version {}, found {}",
                conflict.expected, conflict.actual
            )),
            AppError::Validation(v) => Some(v.field.clone()),
            AppError::Domain(DomainError::NotFound { id, .. }) => Some(id.clone()),
            AppError::Storage(e) => {
                tracing::error!(error = %e, transient = e.is_transient(), "Storage error");
                None
            }
            AppError::Outbox(e) => {
                tracing::error!(error = %e, "Outbox error");
                None
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                None
            }
            _ => None,
        };

        ErrorResponse {
            error: self.user_message(),
            error_code: self.error_code().to_string(),
            details,
            retryable: self.is_transient(),
        }
    }
}
