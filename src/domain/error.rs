//! Domain Error Types
//!
//! Pure domain errors that don't depend on infrastructure.

use thiserror::Error;

use crate::validation::ValidationError;

/// Optimistic concurrency failure on an aggregate
///
/// Raised when a mutation or a save names an expected version that no
/// longer matches the current one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "Concurrency conflict on {aggregate_type} {aggregate_id}: expected version {expected}, found {actual}"
)]
pub struct ConcurrencyConflict {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub expected: u64,
    pub actual: u64,
}

/// Domain-specific errors
///
/// Business rule violations and invariant failures, independent of the
/// storage layer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    /// Aggregate version conflict (optimistic locking)
    #[error(transparent)]
    ConcurrencyConflict(#[from] ConcurrencyConflict),

    /// Input rejected by a validator
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Business rule violation
    #[error("Business rule violation: {0}")]
    BusinessRuleViolation(String),

    /// Aggregate does not exist
    #[error("{aggregate_type} not found: {id}")]
    NotFound { aggregate_type: String, id: String },
}

impl DomainError {
    /// Create a business rule violation
    pub fn rule(message: impl Into<String>) -> Self {
        Self::BusinessRuleViolation(message.into())
    }

    /// Create a not-found error
    pub fn not_found(aggregate_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            aggregate_type: aggregate_type.into(),
            id: id.into(),
        }
    }

    /// Check if this is a client error (user's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::BusinessRuleViolation(_) | Self::NotFound { .. }
        )
    }

    /// Check if this is a conflict error (re-read and retry may help)
    pub fn is_conflict_error(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_))
    }
}
