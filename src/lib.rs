//! diet_core
//!
//! Write-consistency core of the diet management backend: composable
//! specifications, versioned aggregates with optimistic concurrency, a
//! retrying unit of work, and a transactional outbox.

pub mod aggregate;
pub mod config;
pub mod db;
pub mod domain;
mod error;
pub mod handlers;
pub mod outbox;
pub mod repository;
pub mod specification;
pub mod storage;
pub mod unit_of_work;
pub mod validation;

pub use config::{Config, OutboxPolicy, RetryPolicy};
pub use domain::{ConcurrencyConflict, DomainError, OperationContext};
pub use error::{AppError, AppResult, ErrorResponse};
pub use unit_of_work::{Retryable, UnitOfWork};
