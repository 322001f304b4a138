//! Storage module
//!
//! The transactional execution context the rest of the core runs on.
//! A backend supplies a `TransactionManager` plus repository and outbox
//! implementations that all share the same transaction handle type, so a
//! single handle can carry an aggregate write and its outbox record.
//!
//! Backends:
//! - `postgres`: PostgreSQL through sqlx
//! - `memory`: in-process store used by tests and embedded setups

mod error;
pub mod memory;
pub mod postgres;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

pub use error::{StorageError, TimeoutPhase};
pub(crate) use error::is_unique_violation;
pub use memory::{InMemoryStore, MemoryTransaction};
pub use postgres::PgTransactionManager;

/// Standard SQL isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL keyword form, as used by `SET TRANSACTION ISOLATION LEVEL`
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Options requested when opening a transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Isolation level; `None` keeps the backend default
    pub isolation: Option<IsolationLevel>,
    /// Time allowed to acquire the transaction
    pub max_wait: Option<Duration>,
    /// Time allowed for the transaction body
    pub timeout: Option<Duration>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Opens, commits and rolls back transactions for one backend
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Transaction handle passed to repositories and the outbox
    type Tx: Send;

    /// Open a transaction with the requested options
    async fn begin(&self, options: &TransactionOptions) -> Result<Self::Tx, StorageError>;

    /// Make every write performed through `tx` durable and visible
    async fn commit(&self, tx: Self::Tx) -> Result<(), StorageError>;

    /// Discard every write performed through `tx`
    async fn rollback(&self, tx: Self::Tx) -> Result<(), StorageError>;
}
