//! PostgreSQL transaction manager
//!
//! Opens sqlx transactions on a `PgPool` and applies the requested
//! isolation level and statement timeout.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};

use super::{StorageError, TransactionManager, TransactionOptions};

/// Transaction handle shared by the PostgreSQL repository and outbox
pub type PgTx = Transaction<'static, Postgres>;

/// Transaction manager backed by a PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PgTransactionManager {
    pool: PgPool,
}

impl PgTransactionManager {
    /// Create a new transaction manager with a database pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransactionManager for PgTransactionManager {
    type Tx = PgTx;

    async fn begin(&self, options: &TransactionOptions) -> Result<PgTx, StorageError> {
        let mut tx = self.pool.begin().await?;

        // SET TRANSACTION must run before any other statement in the transaction
        if let Some(level) = options.isolation {
            sqlx::query(&format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()))
                .execute(&mut *tx)
                .await?;
        }

        // Server-side guard in addition to the client-side body timeout
        if let Some(timeout) = options.timeout {
            sqlx::query(&format!(
                "SET LOCAL statement_timeout = {}",
                timeout.as_millis()
            ))
            .execute(&mut *tx)
            .await?;
        }

        Ok(tx)
    }

    async fn commit(&self, tx: PgTx) -> Result<(), StorageError> {
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: PgTx) -> Result<(), StorageError> {
        tx.rollback().await?;
        Ok(())
    }
}
