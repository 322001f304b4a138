//! Unit of Work
//!
//! Runs a closure against a fresh transaction and commits it when the
//! closure succeeds, rolling back otherwise. Everything the closure does
//! through the handle it receives, such as aggregate saves and outbox
//! appends, lands atomically.
//!
//! Work closures return a boxed future borrowing the handle:
//!
//! ```ignore
//! uow.execute(move |tx| {
//!     async move {
//!         repo.save(tx, &plan, expected).await?;
//!         outbox.save_event(tx, event).await?;
//!         Ok(())
//!     }
//!     .boxed()
//! })
//! .await?;
//! ```
//!
//! A scope never opens a second transaction underneath itself. Nested work
//! joins the open handle through `execute_in`; calling `execute` again from
//! inside a work closure fails with `StorageError::NestedScope`.

use std::fmt::Display;
use std::time::Instant;

use futures::future::BoxFuture;

use crate::config::RetryPolicy;
use crate::storage::{StorageError, TimeoutPhase, TransactionManager, TransactionOptions};

tokio::task_local! {
    /// Set while a work closure of this task is running
    static OPEN_SCOPE: ();
}

/// Errors that may succeed when the whole unit of work is run again
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for StorageError {
    fn is_transient(&self) -> bool {
        StorageError::is_transient(self)
    }
}

/// Transaction scope runner
#[derive(Debug, Clone)]
pub struct UnitOfWork<M> {
    manager: M,
    policy: RetryPolicy,
}

impl<M: TransactionManager> UnitOfWork<M> {
    pub fn new(manager: M) -> Self {
        Self::with_policy(manager, RetryPolicy::default())
    }

    pub fn with_policy(manager: M, policy: RetryPolicy) -> Self {
        Self { manager, policy }
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `work` in one transaction with default options
    pub async fn execute<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut M::Tx) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<StorageError> + Send,
    {
        self.run(&TransactionOptions::default(), work).await
    }

    /// Run `work` in one transaction with explicit isolation and timeouts
    ///
    /// `max_wait` bounds acquiring the transaction and `timeout` bounds the
    /// closure; either expiring fails with `StorageError::Timeout`.
    pub async fn execute_with_isolation<T, E, F>(
        &self,
        work: F,
        options: TransactionOptions,
    ) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut M::Tx) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<StorageError> + Send,
    {
        self.run(&options, work).await
    }

    /// Run `work`, retrying on transient failures
    ///
    /// Each attempt is a whole new transaction. At most `max_retries`
    /// attempts are made (at least one), sleeping `2^attempt` backoff units
    /// between them. Non-transient errors, concurrency conflicts included,
    /// are returned at once.
    pub async fn execute_with_retry<T, E, F>(&self, work: F, max_retries: u32) -> Result<T, E>
    where
        F: for<'t> FnMut(&'t mut M::Tx) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<StorageError> + Retryable + Display + Send,
    {
        self.run_with_retry(&TransactionOptions::default(), work, max_retries)
            .await
    }

    /// `execute_with_retry` with explicit transaction options
    pub async fn execute_with_retry_and_isolation<T, E, F>(
        &self,
        work: F,
        max_retries: u32,
        options: TransactionOptions,
    ) -> Result<T, E>
    where
        F: for<'t> FnMut(&'t mut M::Tx) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<StorageError> + Retryable + Display + Send,
    {
        self.run_with_retry(&options, work, max_retries).await
    }

    /// Run `work` inside an already open transaction
    ///
    /// Commit and rollback stay with whoever opened `tx`, so nested work
    /// shares the outer scope's fate.
    pub async fn execute_in<'t, T, E, F>(&self, tx: &'t mut M::Tx, work: F) -> Result<T, E>
    where
        F: FnOnce(&'t mut M::Tx) -> BoxFuture<'t, Result<T, E>>,
    {
        work(tx).await
    }

    async fn run<T, E, F>(&self, options: &TransactionOptions, work: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut M::Tx) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<StorageError> + Send,
    {
        if OPEN_SCOPE.try_with(|_| ()).is_ok() {
            tracing::error!("Unit of work started inside an open scope");
            return Err(StorageError::NestedScope.into());
        }

        let mut tx = self.begin(options).await?;

        let outcome = match options.timeout {
            Some(limit) => {
                let started = Instant::now();
                match tokio::time::timeout(limit, OPEN_SCOPE.scope((), work(&mut tx))).await {
                    Ok(result) => result,
                    Err(_) => Err(StorageError::Timeout {
                        phase: TimeoutPhase::Body,
                        elapsed: started.elapsed(),
                    }
                    .into()),
                }
            }
            None => OPEN_SCOPE.scope((), work(&mut tx)).await,
        };

        match outcome {
            Ok(value) => {
                self.manager.commit(tx).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.manager.rollback(tx).await {
                    tracing::error!(error = %rollback_err, "Rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn begin(&self, options: &TransactionOptions) -> Result<M::Tx, StorageError> {
        let Some(max_wait) = options.max_wait else {
            return self.manager.begin(options).await;
        };

        let started = Instant::now();
        match tokio::time::timeout(max_wait, self.manager.begin(options)).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout {
                phase: TimeoutPhase::Acquire,
                elapsed: started.elapsed(),
            }),
        }
    }

    async fn run_with_retry<T, E, F>(
        &self,
        options: &TransactionOptions,
        mut work: F,
        max_retries: u32,
    ) -> Result<T, E>
    where
        F: for<'t> FnMut(&'t mut M::Tx) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<StorageError> + Retryable + Display + Send,
    {
        let max_attempts = max_retries.max(1);
        let mut attempt = 1;

        loop {
            match self.run(options, &mut work).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.policy.backoff_delay(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying unit of work"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        tracing::error!(
                            attempts = attempt,
                            error = %err,
                            "Unit of work retries exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}
