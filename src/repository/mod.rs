//! Repository module
//!
//! Persistence of versioned aggregates. Writes go through a transaction
//! handle from the backend's `TransactionManager`; `save` is a conditional
//! write that only lands if the stored version still equals the version
//! the caller read.

mod error;
pub mod postgres;

pub use error::RepositoryError;
pub use postgres::PgAggregateRepository;

use async_trait::async_trait;
use serde_json::Value;

use crate::aggregate::{Aggregate, Versioned};
use crate::specification::Specification;

/// Aggregate persistence
#[async_trait]
pub trait AggregateRepository<A: Aggregate>: Send + Sync {
    /// Transaction handle shared with the backend's `TransactionManager`
    type Tx: Send;

    /// Load an aggregate inside a transaction
    async fn load(
        &self,
        tx: &mut Self::Tx,
        id: &str,
    ) -> Result<Option<Versioned<A>>, RepositoryError>;

    /// Read the latest committed aggregate, outside any transaction
    async fn find(&self, id: &str) -> Result<Option<Versioned<A>>, RepositoryError>;

    /// Store a freshly created aggregate
    ///
    /// Fails with `AlreadyExists` when the id is taken.
    async fn insert(
        &self,
        tx: &mut Self::Tx,
        aggregate: &Versioned<A>,
    ) -> Result<(), RepositoryError>;

    /// Persist a mutated aggregate if the stored version is still `expected_version`
    ///
    /// A mismatch fails with `ConcurrencyConflict` carrying the stored
    /// version; an unknown id fails with `NotFound`.
    async fn save(
        &self,
        tx: &mut Self::Tx,
        aggregate: &Versioned<A>,
        expected_version: u64,
    ) -> Result<(), RepositoryError>;

    /// Up to `limit` committed aggregates satisfying `spec`, ordered by id
    ///
    /// When the specification has a filter it is evaluated by the store;
    /// otherwise candidates are loaded and checked in memory.
    async fn find_matching(
        &self,
        spec: &dyn Specification<A>,
        limit: usize,
    ) -> Result<Vec<Versioned<A>>, RepositoryError>;
}

/// Rebuild a `Versioned<A>` from its stored document
pub(crate) fn decode<A: Aggregate>(
    id: impl Into<String>,
    version: u64,
    state: Value,
) -> Result<Versioned<A>, RepositoryError> {
    let state: A = serde_json::from_value(state)?;
    Ok(Versioned::reconstitute(id, version, state))
}

/// Serialize an aggregate state to its stored document
pub(crate) fn encode<A: Aggregate>(aggregate: &Versioned<A>) -> Result<Value, RepositoryError> {
    Ok(serde_json::to_value(aggregate.state())?)
}

/// In-memory fallback for specifications without a filter
pub(crate) fn retain_satisfying<A: Aggregate>(
    candidates: Vec<Versioned<A>>,
    spec: &dyn Specification<A>,
    limit: usize,
) -> Vec<Versioned<A>> {
    candidates
        .into_iter()
        .filter(|candidate| spec.is_satisfied_by(candidate.state()))
        .take(limit)
        .collect()
}

fn to_db_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

fn from_db_version(version: i64) -> u64 {
    u64::try_from(version).unwrap_or_default()
}
