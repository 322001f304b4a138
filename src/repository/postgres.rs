//! PostgreSQL aggregate repository
//!
//! All aggregate types share the `aggregates` table, keyed by
//! `(aggregate_type, aggregate_id)`, with the state stored as JSONB.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::aggregate::{Aggregate, Versioned};
use crate::domain::ConcurrencyConflict;
use crate::specification::{Filter, Specification};
use crate::storage::is_unique_violation;
use crate::storage::postgres::PgTx;

use super::{
    decode, encode, from_db_version, retain_satisfying, to_db_version, AggregateRepository,
    RepositoryError,
};

/// Repository over the `aggregates` table
#[derive(Debug, Clone)]
pub struct PgAggregateRepository {
    pool: PgPool,
}

impl PgAggregateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn current_version(
        tx: &mut PgTx,
        aggregate_type: &str,
        id: &str,
    ) -> Result<Option<u64>, RepositoryError> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM aggregates WHERE aggregate_type = $1 AND aggregate_id = $2",
        )
        .bind(aggregate_type)
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(version.map(from_db_version))
    }
}

#[async_trait]
impl<A: Aggregate> AggregateRepository<A> for PgAggregateRepository {
    type Tx = PgTx;

    async fn load(&self, tx: &mut PgTx, id: &str) -> Result<Option<Versioned<A>>, RepositoryError> {
        let row: Option<(i64, Value)> = sqlx::query_as(
            "SELECT version, state FROM aggregates WHERE aggregate_type = $1 AND aggregate_id = $2",
        )
        .bind(A::aggregate_type())
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|(version, state)| decode(id, from_db_version(version), state))
            .transpose()
    }

    async fn find(&self, id: &str) -> Result<Option<Versioned<A>>, RepositoryError> {
        let row: Option<(i64, Value)> = sqlx::query_as(
            "SELECT version, state FROM aggregates WHERE aggregate_type = $1 AND aggregate_id = $2",
        )
        .bind(A::aggregate_type())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(version, state)| decode(id, from_db_version(version), state))
            .transpose()
    }

    async fn insert(&self, tx: &mut PgTx, aggregate: &Versioned<A>) -> Result<(), RepositoryError> {
        let state = encode(aggregate)?;

        let result = sqlx::query(
            r#"
            INSERT INTO aggregates (aggregate_type, aggregate_id, version, state)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(A::aggregate_type())
        .bind(aggregate.id())
        .bind(to_db_version(aggregate.version()))
        .bind(state)
        .execute(&mut **tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(RepositoryError::AlreadyExists {
                aggregate_type: A::aggregate_type().to_string(),
                id: aggregate.id().to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(
        &self,
        tx: &mut PgTx,
        aggregate: &Versioned<A>,
        expected_version: u64,
    ) -> Result<(), RepositoryError> {
        let state = encode(aggregate)?;

        // Conditional write: under READ COMMITTED a concurrent winner makes
        // this match zero rows once its commit is visible
        let result = sqlx::query(
            r#"
            UPDATE aggregates
            SET version = $3, state = $4, updated_at = NOW()
            WHERE aggregate_type = $1 AND aggregate_id = $2 AND version = $5
            "#,
        )
        .bind(A::aggregate_type())
        .bind(aggregate.id())
        .bind(to_db_version(aggregate.version()))
        .bind(state)
        .bind(to_db_version(expected_version))
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match Self::current_version(tx, A::aggregate_type(), aggregate.id()).await? {
            Some(actual) => {
                tracing::debug!(
                    aggregate_type = A::aggregate_type(),
                    aggregate_id = %aggregate.id(),
                    expected = expected_version,
                    actual,
                    "Conditional save lost the race"
                );
                Err(ConcurrencyConflict {
                    aggregate_type: A::aggregate_type().to_string(),
                    aggregate_id: aggregate.id().to_string(),
                    expected: expected_version,
                    actual,
                }
                .into())
            }
            None => Err(RepositoryError::NotFound {
                aggregate_type: A::aggregate_type().to_string(),
                id: aggregate.id().to_string(),
            }),
        }
    }

    async fn find_matching(
        &self,
        spec: &dyn Specification<A>,
        limit: usize,
    ) -> Result<Vec<Versioned<A>>, RepositoryError> {
        let filter = spec.to_filter();
        tracing::debug!(
            aggregate_type = A::aggregate_type(),
            spec = %spec.name(),
            pushdown = filter.is_some(),
            limit,
            "Finding matching aggregates"
        );

        let mut qb = matching_query(A::aggregate_type(), filter.as_ref(), limit);
        let rows: Vec<(String, i64, Value)> = qb.build_query_as().fetch_all(&self.pool).await?;

        let candidates = rows
            .into_iter()
            .map(|(id, version, state)| decode(id, from_db_version(version), state))
            .collect::<Result<Vec<Versioned<A>>, _>>()?;

        if filter.is_some() {
            Ok(candidates)
        } else {
            Ok(retain_satisfying(candidates, spec, limit))
        }
    }
}

/// Select candidates of one type, ordered bytewise by id
///
/// With a filter the predicate and the limit run in the database;
/// without one every aggregate of the type is returned.
fn matching_query(
    aggregate_type: &'static str,
    filter: Option<&Filter>,
    limit: usize,
) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::<Postgres>::new(
        "SELECT aggregate_id, version, state FROM aggregates WHERE aggregate_type = ",
    );
    qb.push_bind(aggregate_type);

    if let Some(filter) = filter {
        qb.push(" AND ");
        filter.push_sql("state", &mut qb);
        qb.push(" ORDER BY aggregate_id COLLATE \"C\" LIMIT ");
        qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    } else {
        qb.push(" ORDER BY aggregate_id COLLATE \"C\"");
    }

    qb
}
