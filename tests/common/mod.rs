//! Common test utilities
#![allow(dead_code)]

use std::time::Duration;

use chrono::NaiveDate;
use futures::FutureExt;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use diet_core::aggregate::{Patient, Versioned};
use diet_core::repository::AggregateRepository;
use diet_core::storage::{InMemoryStore, TransactionManager};
use diet_core::{AppError, RetryPolicy, UnitOfWork};

/// Setup test database - truncate the write-path tables
pub async fn setup_test_db() -> PgPool {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for tests");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    sqlx::query("TRUNCATE TABLE aggregates, outbox_events")
        .execute(&pool)
        .await
        .expect("Failed to clean up DB");

    pool
}

/// Unit of work with millisecond backoff
pub fn fast_uow<M: TransactionManager>(manager: M) -> UnitOfWork<M> {
    UnitOfWork::with_policy(
        manager,
        RetryPolicy {
            max_retries: 3,
            backoff_base: Duration::from_millis(1),
        },
    )
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Store a patient directly, bypassing the handlers
pub async fn seed_patient(store: &InMemoryStore, id: &str, patient: Patient) {
    let repo = store.clone();
    let aggregate = Versioned::create(id, patient);

    fast_uow(store.clone())
        .execute(move |tx| {
            async move { repo.insert(tx, &aggregate).await.map_err(AppError::from) }.boxed()
        })
        .await
        .expect("Failed to seed patient");
}
