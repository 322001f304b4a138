//! Integration tests against PostgreSQL
//!
//! Need `DATABASE_URL` and the schema from `migrations/`. They share one
//! database, so run them with `cargo test -- --ignored --test-threads=1`.

use futures::FutureExt;

use diet_core::aggregate::{DietPlan, Patient, Versioned};
use diet_core::domain::{AgeBetween, OperationContext};
use diet_core::handlers::{
    CreateDietPlanCommand, CreateDietPlanHandler, PlanChange, UpdateDietPlanCommand,
    UpdateDietPlanHandler,
};
use diet_core::outbox::{NewOutboxEvent, OutboxStore, PgOutboxStore};
use diet_core::repository::{AggregateRepository, PgAggregateRepository};
use diet_core::specification::Specification;
use diet_core::storage::PgTransactionManager;
use diet_core::{db, AppError};

mod common;

struct Backend {
    manager: PgTransactionManager,
    repository: PgAggregateRepository,
    outbox: PgOutboxStore,
}

async fn backend() -> Backend {
    let pool = common::setup_test_db().await;
    assert!(db::check_schema(&pool).await.unwrap(), "run the migrations first");

    Backend {
        manager: PgTransactionManager::new(pool.clone()),
        repository: PgAggregateRepository::new(pool.clone()),
        outbox: PgOutboxStore::new(pool),
    }
}

async fn seed_patient(backend: &Backend, id: &str, patient: Patient) {
    let repo = backend.repository.clone();
    let aggregate = Versioned::create(id, patient);

    common::fast_uow(backend.manager.clone())
        .execute(move |tx| {
            async move { repo.insert(tx, &aggregate).await.map_err(AppError::from) }.boxed()
        })
        .await
        .unwrap();
}

#[tokio::test]
#[ignore]
async fn test_create_and_conflicting_update() {
    let backend = backend().await;
    let patient =
        Patient::register("clinic-1", "Gabriela Nunes", common::date(1988, 4, 9)).unwrap();
    seed_patient(&backend, "patient-1", patient).await;

    let context = OperationContext::new("clinic-1");
    let uow = common::fast_uow(backend.manager.clone());
    let create =
        CreateDietPlanHandler::new(uow.clone(), backend.repository.clone(), backend.outbox.clone());
    let update =
        UpdateDietPlanHandler::new(uow, backend.repository.clone(), backend.outbox.clone());

    create
        .execute(
            CreateDietPlanCommand::new("patient-1", "Vegetarian", 2100).with_plan_id("plan-1"),
            &context,
        )
        .await
        .unwrap();

    let adjust = |calories| {
        UpdateDietPlanCommand::new(
            "plan-1",
            0,
            PlanChange::AdjustCalories {
                daily_calories: calories,
            },
        )
    };

    update.execute(adjust(2000), &context).await.unwrap();
    let err = update.execute(adjust(1900), &context).await.unwrap_err();
    assert!(matches!(err, AppError::ConcurrencyConflict(_)));

    let plan: Versioned<DietPlan> = backend.repository.find("plan-1").await.unwrap().unwrap();
    assert_eq!(plan.version(), 1);
    assert_eq!(plan.state().daily_calories(), 2000);

    let pending = backend.outbox.get_unprocessed_events(10).await.unwrap();
    let types: Vec<&str> = pending.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, ["DietPlanDrafted", "CalorieTargetAdjusted"]);
}

#[tokio::test]
#[ignore]
async fn test_failed_body_rolls_back_both_writes() {
    let backend = backend().await;
    let uow = common::fast_uow(backend.manager.clone());

    let repo = backend.repository.clone();
    let outbox = backend.outbox.clone();
    let result: Result<(), AppError> = uow
        .execute(move |tx| {
            async move {
                let patient =
                    Patient::register("clinic-1", "Hugo Prado", common::date(1970, 1, 1))?;
                repo.insert(tx, &Versioned::create("patient-9", patient)).await?;
                let event =
                    NewOutboxEvent::new("patient-9", "Patient", "PatientRegistered", "{}");
                outbox.save_event(tx, event).await?;
                Err::<(), _>(AppError::Internal("abort".to_string()))
            }
            .boxed()
        })
        .await;

    assert!(result.is_err());
    let patient: Option<Versioned<Patient>> = backend.repository.find("patient-9").await.unwrap();
    assert!(patient.is_none());
    assert!(backend.outbox.get_unprocessed_events(10).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore]
async fn test_find_matching_pushes_filter_down() {
    let backend = backend().await;
    for (id, year, active) in [("p-1", 1950, true), ("p-2", 1990, true), ("p-3", 1992, false)] {
        let mut patient =
            Patient::register("clinic-1", "Iris Campos", common::date(year, 2, 2)).unwrap();
        patient.active = active;
        seed_patient(&backend, id, patient).await;
    }

    let spec = diet_core::domain::ActivePatient
        .and(AgeBetween::new(18, 60, common::date(2026, 6, 1)));
    let found = <PgAggregateRepository as AggregateRepository<Patient>>::find_matching(
        &backend.repository,
        &spec,
        10,
    )
    .await
    .unwrap();

    let ids: Vec<&str> = found.iter().map(|p| p.id()).collect();
    assert_eq!(ids, ["p-2"]);
}

#[tokio::test]
#[ignore]
async fn test_outbox_bookkeeping() {
    let backend = backend().await;
    let outbox = backend.outbox.clone().with_max_retries(2);
    let uow = common::fast_uow(backend.manager.clone());

    let writer = outbox.clone();
    let event = uow
        .execute(move |tx| {
            async move {
                let event = NewOutboxEvent::new("plan-7", "DietPlan", "DietPlanArchived", "{}");
                let record = writer.save_event(tx, event).await?;
                Ok::<_, AppError>(record)
            }
            .boxed()
        })
        .await
        .unwrap();

    assert_eq!(outbox.increment_retry(event.id, "timeout").await.unwrap(), 1);
    assert_eq!(outbox.increment_retry(event.id, "timeout").await.unwrap(), 2);
    assert!(outbox.get_unprocessed_events(10).await.unwrap().is_empty());
    assert_eq!(outbox.get_quarantined_events(10).await.unwrap().len(), 1);

    outbox.requeue(event.id).await.unwrap();
    outbox.mark_as_processed(event.id).await.unwrap();
    outbox.mark_as_processed(event.id).await.unwrap();

    let stored = outbox.get_event(event.id).await.unwrap().unwrap();
    assert!(stored.is_processed());
    assert_eq!(stored.last_error.as_deref(), Some("timeout"));
}

#[tokio::test]
#[ignore]
async fn test_find_matching_orders_ids_bytewise() {
    let backend = backend().await;
    for id in ["b-2", "B-1", "a-3"] {
        let patient =
            Patient::register("clinic-1", "Joana Melo", common::date(1980, 7, 7)).unwrap();
        seed_patient(&backend, id, patient).await;
    }

    let found = <PgAggregateRepository as AggregateRepository<Patient>>::find_matching(
        &backend.repository,
        &diet_core::domain::ActivePatient,
        2,
    )
    .await
    .unwrap();

    let ids: Vec<&str> = found.iter().map(|p| p.id()).collect();
    assert_eq!(ids, ["B-1", "a-3"]);
}
