//! Integration tests for the transactional outbox over the in-memory backend

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use diet_core::aggregate::{MealSlot, Patient};
use diet_core::domain::{DietPlanEvent, OperationContext};
use diet_core::handlers::{
    CreateDietPlanCommand, CreateDietPlanHandler, PlanChange, UpdateDietPlanCommand,
    UpdateDietPlanHandler,
};
use diet_core::outbox::{BroadcastSink, OutboxProcessor, OutboxStore, OutboxWorker};
use diet_core::storage::InMemoryStore;
use diet_core::OutboxPolicy;

mod common;

fn policy() -> OutboxPolicy {
    OutboxPolicy {
        max_retries: 3,
        batch_size: 10,
        drain_interval: Duration::from_millis(10),
        delivery_timeout: Duration::from_secs(1),
    }
}

async fn store_with_plan() -> InMemoryStore {
    let store = InMemoryStore::new();
    let patient = Patient::register("clinic-1", "Bruno Lima", common::date(1979, 3, 2)).unwrap();
    common::seed_patient(&store, "patient-1", patient).await;

    CreateDietPlanHandler::new(common::fast_uow(store.clone()), store.clone(), store.clone())
        .execute(
            CreateDietPlanCommand::new("patient-1", "Low carb", 1900).with_plan_id("plan-1"),
            &OperationContext::new("clinic-1"),
        )
        .await
        .unwrap();

    store
}

#[tokio::test]
async fn test_end_to_end_plan_lifecycle_reaches_subscribers() {
    let store = store_with_plan().await;
    let context = OperationContext::new("clinic-1").with_actor("dietitian-3");
    let update =
        UpdateDietPlanHandler::new(common::fast_uow(store.clone()), store.clone(), store.clone());

    let changes = [
        PlanChange::AddMeal {
            meal: MealSlot {
                name: "lunch".to_string(),
                calories: 700,
            },
        },
        PlanChange::Activate,
    ];
    for (version, change) in changes.into_iter().enumerate() {
        update
            .execute(UpdateDietPlanCommand::new("plan-1", version as u64, change), &context)
            .await
            .unwrap();
    }

    let sink = BroadcastSink::new(16);
    let mut rx = sink.subscribe();
    let processor = OutboxProcessor::with_policy(store.clone(), Arc::new(sink), &policy());

    let report = processor.process_events().await.unwrap();
    assert_eq!(report.fetched, 3);
    assert_eq!(report.delivered, 3);
    assert_eq!(report.failed, 0);

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(rx.recv().await.unwrap());
    }
    let types: Vec<&str> = received.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, ["DietPlanDrafted", "MealAdded", "DietPlanActivated"]);

    let activated: DietPlanEvent = serde_json::from_str(&received[2].payload).unwrap();
    assert!(matches!(activated, DietPlanEvent::DietPlanActivated { .. }));

    assert!(store.get_unprocessed_events(10).await.unwrap().is_empty());
    assert!(store.outbox_snapshot().await.iter().all(|e| e.is_processed()));

    // A second pass finds nothing left to deliver
    let report = processor.process_events().await.unwrap();
    assert_eq!(report.fetched, 0);
}

#[tokio::test]
async fn test_mark_as_processed_is_idempotent() {
    let store = store_with_plan().await;
    let event = store.outbox_snapshot().await.remove(0);

    store.mark_as_processed(event.id).await.unwrap();
    let first = store.get_event(event.id).await.unwrap().unwrap();

    store.mark_as_processed(event.id).await.unwrap();
    let second = store.get_event(event.id).await.unwrap().unwrap();

    assert!(first.is_processed());
    assert_eq!(first.processed_at, second.processed_at);

    // Failures reported after delivery are ignored
    assert_eq!(store.increment_retry(event.id, "late failure").await.unwrap(), 0);
}

#[tokio::test]
async fn test_failing_sink_quarantines_then_requeue_delivers() {
    let store = store_with_plan().await;

    // No subscribers: every publish fails
    let sink = BroadcastSink::new(16);
    let processor = OutboxProcessor::with_policy(store.clone(), Arc::new(sink.clone()), &policy());

    for pass in 1..=3 {
        let report = processor.process_events().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.quarantined, usize::from(pass == 3));
    }

    let report = processor.process_events().await.unwrap();
    assert_eq!(report.fetched, 0);

    let quarantined = store.get_quarantined_events(10).await.unwrap();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].retry_count, 3);
    assert!(quarantined[0].last_error.as_deref().unwrap().contains("no active subscribers"));

    store.requeue(quarantined[0].id).await.unwrap();
    let mut rx = sink.subscribe();

    let report = processor.process_events().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(rx.recv().await.unwrap().id, quarantined[0].id);
    assert!(store.get_quarantined_events(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_worker_drains_until_cancelled() {
    let store = store_with_plan().await;
    let sink = BroadcastSink::new(16);
    let mut rx = sink.subscribe();

    let processor = OutboxProcessor::with_policy(store.clone(), Arc::new(sink), &policy());
    let shutdown = CancellationToken::new();
    let handle = OutboxWorker::new(processor, policy().drain_interval).start(shutdown.clone());

    let delivered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("worker should deliver within the deadline")
        .unwrap();
    assert_eq!(delivered.event_type, "DietPlanDrafted");

    shutdown.cancel();
    handle.await.unwrap();

    // Cancellation lets the running pass finish marking
    let event = store.get_event(delivered.id).await.unwrap().unwrap();
    assert!(event.is_processed());
}
