//! Outbox processing
//!
//! `OutboxProcessor` drains one batch of pending events into a sink.
//! `OutboxWorker` runs it on an interval until cancelled.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::OutboxPolicy;

use super::{DeliveryError, DeliverySink, OutboxError, OutboxEvent, OutboxStore};

/// Outcome of one drain pass
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    pub fetched: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Failures that used up the event's last attempt
    pub quarantined: usize,
    pub completed_at: DateTime<Utc>,
}

/// Delivers pending outbox events to a sink
pub struct OutboxProcessor<S> {
    store: S,
    sink: Arc<dyn DeliverySink>,
    batch_size: usize,
    delivery_timeout: Duration,
}

impl<S: OutboxStore> OutboxProcessor<S> {
    pub fn new(store: S, sink: Arc<dyn DeliverySink>) -> Self {
        Self::with_policy(store, sink, &OutboxPolicy::default())
    }

    pub fn with_policy(store: S, sink: Arc<dyn DeliverySink>, policy: &OutboxPolicy) -> Self {
        Self {
            store,
            sink,
            batch_size: policy.batch_size,
            delivery_timeout: policy.delivery_timeout,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Deliver one batch of unprocessed events
    ///
    /// A failed delivery is recorded on the event and the batch moves on.
    /// Storage errors abort the pass; events not yet marked stay pending
    /// and are picked up again next time.
    pub async fn process_events(&self) -> Result<DrainReport, OutboxError> {
        let events = self.store.get_unprocessed_events(self.batch_size).await?;
        let mut report = DrainReport {
            fetched: events.len(),
            ..Default::default()
        };

        for event in &events {
            match self.deliver(event).await {
                Ok(()) => {
                    self.store.mark_as_processed(event.id).await?;
                    report.delivered += 1;
                }
                Err(err) => {
                    let reason = err.to_string();
                    let retry_count = self.store.increment_retry(event.id, &reason).await?;
                    report.failed += 1;

                    if retry_count >= self.store.max_retries() {
                        report.quarantined += 1;
                        tracing::error!(
                            event_id = %event.id,
                            event_type = %event.event_type,
                            aggregate_id = %event.aggregate_id,
                            retry_count,
                            error = %reason,
                            "Outbox event quarantined after exhausting retries"
                        );
                    } else {
                        tracing::warn!(
                            event_id = %event.id,
                            event_type = %event.event_type,
                            retry_count,
                            max_retries = self.store.max_retries(),
                            error = %reason,
                            "Outbox delivery failed, will retry"
                        );
                    }
                }
            }
        }

        report.completed_at = Utc::now();

        if report.fetched > 0 {
            tracing::info!(
                fetched = report.fetched,
                delivered = report.delivered,
                failed = report.failed,
                quarantined = report.quarantined,
                "Outbox drain pass complete"
            );
        }

        Ok(report)
    }

    async fn deliver(&self, event: &OutboxEvent) -> Result<(), DeliveryError> {
        match tokio::time::timeout(self.delivery_timeout, self.sink.publish(event)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.delivery_timeout)),
        }
    }
}

/// Background drain loop
pub struct OutboxWorker<S> {
    processor: OutboxProcessor<S>,
    drain_interval: Duration,
}

impl<S: OutboxStore + 'static> OutboxWorker<S> {
    pub fn new(processor: OutboxProcessor<S>, drain_interval: Duration) -> Self {
        Self {
            processor,
            drain_interval,
        }
    }

    /// Start the worker in the background
    ///
    /// The loop exits after the current pass once `shutdown` is cancelled.
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            interval_ms = self.drain_interval.as_millis() as u64,
            "Outbox worker started"
        );

        let mut ticker = interval(self.drain_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Outbox worker stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!(error = %e, "Outbox drain pass failed");
                    }
                }
            }
        }
    }

    /// Run a single drain pass (for manual trigger or testing)
    pub async fn run_once(&self) -> Result<DrainReport, OutboxError> {
        self.processor.process_events().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::outbox::{LoggingSink, NewOutboxEvent};
    use crate::storage::{InMemoryStore, TransactionManager, TransactionOptions};

    /// Fails the first `failures` publishes
    struct FlakySink {
        failures: AtomicUsize,
        published: AtomicUsize,
    }

    impl FlakySink {
        fn failing(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicUsize::new(failures),
                published: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl DeliverySink for FlakySink {
        async fn publish(&self, _event: &OutboxEvent) -> Result<(), DeliveryError> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(DeliveryError::Unavailable("broker offline".to_string()));
            }
            self.published.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StalledSink;

    #[async_trait]
    impl DeliverySink for StalledSink {
        async fn publish(&self, _event: &OutboxEvent) -> Result<(), DeliveryError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    async fn seed(store: &InMemoryStore, count: usize) {
        let mut tx = store.begin(&TransactionOptions::default()).await.unwrap();
        for n in 0..count {
            store
                .save_event(
                    &mut tx,
                    NewOutboxEvent::new(format!("plan-{n}"), "DietPlan", "DietPlanDrafted", "{}"),
                )
                .await
                .unwrap();
        }
        store.commit(tx).await.unwrap();
    }

    fn policy() -> OutboxPolicy {
        OutboxPolicy {
            delivery_timeout: Duration::from_millis(50),
            ..OutboxPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_successful_drain_marks_events_processed() {
        let store = InMemoryStore::new();
        seed(&store, 3).await;

        let processor =
            OutboxProcessor::with_policy(store.clone(), Arc::new(LoggingSink), &policy());
        let report = processor.process_events().await.unwrap();

        assert_eq!(report.fetched, 3);
        assert_eq!(report.delivered, 3);
        assert!(store.get_unprocessed_events(10).await.unwrap().is_empty());

        let again = processor.process_events().await.unwrap();
        assert_eq!(again.fetched, 0);
    }

    #[tokio::test]
    async fn test_failures_count_until_quarantine() {
        let store = InMemoryStore::new().with_outbox_max_retries(2);
        seed(&store, 1).await;
        let sink = FlakySink::failing(usize::MAX);
        let processor = OutboxProcessor::with_policy(store.clone(), sink.clone(), &policy());

        let first = processor.process_events().await.unwrap();
        assert_eq!((first.failed, first.quarantined), (1, 0));

        let second = processor.process_events().await.unwrap();
        assert_eq!((second.failed, second.quarantined), (1, 1));

        // Quarantined events are no longer fetched
        let third = processor.process_events().await.unwrap();
        assert_eq!(third.fetched, 0);

        let quarantined = store.get_quarantined_events(10).await.unwrap();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].retry_count, 2);
        assert_eq!(
            quarantined[0].last_error.as_deref(),
            Some("Sink unavailable: broker offline")
        );
    }

    #[tokio::test]
    async fn test_transient_sink_failure_is_retried_next_pass() {
        let store = InMemoryStore::new();
        seed(&store, 2).await;
        let sink = FlakySink::failing(1);
        let processor = OutboxProcessor::with_policy(store.clone(), sink.clone(), &policy());

        let first = processor.process_events().await.unwrap();
        assert_eq!((first.delivered, first.failed), (1, 1));

        let second = processor.process_events().await.unwrap();
        assert_eq!((second.fetched, second.delivered), (1, 1));
        assert_eq!(sink.published.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_slow_sink_times_out() {
        let store = InMemoryStore::new();
        seed(&store, 1).await;
        let processor =
            OutboxProcessor::with_policy(store.clone(), Arc::new(StalledSink), &policy());

        let report = processor.process_events().await.unwrap();
        assert_eq!(report.failed, 1);

        let pending = store.get_unprocessed_events(10).await.unwrap();
        assert_eq!(pending[0].retry_count, 1);
        assert!(pending[0].last_error.as_deref().unwrap().starts_with("Delivery timed out"));
    }

    #[tokio::test]
    async fn test_worker_stops_on_cancel() {
        let store = InMemoryStore::new();
        seed(&store, 1).await;
        let processor =
            OutboxProcessor::with_policy(store.clone(), Arc::new(LoggingSink), &policy());
        let worker = OutboxWorker::new(processor, Duration::from_millis(10));
        let shutdown = CancellationToken::new();

        let handle = worker.start(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert!(store.get_unprocessed_events(10).await.unwrap().is_empty());
    }
}
