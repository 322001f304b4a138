//! In-memory backend
//!
//! A transaction holds the store's lock for its whole lifetime and works
//! on a private copy of the data. Commit swaps the copy in; rollback (or
//! dropping the handle) discards it. Transactions are therefore fully
//! serialized whatever isolation level is requested.
//!
//! Non-transactional reads and outbox bookkeeping take the lock briefly,
//! so calling them while the same task holds an open transaction blocks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::aggregate::{Aggregate, Versioned};
use crate::domain::ConcurrencyConflict;
use crate::outbox::{
    truncate_reason, NewOutboxEvent, OutboxError, OutboxEvent, OutboxStore, DEFAULT_MAX_RETRIES,
};
use crate::repository::{decode, encode, retain_satisfying, AggregateRepository, RepositoryError};
use crate::specification::Specification;

use super::{IsolationLevel, StorageError, TransactionManager, TransactionOptions};

#[derive(Debug, Clone)]
struct StoredAggregate {
    version: u64,
    state: Value,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    /// Keyed by (aggregate_type, aggregate_id)
    aggregates: BTreeMap<(String, String), StoredAggregate>,
    /// Insertion order
    outbox: Vec<OutboxEvent>,
}

impl MemoryState {
    fn outbox_event_mut(&mut self, id: Uuid) -> Result<&mut OutboxEvent, OutboxError> {
        self.outbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(OutboxError::NotFound(id))
    }
}

fn key<A: Aggregate>(id: &str) -> (String, String) {
    (A::aggregate_type().to_string(), id.to_string())
}

/// Open in-memory transaction
pub struct MemoryTransaction {
    committed: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    isolation: IsolationLevel,
}

impl MemoryTransaction {
    /// Isolation level requested at begin
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }
}

/// In-process store implementing every storage seam
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
    outbox_max_retries: u32,
    commit_failures: Arc<AtomicUsize>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            outbox_max_retries: DEFAULT_MAX_RETRIES,
            commit_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_outbox_max_retries(mut self, max_retries: u32) -> Self {
        self.outbox_max_retries = max_retries;
        self
    }

    /// Make the next `count` commits fail with a transient error
    ///
    /// Shared by every clone of this store.
    pub fn fail_next_commits(&self, count: usize) {
        self.commit_failures.store(count, Ordering::SeqCst);
    }

    /// All outbox records, in insertion order
    pub async fn outbox_snapshot(&self) -> Vec<OutboxEvent> {
        self.state.lock().await.outbox.clone()
    }

    /// Number of stored aggregates of every type
    pub async fn aggregate_count(&self) -> usize {
        self.state.lock().await.aggregates.len()
    }

    fn take_commit_failure(&self) -> bool {
        self.commit_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl TransactionManager for InMemoryStore {
    type Tx = MemoryTransaction;

    async fn begin(&self, options: &TransactionOptions) -> Result<MemoryTransaction, StorageError> {
        let committed = Arc::clone(&self.state).lock_owned().await;
        let working = committed.clone();

        Ok(MemoryTransaction {
            committed,
            working,
            isolation: options.isolation.unwrap_or_default(),
        })
    }

    async fn commit(&self, tx: MemoryTransaction) -> Result<(), StorageError> {
        if self.take_commit_failure() {
            return Err(StorageError::Transient("injected commit failure".to_string()));
        }

        let MemoryTransaction {
            mut committed,
            working,
            ..
        } = tx;
        *committed = working;
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTransaction) -> Result<(), StorageError> {
        drop(tx);
        Ok(())
    }
}

#[async_trait]
impl<A: Aggregate> AggregateRepository<A> for InMemoryStore {
    type Tx = MemoryTransaction;

    async fn load(
        &self,
        tx: &mut MemoryTransaction,
        id: &str,
    ) -> Result<Option<Versioned<A>>, RepositoryError> {
        tx.working
            .aggregates
            .get(&key::<A>(id))
            .map(|stored| decode(id, stored.version, stored.state.clone()))
            .transpose()
    }

    async fn find(&self, id: &str) -> Result<Option<Versioned<A>>, RepositoryError> {
        let state = self.state.lock().await;
        state
            .aggregates
            .get(&key::<A>(id))
            .map(|stored| decode(id, stored.version, stored.state.clone()))
            .transpose()
    }

    async fn insert(
        &self,
        tx: &mut MemoryTransaction,
        aggregate: &Versioned<A>,
    ) -> Result<(), RepositoryError> {
        let key = key::<A>(aggregate.id());
        if tx.working.aggregates.contains_key(&key) {
            return Err(RepositoryError::AlreadyExists {
                aggregate_type: A::aggregate_type().to_string(),
                id: aggregate.id().to_string(),
            });
        }

        let state = encode(aggregate)?;
        tx.working.aggregates.insert(
            key,
            StoredAggregate {
                version: aggregate.version(),
                state,
            },
        );
        Ok(())
    }

    async fn save(
        &self,
        tx: &mut MemoryTransaction,
        aggregate: &Versioned<A>,
        expected_version: u64,
    ) -> Result<(), RepositoryError> {
        let state = encode(aggregate)?;
        let stored = tx
            .working
            .aggregates
            .get_mut(&key::<A>(aggregate.id()))
            .ok_or_else(|| RepositoryError::NotFound {
                aggregate_type: A::aggregate_type().to_string(),
                id: aggregate.id().to_string(),
            })?;

        if stored.version != expected_version {
            return Err(ConcurrencyConflict {
                aggregate_type: A::aggregate_type().to_string(),
                aggregate_id: aggregate.id().to_string(),
                expected: expected_version,
                actual: stored.version,
            }
            .into());
        }

        stored.version = aggregate.version();
        stored.state = state;
        Ok(())
    }

    async fn find_matching(
        &self,
        spec: &dyn Specification<A>,
        limit: usize,
    ) -> Result<Vec<Versioned<A>>, RepositoryError> {
        let filter = spec.to_filter();
        let state = self.state.lock().await;

        let of_type = state
            .aggregates
            .iter()
            .filter(|((aggregate_type, _), _)| aggregate_type == A::aggregate_type());

        match filter {
            Some(filter) => of_type
                .filter(|(_, stored)| filter.matches(&stored.state))
                .take(limit)
                .map(|((_, id), stored)| decode(id.as_str(), stored.version, stored.state.clone()))
                .collect(),
            None => {
                let candidates = of_type
                    .map(|((_, id), stored)| {
                        decode(id.as_str(), stored.version, stored.state.clone())
                    })
                    .collect::<Result<Vec<Versioned<A>>, _>>()?;
                Ok(retain_satisfying(candidates, spec, limit))
            }
        }
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    type Tx = MemoryTransaction;

    async fn save_event(
        &self,
        tx: &mut MemoryTransaction,
        event: NewOutboxEvent,
    ) -> Result<OutboxEvent, OutboxError> {
        let record = event.into_record();
        tx.working.outbox.push(record.clone());
        Ok(record)
    }

    async fn get_unprocessed_events(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError> {
        let state = self.state.lock().await;
        let mut pending: Vec<OutboxEvent> = state
            .outbox
            .iter()
            .filter(|e| !e.is_processed() && e.retry_count < self.outbox_max_retries)
            .cloned()
            .collect();

        // Stable: ties keep insertion order
        pending.sort_by_key(|e| e.occurred_on);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_as_processed(&self, id: Uuid) -> Result<(), OutboxError> {
        let mut state = self.state.lock().await;
        let event = state.outbox_event_mut(id)?;
        if event.processed_at.is_none() {
            event.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn increment_retry(&self, id: Uuid, reason: &str) -> Result<u32, OutboxError> {
        let mut state = self.state.lock().await;
        let event = state.outbox_event_mut(id)?;
        if !event.is_processed() {
            event.retry_count += 1;
            event.last_error = Some(truncate_reason(reason));
        }
        Ok(event.retry_count)
    }

    async fn get_quarantined_events(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError> {
        let state = self.state.lock().await;
        let mut quarantined: Vec<OutboxEvent> = state
            .outbox
            .iter()
            .filter(|e| e.is_quarantined(self.outbox_max_retries))
            .cloned()
            .collect();

        quarantined.sort_by_key(|e| e.occurred_on);
        quarantined.truncate(limit);
        Ok(quarantined)
    }

    async fn requeue(&self, id: Uuid) -> Result<(), OutboxError> {
        let mut state = self.state.lock().await;
        let event = state.outbox_event_mut(id)?;
        if !event.is_processed() {
            event.retry_count = 0;
        }
        tracing::info!(event_id = %id, "Outbox event requeued");
        Ok(())
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<OutboxEvent>, OutboxError> {
        let state = self.state.lock().await;
        Ok(state.outbox.iter().find(|e| e.id == id).cloned())
    }

    fn max_retries(&self) -> u32 {
        self.outbox_max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::DietPlan;

    fn plan(id: &str) -> Versioned<DietPlan> {
        let (state, _) = DietPlan::draft("clinic-1", "patient-1", "Mediterranean", 2000).unwrap();
        Versioned::create(id, state)
    }

    #[tokio::test]
    async fn test_commit_publishes_working_copy() {
        let store = InMemoryStore::new();
        let mut tx = store.begin(&TransactionOptions::default()).await.unwrap();
        store.insert(&mut tx, &plan("plan-1")).await.unwrap();
        store
            .save_event(&mut tx, NewOutboxEvent::new("plan-1", "DietPlan", "DietPlanDrafted", "{}"))
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        let found: Option<Versioned<DietPlan>> = store.find("plan-1").await.unwrap();
        assert_eq!(found.unwrap().version(), 0);
        assert_eq!(store.outbox_snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_everything() {
        let store = InMemoryStore::new();
        let mut tx = store.begin(&TransactionOptions::default()).await.unwrap();
        store.insert(&mut tx, &plan("plan-1")).await.unwrap();
        store
            .save_event(&mut tx, NewOutboxEvent::new("plan-1", "DietPlan", "DietPlanDrafted", "{}"))
            .await
            .unwrap();
        store.rollback(tx).await.unwrap();

        assert_eq!(store.aggregate_count().await, 0);
        assert!(store.outbox_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_injected_commit_failure_is_transient_and_discards() {
        let store = InMemoryStore::new();
        store.fail_next_commits(1);

        let mut tx = store.begin(&TransactionOptions::default()).await.unwrap();
        store.insert(&mut tx, &plan("plan-1")).await.unwrap();
        let err = store.commit(tx).await.unwrap_err();

        assert!(err.is_transient());
        assert_eq!(store.aggregate_count().await, 0);

        // Lock was released with the failed handle
        let tx = store.begin(&TransactionOptions::default()).await.unwrap();
        store.commit(tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_conditional_save() {
        let store = InMemoryStore::new();
        let mut tx = store.begin(&TransactionOptions::default()).await.unwrap();
        let mut aggregate = plan("plan-1");
        store.insert(&mut tx, &aggregate).await.unwrap();

        aggregate.mutate(0, |p| p.adjust_calories(1800)).unwrap();
        store.save(&mut tx, &aggregate, 0).await.unwrap();

        let stale = store.save(&mut tx, &aggregate, 0).await.unwrap_err();
        match stale {
            RepositoryError::ConcurrencyConflict(conflict) => {
                assert_eq!(conflict.expected, 0);
                assert_eq!(conflict.actual, 1);
            }
            other => panic!("Expected ConcurrencyConflict, got: {:?}", other),
        }

        let dup = store.insert(&mut tx, &plan("plan-1")).await.unwrap_err();
        assert!(matches!(dup, RepositoryError::AlreadyExists { .. }));

        let missing = store.save(&mut tx, &plan("plan-2"), 0).await.unwrap_err();
        assert!(matches!(missing, RepositoryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_outbox_bookkeeping() {
        let store = InMemoryStore::new().with_outbox_max_retries(1);
        let mut tx = store.begin(&TransactionOptions::default()).await.unwrap();
        let first = store
            .save_event(&mut tx, NewOutboxEvent::new("plan-1", "DietPlan", "MealAdded", "{}"))
            .await
            .unwrap();
        let second = store
            .save_event(&mut tx, NewOutboxEvent::new("plan-1", "DietPlan", "MealAdded", "{}"))
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        store.mark_as_processed(first.id).await.unwrap();
        store.mark_as_processed(first.id).await.unwrap();
        assert_eq!(store.increment_retry(first.id, "late failure").await.unwrap(), 0);

        assert_eq!(store.increment_retry(second.id, "offline").await.unwrap(), 1);
        assert!(store.get_unprocessed_events(10).await.unwrap().is_empty());
        assert_eq!(store.get_quarantined_events(10).await.unwrap().len(), 1);

        store.requeue(second.id).await.unwrap();
        let pending = store.get_unprocessed_events(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("offline"));

        let missing = store.mark_as_processed(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(missing, OutboxError::NotFound(_)));
    }
}
