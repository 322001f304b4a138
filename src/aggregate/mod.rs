//! Aggregate module
//!
//! Versioned aggregates with a guarded mutation contract. Every successful
//! mutation bumps the version by exactly one; a mutation against a stale
//! expected version is rejected before the state is touched.

pub mod diet_plan;
pub mod patient;

pub use diet_plan::{DietPlan, MealSlot, PlanStatus};
pub use patient::Patient;

use serde::{de::DeserializeOwned, Serialize};

use crate::domain::{ConcurrencyConflict, DomainError};

/// Aggregate trait that all aggregate states must implement
pub trait Aggregate: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Get the aggregate type name (for storage and outbox records)
    fn aggregate_type() -> &'static str;
}

/// An aggregate state stamped with its identity and version
///
/// A value only exists once it has been created (version 0) or
/// reconstituted from storage, so there is no uninitialized state to
/// guard against. The version is never decremented or reset.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<A> {
    id: String,
    version: u64,
    state: A,
}

impl<A: Aggregate> Versioned<A> {
    /// Wrap a brand-new aggregate at version 0
    pub fn create(id: impl Into<String>, state: A) -> Self {
        Self {
            id: id.into(),
            version: 0,
            state,
        }
    }

    /// Rebuild an aggregate loaded from storage
    pub fn reconstitute(id: impl Into<String>, version: u64, state: A) -> Self {
        Self {
            id: id.into(),
            version,
            state,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current version (number of successful mutations)
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn into_state(self) -> A {
        self.state
    }

    /// Fail with `ConcurrencyConflict` unless `expected` is the current version
    pub fn check_version(&self, expected: u64) -> Result<(), ConcurrencyConflict> {
        if expected != self.version {
            return Err(ConcurrencyConflict {
                aggregate_type: A::aggregate_type().to_string(),
                aggregate_id: self.id.clone(),
                expected,
                actual: self.version,
            });
        }
        Ok(())
    }

    /// Apply `change` if `expected_version` matches, then bump the version
    ///
    /// The change runs against a copy of the state; the copy and the new
    /// version are installed together only when the change succeeds, so a
    /// failing change leaves both untouched. Conflicts are returned to the
    /// caller, never retried here.
    pub fn mutate<R, F>(&mut self, expected_version: u64, change: F) -> Result<R, DomainError>
    where
        F: FnOnce(&mut A) -> Result<R, DomainError>,
    {
        self.check_version(expected_version)?;

        let mut next = self.state.clone();
        let output = change(&mut next)?;

        self.state = next;
        self.version += 1;

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: i64,
    }

    impl Aggregate for Counter {
        fn aggregate_type() -> &'static str {
            "Counter"
        }
    }

    #[test]
    fn test_create_starts_at_version_zero() {
        let counter = Versioned::create("c-1", Counter { value: 0 });
        assert_eq!(counter.id(), "c-1");
        assert_eq!(counter.version(), 0);
    }

    #[test]
    fn test_mutate_increments_version_by_one() {
        let mut counter = Versioned::create("c-1", Counter { value: 0 });

        let value = counter
            .mutate(0, |c| {
                c.value += 5;
                Ok(c.value)
            })
            .unwrap();

        assert_eq!(value, 5);
        assert_eq!(counter.version(), 1);
        assert_eq!(counter.state().value, 5);

        counter
            .mutate(1, |c| {
                c.value -= 2;
                Ok(())
            })
            .unwrap();
        assert_eq!(counter.version(), 2);
        assert_eq!(counter.state().value, 3);
    }

    #[test]
    fn test_stale_version_is_rejected_before_change() {
        let mut counter = Versioned::reconstitute("c-2", 4, Counter { value: 10 });
        let mut called = false;

        let err = counter
            .mutate(3, |c| {
                called = true;
                c.value = 0;
                Ok(())
            })
            .unwrap_err();

        assert!(!called);
        assert_eq!(counter.version(), 4);
        assert_eq!(counter.state().value, 10);
        match err {
            DomainError::ConcurrencyConflict(conflict) => {
                assert_eq!(conflict.aggregate_type, "Counter");
                assert_eq!(conflict.aggregate_id, "c-2");
                assert_eq!(conflict.expected, 3);
                assert_eq!(conflict.actual, 4);
            }
            other => panic!("Expected ConcurrencyConflict, got: {:?}", other),
        }
    }

    #[test]
    fn test_failed_change_leaves_state_and_version() {
        let mut counter = Versioned::create("c-3", Counter { value: 1 });

        let result: Result<(), DomainError> = counter.mutate(0, |c| {
            c.value = 99;
            Err(DomainError::rule("counter may not be reset"))
        });

        assert!(result.is_err());
        assert_eq!(counter.version(), 0);
        assert_eq!(counter.state().value, 1);
    }
}
