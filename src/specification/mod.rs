//! Specification module
//!
//! Reusable, composable business predicates. A specification can be
//! checked in memory (`is_satisfied_by`) and, when it knows how, projected
//! into a storage `Filter` (`to_filter`) so repositories can push it down
//! to the store.
//!
//! Composites combine child filters with the same combinator. If any child
//! has no filter the composite has none either, which forces callers to
//! evaluate in memory instead of pushing down only part of the predicate.

mod filter;

pub use filter::Filter;

use std::marker::PhantomData;

use serde::Serialize;

/// Core specification trait
pub trait Specification<T>: Send + Sync {
    /// Check whether the candidate satisfies this specification
    fn is_satisfied_by(&self, candidate: &T) -> bool;

    /// Equivalent storage filter, if this specification has one
    fn to_filter(&self) -> Option<Filter> {
        None
    }

    /// Human-readable name, used in logs
    fn name(&self) -> String {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base).to_string()
    }

    /// Combine with another specification using AND
    fn and<S>(self, other: S) -> AndSpecification<T>
    where
        Self: Sized + 'static,
        S: Specification<T> + 'static,
    {
        AndSpecification::new(Box::new(self), Box::new(other))
    }

    /// Combine with another specification using OR
    fn or<S>(self, other: S) -> OrSpecification<T>
    where
        Self: Sized + 'static,
        S: Specification<T> + 'static,
    {
        OrSpecification::new(Box::new(self), Box::new(other))
    }

    /// Negate this specification
    fn not(self) -> NotSpecification<T>
    where
        Self: Sized + 'static,
    {
        NotSpecification::new(Box::new(self))
    }
}

impl<T> Specification<T> for Box<dyn Specification<T>> {
    fn is_satisfied_by(&self, candidate: &T) -> bool {
        self.as_ref().is_satisfied_by(candidate)
    }

    fn to_filter(&self) -> Option<Filter> {
        self.as_ref().to_filter()
    }

    fn name(&self) -> String {
        self.as_ref().name()
    }
}

/// Satisfied when both children are
pub struct AndSpecification<T> {
    left: Box<dyn Specification<T>>,
    right: Box<dyn Specification<T>>,
}

impl<T> AndSpecification<T> {
    pub fn new(left: Box<dyn Specification<T>>, right: Box<dyn Specification<T>>) -> Self {
        Self { left, right }
    }
}

impl<T> Specification<T> for AndSpecification<T> {
    fn is_satisfied_by(&self, candidate: &T) -> bool {
        self.left.is_satisfied_by(candidate) && self.right.is_satisfied_by(candidate)
    }

    fn to_filter(&self) -> Option<Filter> {
        Some(self.left.to_filter()?.and(self.right.to_filter()?))
    }

    fn name(&self) -> String {
        format!("({} AND {})", self.left.name(), self.right.name())
    }
}

/// Satisfied when either child is
pub struct OrSpecification<T> {
    left: Box<dyn Specification<T>>,
    right: Box<dyn Specification<T>>,
}

impl<T> OrSpecification<T> {
    pub fn new(left: Box<dyn Specification<T>>, right: Box<dyn Specification<T>>) -> Self {
        Self { left, right }
    }
}

impl<T> Specification<T> for OrSpecification<T> {
    fn is_satisfied_by(&self, candidate: &T) -> bool {
        self.left.is_satisfied_by(candidate) || self.right.is_satisfied_by(candidate)
    }

    fn to_filter(&self) -> Option<Filter> {
        Some(self.left.to_filter()?.or(self.right.to_filter()?))
    }

    fn name(&self) -> String {
        format!("({} OR {})", self.left.name(), self.right.name())
    }
}

/// Satisfied when the inner specification is not
pub struct NotSpecification<T> {
    inner: Box<dyn Specification<T>>,
}

impl<T> NotSpecification<T> {
    pub fn new(inner: Box<dyn Specification<T>>) -> Self {
        Self { inner }
    }
}

impl<T> Specification<T> for NotSpecification<T> {
    fn is_satisfied_by(&self, candidate: &T) -> bool {
        !self.inner.is_satisfied_by(candidate)
    }

    fn to_filter(&self) -> Option<Filter> {
        Some(self.inner.to_filter()?.negate())
    }

    fn name(&self) -> String {
        format!("NOT {}", self.inner.name())
    }
}

/// Specification defined entirely by a filter
///
/// The candidate is serialized and the filter evaluated on the resulting
/// document, so in-memory and pushed-down results agree by construction.
pub struct FilterSpec<T> {
    name: String,
    filter: Filter,
    _marker: PhantomData<fn(&T)>,
}

impl<T> FilterSpec<T> {
    pub fn new(name: impl Into<String>, filter: Filter) -> Self {
        Self {
            name: name.into(),
            filter,
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize> Specification<T> for FilterSpec<T> {
    fn is_satisfied_by(&self, candidate: &T) -> bool {
        serde_json::to_value(candidate)
            .map(|document| self.filter.matches(&document))
            .unwrap_or(false)
    }

    fn to_filter(&self) -> Option<Filter> {
        Some(self.filter.clone())
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Specification backed by a closure, with an optional filter translation
pub struct PredicateSpec<T> {
    name: String,
    predicate: Predicate<T>,
    filter: Option<Filter>,
}

impl<T> PredicateSpec<T> {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Box::new(predicate),
            filter: None,
        }
    }

    /// Attach the storage filter equivalent to the predicate
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }
}

impl<T> Specification<T> for PredicateSpec<T> {
    fn is_satisfied_by(&self, candidate: &T) -> bool {
        (self.predicate)(candidate)
    }

    fn to_filter(&self) -> Option<Filter> {
        self.filter.clone()
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct AlwaysTrueSpec;
    impl Specification<i32> for AlwaysTrueSpec {
        fn is_satisfied_by(&self, _: &i32) -> bool {
            true
        }
    }

    struct AlwaysFalseSpec;
    impl Specification<i32> for AlwaysFalseSpec {
        fn is_satisfied_by(&self, _: &i32) -> bool {
            false
        }
    }

    fn positive() -> PredicateSpec<i32> {
        PredicateSpec::new("positive", |n: &i32| *n > 0).with_filter(Filter::gt("n", 0))
    }

    #[test]
    fn test_and_specification() {
        assert!(AlwaysTrueSpec.and(AlwaysTrueSpec).is_satisfied_by(&42));
        assert!(!AlwaysTrueSpec.and(AlwaysFalseSpec).is_satisfied_by(&42));
        assert!(!AlwaysFalseSpec.and(AlwaysFalseSpec).is_satisfied_by(&42));
    }

    #[test]
    fn test_or_specification() {
        assert!(AlwaysTrueSpec.or(AlwaysFalseSpec).is_satisfied_by(&42));
        assert!(!AlwaysFalseSpec.or(AlwaysFalseSpec).is_satisfied_by(&42));
    }

    #[test]
    fn test_not_specification() {
        assert!(!AlwaysTrueSpec.not().is_satisfied_by(&42));
        assert!(AlwaysFalseSpec.not().is_satisfied_by(&42));
    }

    #[test]
    fn test_complex_combination() {
        // (TRUE AND FALSE) OR (NOT FALSE) = FALSE OR TRUE = TRUE
        let spec = AlwaysTrueSpec
            .and(AlwaysFalseSpec)
            .or(AlwaysFalseSpec.not());
        assert!(spec.is_satisfied_by(&42));
    }

    #[test]
    fn test_composite_filter_follows_combinator() {
        let even = PredicateSpec::new("even", |n: &i32| n % 2 == 0)
            .with_filter(Filter::is_in("n", [0, 2, 4]));

        let spec = positive().and(even);
        assert_eq!(
            spec.to_filter(),
            Some(Filter::gt("n", 0).and(Filter::is_in("n", [0, 2, 4])))
        );

        let spec = positive().or(AlwaysFalseSpec.not());
        assert_eq!(spec.to_filter(), None);
    }

    #[test]
    fn test_missing_child_filter_fails_closed() {
        // Half of the predicate translates, but the composite must not
        let spec = positive().and(AlwaysFalseSpec);
        assert!(spec.to_filter().is_none());

        let spec = AlwaysTrueSpec.not();
        assert!(spec.to_filter().is_none());
    }

    #[test]
    fn test_not_negates_child_filter() {
        let spec = positive().not();
        assert_eq!(spec.to_filter(), Some(Filter::gt("n", 0).negate()));
        assert!(spec.is_satisfied_by(&-3));
    }

    #[test]
    fn test_filter_spec_evaluates_serialized_candidate() {
        #[derive(Serialize)]
        struct Meal {
            calories: u32,
        }

        let spec = FilterSpec::<Meal>::new("light", Filter::lte("calories", 400));
        assert!(spec.is_satisfied_by(&Meal { calories: 350 }));
        assert!(!spec.is_satisfied_by(&Meal { calories: 900 }));
        assert!(spec
            .to_filter()
            .unwrap()
            .matches(&json!({ "calories": 400 })));
    }

    #[test]
    fn test_names() {
        assert_eq!(AlwaysTrueSpec.name(), "AlwaysTrueSpec");
        let spec = positive().and(AlwaysFalseSpec.not());
        assert_eq!(spec.name(), "(positive AND NOT AlwaysFalseSpec)");
    }
}
