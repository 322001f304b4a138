//! Validation Pipeline
//!
//! Commands are validated by an ordered list of pure validation functions
//! before a use case opens a unit of work. The pipeline stops at the first
//! failure, so later checks may assume earlier ones passed.

use std::fmt::Display;
use std::ops::RangeInclusive;

/// A single validation failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid {field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

type Validator<C> = Box<dyn Fn(&C) -> Result<(), ValidationError> + Send + Sync>;

/// Ordered sequence of validators over a command type `C`
pub struct ValidationPipeline<C> {
    validators: Vec<Validator<C>>,
}

impl<C> ValidationPipeline<C> {
    pub fn new() -> Self {
        Self {
            validators: Vec::new(),
        }
    }

    /// Append a validator; validators run in insertion order
    pub fn check<F>(mut self, validator: F) -> Self
    where
        F: Fn(&C) -> Result<(), ValidationError> + Send + Sync + 'static,
    {
        self.validators.push(Box::new(validator));
        self
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Run every validator until one fails
    pub fn validate(&self, candidate: &C) -> Result<(), ValidationError> {
        self.validators
            .iter()
            .try_for_each(|validator| validator(candidate))
    }
}

impl<C> Default for ValidationPipeline<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Reject empty or whitespace-only strings
pub fn not_blank(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be blank"));
    }
    Ok(())
}

/// Reject strings longer than `max` characters
pub fn max_length(field: &str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.chars().count() > max {
        return Err(ValidationError::new(
            field,
            format!("must be at most {} characters", max),
        ));
    }
    Ok(())
}

/// Reject values outside an inclusive range
pub fn in_range<T>(field: &str, value: T, range: RangeInclusive<T>) -> Result<(), ValidationError>
where
    T: PartialOrd + Display,
{
    if !range.contains(&value) {
        return Err(ValidationError::new(
            field,
            format!(
                "must be between {} and {}, got {}",
                range.start(),
                range.end(),
                value
            ),
        ));
    }
    Ok(())
}
