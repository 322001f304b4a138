//! Domain module
//!
//! Core domain types and business rules.

pub mod context;
pub mod eligibility;
pub mod error;
pub mod events;

pub use context::OperationContext;
pub use eligibility::{
    eligible_for_plan, ActivePatient, AgeBetween, BelongsToTenant, HasNoDiagnosis,
};
pub use error::{ConcurrencyConflict, DomainError};
pub use events::DietPlanEvent;
