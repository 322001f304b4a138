//! Domain Events
//!
//! Immutable facts recorded in the outbox next to the aggregate write that
//! produced them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Diet plan events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DietPlanEvent {
    /// A plan was drafted for a patient
    DietPlanDrafted {
        tenant_id: String,
        patient_id: String,
        title: String,
        daily_calories: u32,
        drafted_at: DateTime<Utc>,
    },

    /// The daily calorie target changed
    CalorieTargetAdjusted {
        previous: u32,
        current: u32,
        adjusted_at: DateTime<Utc>,
    },

    /// A meal slot was added to the plan
    MealAdded {
        name: String,
        calories: u32,
        added_at: DateTime<Utc>,
    },

    /// The plan became the patient's active plan
    DietPlanActivated { activated_at: DateTime<Utc> },

    /// The plan was retired
    DietPlanArchived {
        reason: String,
        archived_at: DateTime<Utc>,
    },
}

impl DietPlanEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            DietPlanEvent::DietPlanDrafted { .. } => "DietPlanDrafted",
            DietPlanEvent::CalorieTargetAdjusted { .. } => "CalorieTargetAdjusted",
            DietPlanEvent::MealAdded { .. } => "MealAdded",
            DietPlanEvent::DietPlanActivated { .. } => "DietPlanActivated",
            DietPlanEvent::DietPlanArchived { .. } => "DietPlanArchived",
        }
    }
}
