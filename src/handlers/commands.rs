//! Command definitions
//!
//! Commands represent intentions to change the system state. Each command
//! that edits an existing plan carries the version the caller last read.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::diet_plan::{DAILY_CALORIE_RANGE, MEAL_CALORIE_RANGE};
use crate::aggregate::MealSlot;
use crate::validation::{in_range, max_length, not_blank, ValidationPipeline};

/// Longest accepted plan title
pub const MAX_TITLE_LEN: usize = 120;

/// Command to draft a new diet plan for a patient
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDietPlanCommand {
    /// Caller-chosen plan id; generated when absent
    pub plan_id: Option<String>,
    pub patient_id: String,
    pub title: String,
    pub daily_calories: u32,
}

impl CreateDietPlanCommand {
    pub fn new(
        patient_id: impl Into<String>,
        title: impl Into<String>,
        daily_calories: u32,
    ) -> Self {
        Self {
            plan_id: None,
            patient_id: patient_id.into(),
            title: title.into(),
            daily_calories,
        }
    }

    pub fn with_plan_id(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }

    /// Resolve the plan id, generating one if needed
    pub fn resolve_plan_id(&self) -> String {
        self.plan_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    pub fn validator() -> ValidationPipeline<Self> {
        ValidationPipeline::new()
            .check(|c: &Self| not_blank("patient_id", &c.patient_id))
            .check(|c: &Self| not_blank("title", &c.title))
            .check(|c: &Self| max_length("title", &c.title, MAX_TITLE_LEN))
            .check(|c: &Self| in_range("daily_calories", c.daily_calories, DAILY_CALORIE_RANGE))
            .check(|c: &Self| match &c.plan_id {
                Some(id) => not_blank("plan_id", id),
                None => Ok(()),
            })
    }
}

/// Change applied to an existing plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanChange {
    AdjustCalories { daily_calories: u32 },
    AddMeal { meal: MealSlot },
    Activate,
    Archive { reason: String },
}

impl PlanChange {
    pub fn name(&self) -> &'static str {
        match self {
            PlanChange::AdjustCalories { .. } => "adjust_calories",
            PlanChange::AddMeal { .. } => "add_meal",
            PlanChange::Activate => "activate",
            PlanChange::Archive { .. } => "archive",
        }
    }
}

/// Command to change an existing plan at a known version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateDietPlanCommand {
    pub plan_id: String,
    pub expected_version: u64,
    pub change: PlanChange,
}

impl UpdateDietPlanCommand {
    pub fn new(plan_id: impl Into<String>, expected_version: u64, change: PlanChange) -> Self {
        Self {
            plan_id: plan_id.into(),
            expected_version,
            change,
        }
    }

    pub fn validator() -> ValidationPipeline<Self> {
        ValidationPipeline::new()
            .check(|c: &Self| not_blank("plan_id", &c.plan_id))
            .check(|c: &Self| match &c.change {
                PlanChange::AdjustCalories { daily_calories } => {
                    in_range("daily_calories", *daily_calories, DAILY_CALORIE_RANGE)
                }
                PlanChange::AddMeal { meal } => not_blank("meal.name", &meal.name)
                    .and_then(|_| in_range("meal.calories", meal.calories, MEAL_CALORIE_RANGE)),
                PlanChange::Archive { reason } => not_blank("reason", reason),
                PlanChange::Activate => Ok(()),
            })
    }
}

/// Outcome of a committed plan command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanCommandResult {
    pub plan_id: String,
    /// Version after the change
    pub version: u64,
    /// Outbox record written with the change
    pub event_id: Uuid,
}
