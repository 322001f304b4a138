//! Diet Plan Aggregate
//!
//! A patient's diet plan: calorie target, meal slots and lifecycle
//! (draft → active → archived). Commands validate against the current
//! state, change it and return the event to record in the outbox. They are
//! meant to run inside `Versioned::mutate`, which supplies the version
//! check and bump.

use std::ops::RangeInclusive;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::domain::{DietPlanEvent, DomainError};
use crate::validation::{in_range, not_blank};

use super::Aggregate;

/// Allowed daily calorie targets
pub const DAILY_CALORIE_RANGE: RangeInclusive<u32> = 800..=5000;

/// Allowed calories for a single meal slot
pub const MEAL_CALORIE_RANGE: RangeInclusive<u32> = 1..=5000;

/// Plan lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Draft,
    Active,
    Archived,
}

/// One meal in the daily schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MealSlot {
    pub name: String,
    pub calories: u32,
}

/// Diet Plan Aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DietPlan {
    tenant_id: String,
    patient_id: String,
    title: String,
    daily_calories: u32,
    status: PlanStatus,
    meals: Vec<MealSlot>,
}

impl Aggregate for DietPlan {
    fn aggregate_type() -> &'static str {
        "DietPlan"
    }
}

impl DietPlan {
    /// Draft a new plan and generate the creation event
    pub fn draft(
        tenant_id: impl Into<String>,
        patient_id: impl Into<String>,
        title: impl Into<String>,
        daily_calories: u32,
    ) -> Result<(Self, DietPlanEvent), DomainError> {
        let title = title.into();
        not_blank("title", &title)?;
        in_range("daily_calories", daily_calories, DAILY_CALORIE_RANGE)?;

        let plan = Self {
            tenant_id: tenant_id.into(),
            patient_id: patient_id.into(),
            title,
            daily_calories,
            status: PlanStatus::Draft,
            meals: Vec::new(),
        };

        let event = DietPlanEvent::DietPlanDrafted {
            tenant_id: plan.tenant_id.clone(),
            patient_id: plan.patient_id.clone(),
            title: plan.title.clone(),
            daily_calories,
            drafted_at: Utc::now(),
        };

        Ok((plan, event))
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn daily_calories(&self) -> u32 {
        self.daily_calories
    }

    pub fn status(&self) -> PlanStatus {
        self.status
    }

    pub fn meals(&self) -> &[MealSlot] {
        &self.meals
    }

    /// Sum of the calories of all meal slots
    pub fn planned_calories(&self) -> u64 {
        self.meals.iter().map(|m| u64::from(m.calories)).sum()
    }

    /// Change the daily calorie target
    pub fn adjust_calories(&mut self, daily_calories: u32) -> Result<DietPlanEvent, DomainError> {
        self.ensure_not_archived()?;
        in_range("daily_calories", daily_calories, DAILY_CALORIE_RANGE)?;

        if u64::from(daily_calories) < self.planned_calories() {
            return Err(DomainError::rule(format!(
                "target of {} kcal is below the {} kcal already scheduled in meals",
                daily_calories,
                self.planned_calories()
            )));
        }

        let previous = std::mem::replace(&mut self.daily_calories, daily_calories);

        Ok(DietPlanEvent::CalorieTargetAdjusted {
            previous,
            current: daily_calories,
            adjusted_at: Utc::now(),
        })
    }

    /// Add a meal slot; the schedule may not exceed the daily target
    pub fn add_meal(&mut self, meal: MealSlot) -> Result<DietPlanEvent, DomainError> {
        self.ensure_not_archived()?;
        not_blank("meal.name", &meal.name)?;
        in_range("meal.calories", meal.calories, MEAL_CALORIE_RANGE)?;

        if self.meals.iter().any(|m| m.name == meal.name) {
            return Err(DomainError::rule(format!(
                "meal '{}' is already scheduled",
                meal.name
            )));
        }

        if self.planned_calories() + u64::from(meal.calories) > u64::from(self.daily_calories) {
            return Err(DomainError::rule(format!(
                "meal '{}' would exceed the daily target of {} kcal",
                meal.name, self.daily_calories
            )));
        }

        let event = DietPlanEvent::MealAdded {
            name: meal.name.clone(),
            calories: meal.calories,
            added_at: Utc::now(),
        };
        self.meals.push(meal);

        Ok(event)
    }

    /// Make a draft plan active
    pub fn activate(&mut self) -> Result<DietPlanEvent, DomainError> {
        if self.status != PlanStatus::Draft {
            return Err(DomainError::rule("only draft plans can be activated"));
        }
        if self.meals.is_empty() {
            return Err(DomainError::rule("a plan needs at least one meal to be activated"));
        }

        self.status = PlanStatus::Active;

        Ok(DietPlanEvent::DietPlanActivated {
            activated_at: Utc::now(),
        })
    }

    /// Retire the plan
    pub fn archive(&mut self, reason: impl Into<String>) -> Result<DietPlanEvent, DomainError> {
        self.ensure_not_archived()?;
        self.status = PlanStatus::Archived;

        Ok(DietPlanEvent::DietPlanArchived {
            reason: reason.into(),
            archived_at: Utc::now(),
        })
    }

    fn ensure_not_archived(&self) -> Result<(), DomainError> {
        if self.status == PlanStatus::Archived {
            return Err(DomainError::rule("archived plans cannot be changed"));
        }
        Ok(())
    }
}
