//! Patient Aggregate

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::domain::DomainError;
use crate::validation::not_blank;

use super::Aggregate;

/// Patient record as seen by diet planning
///
/// Field names are part of the stored document and therefore of every
/// filter that targets it (`active`, `date_of_birth`, `diagnoses`, `tenant_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub tenant_id: String,
    pub full_name: String,
    pub date_of_birth: NaiveDate,
    pub active: bool,
    #[serde(default)]
    pub diagnoses: Vec<String>,
}

impl Aggregate for Patient {
    fn aggregate_type() -> &'static str {
        "Patient"
    }
}

impl Patient {
    /// Register a new active patient
    pub fn register(
        tenant_id: impl Into<String>,
        full_name: impl Into<String>,
        date_of_birth: NaiveDate,
    ) -> Result<Self, DomainError> {
        let full_name = full_name.into();
        not_blank("full_name", &full_name)?;

        Ok(Self {
            tenant_id: tenant_id.into(),
            full_name,
            date_of_birth,
            active: true,
            diagnoses: Vec::new(),
        })
    }

    /// Record a diagnosis code; recording the same code twice is a no-op
    pub fn record_diagnosis(&mut self, code: impl Into<String>) -> Result<(), DomainError> {
        if !self.active {
            return Err(DomainError::rule("cannot record a diagnosis for an inactive patient"));
        }

        let code = code.into();
        not_blank("diagnosis", &code)?;

        if !self.diagnoses.contains(&code) {
            self.diagnoses.push(code);
        }
        Ok(())
    }

    pub fn deactivate(&mut self) -> Result<(), DomainError> {
        if !self.active {
            return Err(DomainError::rule("patient is already inactive"));
        }
        self.active = false;
        Ok(())
    }

    /// Age in completed years on `date`
    pub fn age_on(&self, date: NaiveDate) -> u32 {
        let mut years = date.year() - self.date_of_birth.year();
        if (date.month(), date.day()) < (self.date_of_birth.month(), self.date_of_birth.day()) {
            years -= 1;
        }
        years.max(0) as u32
    }
}
