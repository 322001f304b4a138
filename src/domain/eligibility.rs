//! Patient eligibility rules
//!
//! Specifications over `Patient` used to pick candidates for diet plans.
//! Each one carries its storage filter, so repositories can push the whole
//! rule down to the store.

use chrono::{Months, NaiveDate};

use crate::aggregate::Patient;
use crate::specification::{AndSpecification, Filter, Specification};

/// Patient is active
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivePatient;

impl Specification<Patient> for ActivePatient {
    fn is_satisfied_by(&self, patient: &Patient) -> bool {
        patient.active
    }

    fn to_filter(&self) -> Option<Filter> {
        Some(Filter::eq("active", true))
    }
}

/// Patient belongs to a tenant
#[derive(Debug, Clone)]
pub struct BelongsToTenant {
    tenant_id: String,
}

impl BelongsToTenant {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
        }
    }
}

impl Specification<Patient> for BelongsToTenant {
    fn is_satisfied_by(&self, patient: &Patient) -> bool {
        patient.tenant_id == self.tenant_id
    }

    fn to_filter(&self) -> Option<Filter> {
        Some(Filter::eq("tenant_id", self.tenant_id.as_str()))
    }
}

/// Patient's age in completed years is within `[min_years, max_years]`
///
/// Ages are resolved once, at construction, into a window of birth dates
/// relative to `as_of`. Both evaluation paths compare against that window:
/// in memory on `NaiveDate`, in storage on the ISO-8601 text, which sorts
/// the same way.
#[derive(Debug, Clone)]
pub struct AgeBetween {
    min_years: u32,
    max_years: u32,
    /// Latest birth date that is at least `min_years` old
    born_on_or_before: NaiveDate,
    /// Birth dates on or before this are older than `max_years`
    born_after: NaiveDate,
}

impl AgeBetween {
    pub fn new(min_years: u32, max_years: u32, as_of: NaiveDate) -> Self {
        Self {
            min_years,
            max_years,
            born_on_or_before: years_before(as_of, min_years),
            born_after: years_before(as_of, max_years.saturating_add(1)),
        }
    }
}

fn years_before(date: NaiveDate, years: u32) -> NaiveDate {
    years
        .checked_mul(12)
        .and_then(|months| date.checked_sub_months(Months::new(months)))
        .unwrap_or(NaiveDate::MIN)
}

impl Specification<Patient> for AgeBetween {
    fn is_satisfied_by(&self, patient: &Patient) -> bool {
        patient.date_of_birth <= self.born_on_or_before && patient.date_of_birth > self.born_after
    }

    fn to_filter(&self) -> Option<Filter> {
        Some(
            Filter::lte("date_of_birth", self.born_on_or_before.to_string())
                .and(Filter::gt("date_of_birth", self.born_after.to_string())),
        )
    }

    fn name(&self) -> String {
        format!("AgeBetween({}..={})", self.min_years, self.max_years)
    }
}

/// Patient has not been diagnosed with `code`
#[derive(Debug, Clone)]
pub struct HasNoDiagnosis {
    code: String,
}

impl HasNoDiagnosis {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}

impl Specification<Patient> for HasNoDiagnosis {
    fn is_satisfied_by(&self, patient: &Patient) -> bool {
        !patient.diagnoses.iter().any(|d| d == &self.code)
    }

    fn to_filter(&self) -> Option<Filter> {
        Some(Filter::contains("diagnoses", self.code.as_str()).negate())
    }

    fn name(&self) -> String {
        format!("HasNoDiagnosis({})", self.code)
    }
}

/// Active patients of a tenant that may receive a new diet plan
pub fn eligible_for_plan(tenant_id: impl Into<String>) -> AndSpecification<Patient> {
    BelongsToTenant::new(tenant_id).and(ActivePatient)
}
