//! Diet Plan Update Handler
//!
//! Applies a change to an existing plan at the version the caller read.
//! The conditional save and the outbox append share one unit of work, so
//! a lost race leaves neither behind.

use futures::FutureExt;
use tracing::Instrument;

use crate::aggregate::{Aggregate, DietPlan, Versioned};
use crate::domain::{DietPlanEvent, DomainError, OperationContext};
use crate::error::{AppError, AppResult};
use crate::outbox::{NewOutboxEvent, OutboxStore};
use crate::repository::AggregateRepository;
use crate::storage::TransactionManager;
use crate::unit_of_work::UnitOfWork;
use crate::validation::ValidationPipeline;

use super::{PlanChange, PlanCommandResult, UpdateDietPlanCommand};

/// Default number of read-modify-write rounds in `set_calorie_target`
pub const DEFAULT_CONFLICT_ATTEMPTS: u32 = 5;

/// Handler for changes to existing diet plans
pub struct UpdateDietPlanHandler<M, R, O> {
    uow: UnitOfWork<M>,
    repository: R,
    outbox: O,
    validator: ValidationPipeline<UpdateDietPlanCommand>,
    conflict_attempts: u32,
}

fn apply_change(plan: &mut DietPlan, change: &PlanChange) -> Result<DietPlanEvent, DomainError> {
    match change {
        PlanChange::AdjustCalories { daily_calories } => plan.adjust_calories(*daily_calories),
        PlanChange::AddMeal { meal } => plan.add_meal(meal.clone()),
        PlanChange::Activate => plan.activate(),
        PlanChange::Archive { reason } => plan.archive(reason.as_str()),
    }
}

impl<M, R, O> UpdateDietPlanHandler<M, R, O>
where
    M: TransactionManager,
    R: AggregateRepository<DietPlan, Tx = M::Tx> + Clone + 'static,
    O: OutboxStore<Tx = M::Tx> + Clone + 'static,
{
    pub fn new(uow: UnitOfWork<M>, repository: R, outbox: O) -> Self {
        Self {
            uow,
            repository,
            outbox,
            validator: UpdateDietPlanCommand::validator(),
            conflict_attempts: DEFAULT_CONFLICT_ATTEMPTS,
        }
    }

    pub fn with_conflict_attempts(mut self, attempts: u32) -> Self {
        self.conflict_attempts = attempts.max(1);
        self
    }

    /// Execute the update command
    ///
    /// Fails with `AppError::ConcurrencyConflict` when the plan moved past
    /// `expected_version`; the caller decides whether to re-read.
    pub async fn execute(
        &self,
        command: UpdateDietPlanCommand,
        context: &OperationContext,
    ) -> AppResult<PlanCommandResult> {
        self.validator.validate(&command)?;

        let span = tracing::info_span!(
            "update_diet_plan",
            tenant_id = %context.tenant_id,
            plan_id = %command.plan_id,
            change = command.change.name(),
            expected_version = command.expected_version,
            correlation_id = ?context.correlation_id,
        );

        let repository = self.repository.clone();
        let outbox = self.outbox.clone();
        let tenant_id = context.tenant_id.clone();

        let result = self
            .uow
            .execute_with_retry(
                move |tx| {
                    let repository = repository.clone();
                    let outbox = outbox.clone();
                    let command = command.clone();
                    let tenant_id = tenant_id.clone();

                    async move {
                        let mut plan: Versioned<DietPlan> = repository
                            .load(tx, &command.plan_id)
                            .await?
                            .filter(|p: &Versioned<DietPlan>| p.state().tenant_id() == tenant_id)
                            .ok_or_else(|| {
                                DomainError::not_found(DietPlan::aggregate_type(), &command.plan_id)
                            })?;

                        let event = plan.mutate(command.expected_version, |state| {
                            apply_change(state, &command.change)
                        })?;

                        repository.save(tx, &plan, command.expected_version).await?;

                        let record = outbox
                            .save_event(
                                tx,
                                NewOutboxEvent::json(
                                    plan.id(),
                                    DietPlan::aggregate_type(),
                                    event.event_type(),
                                    &event,
                                )?,
                            )
                            .await?;

                        Ok::<_, AppError>(PlanCommandResult {
                            plan_id: command.plan_id,
                            version: plan.version(),
                            event_id: record.id,
                        })
                    }
                    .boxed()
                },
                self.uow.policy().max_retries,
            )
            .instrument(span)
            .await;

        match &result {
            Ok(done) => tracing::info!(
                plan_id = %done.plan_id,
                version = done.version,
                event_id = %done.event_id,
                "Diet plan updated"
            ),
            Err(AppError::ConcurrencyConflict(conflict)) => tracing::debug!(
                plan_id = %conflict.aggregate_id,
                expected = conflict.expected,
                actual = conflict.actual,
                "Diet plan update lost to a concurrent writer"
            ),
            Err(_) => {}
        }

        result
    }

    /// Set the calorie target regardless of concurrent edits
    ///
    /// Re-reads the plan and re-applies the change after each conflict, up
    /// to the configured number of rounds.
    pub async fn set_calorie_target(
        &self,
        plan_id: &str,
        daily_calories: u32,
        context: &OperationContext,
    ) -> AppResult<PlanCommandResult> {
        let mut attempt = 1;

        loop {
            let current: Versioned<DietPlan> = self
                .repository
                .find(plan_id)
                .await?
                .filter(|p: &Versioned<DietPlan>| p.state().tenant_id() == context.tenant_id)
                .ok_or_else(|| DomainError::not_found(DietPlan::aggregate_type(), plan_id))?;

            let command = UpdateDietPlanCommand::new(
                plan_id,
                current.version(),
                PlanChange::AdjustCalories { daily_calories },
            );

            match self.execute(command, context).await {
                Err(AppError::ConcurrencyConflict(conflict))
                    if attempt < self.conflict_attempts =>
                {
                    tracing::debug!(
                        plan_id,
                        attempt,
                        actual = conflict.actual,
                        "Re-reading plan after conflict"
                    );
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
