//! Diet Plan Creation Handler
//!
//! Drafts a plan for an eligible patient. The new aggregate and its
//! `DietPlanDrafted` outbox record are written in one unit of work.

use futures::FutureExt;
use tracing::Instrument;

use crate::aggregate::{Aggregate, DietPlan, Patient, Versioned};
use crate::domain::{ActivePatient, BelongsToTenant, DomainError, OperationContext};
use crate::error::{AppError, AppResult};
use crate::outbox::{NewOutboxEvent, OutboxStore};
use crate::repository::AggregateRepository;
use crate::specification::Specification;
use crate::storage::TransactionManager;
use crate::unit_of_work::UnitOfWork;
use crate::validation::ValidationPipeline;

use super::{CreateDietPlanCommand, PlanCommandResult};

/// Handler for diet plan creation
pub struct CreateDietPlanHandler<M, R, O> {
    uow: UnitOfWork<M>,
    repository: R,
    outbox: O,
    validator: ValidationPipeline<CreateDietPlanCommand>,
}

impl<M, R, O> CreateDietPlanHandler<M, R, O>
where
    M: TransactionManager,
    R: AggregateRepository<DietPlan, Tx = M::Tx>
        + AggregateRepository<Patient, Tx = M::Tx>
        + Clone
        + 'static,
    O: OutboxStore<Tx = M::Tx> + Clone + 'static,
{
    pub fn new(uow: UnitOfWork<M>, repository: R, outbox: O) -> Self {
        Self {
            uow,
            repository,
            outbox,
            validator: CreateDietPlanCommand::validator(),
        }
    }

    /// Execute the create plan command
    pub async fn execute(
        &self,
        command: CreateDietPlanCommand,
        context: &OperationContext,
    ) -> AppResult<PlanCommandResult> {
        self.validator.validate(&command)?;

        let plan_id = command.resolve_plan_id();
        let span = tracing::info_span!(
            "create_diet_plan",
            tenant_id = %context.tenant_id,
            plan_id = %plan_id,
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
                    let plan_id = plan_id.clone();

                    async move {
                        let in_tenant = BelongsToTenant::new(tenant_id.as_str());
                        let patient = <R as AggregateRepository<Patient>>::load(
                            &repository,
                            tx,
                            &command.patient_id,
                        )
                        .await?
                        .filter(|p| in_tenant.is_satisfied_by(p.state()))
                        .ok_or_else(|| {
                            DomainError::not_found(Patient::aggregate_type(), &command.patient_id)
                        })?;

                        if !ActivePatient.is_satisfied_by(patient.state()) {
                            return Err(AppError::from(DomainError::rule(format!(
                                "patient {} is inactive and cannot receive a diet plan",
                                patient.id()
                            ))));
                        }

                        let (state, event) = DietPlan::draft(
                            tenant_id,
                            command.patient_id,
                            command.title,
                            command.daily_calories,
                        )?;
                        let plan = Versioned::create(plan_id, state);

                        <R as AggregateRepository<DietPlan>>::insert(&repository, tx, &plan).await?;

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
                            plan_id: plan.id().to_string(),
                            version: plan.version(),
                            event_id: record.id,
                        })
                    }
                    .boxed()
                },
                self.uow.policy().max_retries,
            )
            .instrument(span)
            .await?;

        tracing::info!(
            plan_id = %result.plan_id,
            event_id = %result.event_id,
            "Diet plan drafted"
        );

        Ok(result)
    }
}
