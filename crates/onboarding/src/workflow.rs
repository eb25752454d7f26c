//! The onboarding workflow.
//!
//! One onboarding is one logical execution keyed by the patient id. Each
//! step is delivered as its own invocation; the status text is recorded on
//! the execution before every step so it can be queried while the workflow
//! runs.

use std::future::Future;
use std::sync::Arc;

use runonce_guard::{
    ExecutionCleanup, ExecutionId, GuardError, Intercepted, InvocationContext, InvocationId,
    InvocationOutcome, Orchestrator, complete_on_return,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::activities::ServiceExecutor;
use crate::error::{OnboardingError, Result};
use crate::model::{ContactMethod, Patient};

/// `onboarded` value for a patient whose onboarding failed.
pub const NOT_ONBOARDED: &str = "no";

/// Drives the onboarding steps against the orchestrator.
#[derive(Clone)]
pub struct OnboardingWorkflow {
    orchestrator: Arc<dyn Orchestrator>,
    executor: ServiceExecutor,
    cleanup: ExecutionCleanup,
}

impl std::fmt::Debug for OnboardingWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnboardingWorkflow")
            .field("executor", &self.executor)
            .field("cleanup", &self.cleanup)
            .finish_non_exhaustive()
    }
}

impl OnboardingWorkflow {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        executor: ServiceExecutor,
        cleanup: ExecutionCleanup,
    ) -> Self {
        Self {
            orchestrator,
            executor,
            cleanup,
        }
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<dyn Orchestrator> {
        &self.orchestrator
    }

    /// Onboard `patient` and return it with its assignments filled in.
    ///
    /// A failing step does not fail the call: the patient comes back with
    /// `onboarded` set to [`NOT_ONBOARDED`].
    ///
    /// # Errors
    ///
    /// Returns an error if the execution cannot be started, for instance
    /// because an onboarding with the same patient id is still running.
    pub async fn onboard(&self, patient: Patient) -> Result<Patient> {
        let execution_id = ExecutionId::new(patient.id.clone());
        self.orchestrator.start_execution(&execution_id).await?;
        info!(execution_id = %execution_id, patient = %patient.name, "Onboarding started");

        let patient = self
            .cleanup
            .around(&execution_id, self.run_steps(&execution_id, patient))
            .await;

        if let Err(err) = self.orchestrator.close_execution(&execution_id).await {
            warn!(execution_id = %execution_id, error = %err, "Failed to close execution");
        }
        info!(
            execution_id = %execution_id,
            onboarded = patient.onboarded.as_deref().unwrap_or_default(),
            "Onboarding finished"
        );
        Ok(patient)
    }

    /// The status text of the onboarding with `id`.
    ///
    /// Never fails: an unknown id yields an explanatory message instead.
    pub async fn status(&self, id: &str) -> String {
        match self.orchestrator.read_status(&ExecutionId::new(id)).await {
            Ok(status) => status.unwrap_or_default(),
            Err(err) => {
                debug!(execution_id = id, error = %err, "Status query failed");
                format!("Unable to query workflow with id: {id}")
            }
        }
    }

    async fn run_steps(&self, execution_id: &ExecutionId, mut patient: Patient) -> Patient {
        if let Err(err) = self.try_steps(execution_id, &mut patient).await {
            error!(execution_id = %execution_id, error = %err, "Onboarding failed");
            patient.onboarded = Some(NOT_ONBOARDED.to_string());
        }
        patient
    }

    async fn try_steps(&self, execution_id: &ExecutionId, patient: &mut Patient) -> Result<()> {
        self.record_status(execution_id, "Saving the patient to the db".to_string())
            .await?;
        let saved = patient.clone();
        let executor = self.executor.clone();
        self.dispatch(execution_id, "save_patient", move |ctx| async move {
            executor.save_patient(&ctx, &saved)
        })
        .await?;

        self.record_status(
            execution_id,
            format!("Assigning hospital to patient: {}", patient.name),
        )
        .await?;
        let zip = patient.zip.clone();
        let executor = self.executor.clone();
        let hospital = self
            .dispatch(execution_id, "assign_hospital", move |ctx| async move {
                Intercepted::Returned(executor.assign_hospital_to_patient(&ctx, &zip).await)
            })
            .await?;
        patient.hospital = Some(hospital);

        self.record_status(
            execution_id,
            format!("Assigning doctor to patient: {}", patient.name),
        )
        .await?;
        let condition = patient.condition.clone();
        let executor = self.executor.clone();
        let doctor = self
            .dispatch(execution_id, "assign_doctor", move |ctx| async move {
                Intercepted::Returned(executor.assign_doctor_to_patient(&ctx, &condition).await)
            })
            .await?;
        patient.doctor = Some(doctor);

        self.record_status(execution_id, format!("Notifying patient: {}", patient.name))
            .await?;
        let method = patient.contact_method;
        let contact = patient.contact_address().to_string();
        let executor = self.executor.clone();
        self.dispatch(execution_id, "notify_patient", move |ctx| async move {
            Intercepted::Returned(match method {
                ContactMethod::Phone => executor.notify_via_email(&ctx, &contact).await,
                ContactMethod::Text => executor.notify_via_text(&ctx, &contact).await,
            })
        })
        .await?;

        self.record_status(
            execution_id,
            format!("Finalizing onboarding for: {}", patient.name),
        )
        .await?;
        let executor = self.executor.clone();
        let onboarded = self
            .dispatch(execution_id, "finalize_onboarding", move |ctx| async move {
                Intercepted::Returned(Ok(executor.finalize_onboarding(&ctx).await))
            })
            .await?;
        patient.onboarded = Some(onboarded);

        Ok(())
    }

    async fn record_status(&self, execution_id: &ExecutionId, status: String) -> Result<()> {
        debug!(execution_id = %execution_id, status = %status, "Status changed");
        self.orchestrator
            .record_status(execution_id, status)
            .await
            .map_err(OnboardingError::from)
    }

    /// Deliver one step and return its result.
    ///
    /// A step that detached is resolved through the orchestrator, the same
    /// way a remote caller would see it. A step that returned is completed
    /// here.
    async fn dispatch<T, F, Fut>(&self, execution_id: &ExecutionId, step: &str, body: F) -> Result<T>
    where
        F: FnOnce(InvocationContext) -> Fut + Send,
        Fut: Future<Output = Intercepted<T, OnboardingError>> + Send,
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let ctx = InvocationContext::start(
            Arc::clone(&self.orchestrator),
            execution_id,
            &InvocationId::new(step),
        )
        .await?;
        debug!(execution_id = %execution_id, step, attempt = ctx.attempt(), "Dispatching step");

        match body(ctx.clone()).await {
            Intercepted::Returned(result) => {
                complete_on_return(&ctx, &result).await;
                result
            }
            Intercepted::Detached(task) => {
                let delivered = task
                    .await
                    .map_err(|e| GuardError::background_task(e.to_string()))?;
                if !delivered {
                    return Err(OnboardingError::service(step, "completion was not accepted"));
                }

                match self
                    .orchestrator
                    .wait_for_outcome(execution_id, ctx.invocation_id())
                    .await?
                {
                    InvocationOutcome::Completed { value } => serde_json::from_value(value)
                        .map_err(|e| OnboardingError::service(step, e.to_string())),
                    InvocationOutcome::Failed { failure } => Err(OnboardingError::StepFailed {
                        step: step.to_string(),
                        failure,
                    }),
                    InvocationOutcome::Cancelled { .. } => Err(OnboardingError::StepCancelled {
                        step: step.to_string(),
                    }),
                }
            }
        }
    }
}
