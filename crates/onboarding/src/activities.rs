//! Onboarding activities.
//!
//! Each activity runs as one invocation of the onboarding execution. Saving
//! the patient is the only step with a local side effect, so it is the one
//! run through the idempotency guard; it also completes asynchronously.

use std::sync::Arc;
use std::time::Duration;

use runonce_guard::{AsyncCompletion, IdempotencyGuard, Intercepted, InvocationContext, Returned};
use tracing::info;

use crate::error::{OnboardingError, Result};
use crate::model::{Doctor, Hospital, Patient};
use crate::services::OnboardingServices;

/// Table holding saved patients, keyed by patient name.
pub const PATIENTS_TABLE: &str = "patients";

/// Value returned by [`ServiceExecutor::finalize_onboarding`].
pub const ONBOARDED: &str = "yes";

/// Runs the onboarding activities.
#[derive(Clone)]
pub struct ServiceExecutor {
    guard: IdempotencyGuard,
    services: Arc<dyn OnboardingServices>,
    work_delay: Duration,
}

impl std::fmt::Debug for ServiceExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceExecutor")
            .field("guard", &self.guard)
            .field("work_delay", &self.work_delay)
            .finish_non_exhaustive()
    }
}

impl ServiceExecutor {
    pub fn new(guard: IdempotencyGuard, services: Arc<dyn OnboardingServices>) -> Self {
        Self {
            guard,
            services,
            work_delay: Duration::ZERO,
        }
    }

    /// Simulated processing time added after each activity's real work.
    #[must_use]
    pub const fn with_work_delay(mut self, work_delay: Duration) -> Self {
        self.work_delay = work_delay;
        self
    }

    #[must_use]
    pub const fn guard(&self) -> &IdempotencyGuard {
        &self.guard
    }

    /// Insert the patient into [`PATIENTS_TABLE`], at most once per invocation.
    ///
    /// The insert is handed back as a deferred result, so the invocation is
    /// detached and completed from a background task.
    pub fn save_patient(&self, ctx: &InvocationContext, patient: &Patient) -> Intercepted<(), OnboardingError> {
        info!(execution_id = %ctx.execution_id(), patient = %patient.name, "Saving the patient");

        let guard = self.guard.clone();
        let work_delay = self.work_delay;
        let owned_ctx = ctx.clone();
        let patient = patient.clone();

        AsyncCompletion::around(ctx, "save_patient", move || {
            Returned::deferred(async move {
                let row = serde_json::to_value(&patient)
                    .map_err(|e| OnboardingError::service("save patient", e.to_string()))?;
                let name = patient.name;

                let outcome = guard
                    .run_once(&owned_ctx, move |tx| {
                        Box::pin(async move {
                            tx.insert(PATIENTS_TABLE, &name, row).await?;
                            Ok::<_, OnboardingError>(())
                        })
                    })
                    .await?;

                if !outcome.is_executed() {
                    info!(execution_id = %owned_ctx.execution_id(), "Patient already saved");
                }
                pause(work_delay).await;
                Ok(())
            })
        })
    }

    /// Ask the onboarding service for a hospital near the patient.
    ///
    /// # Errors
    ///
    /// Returns an error if the service call fails.
    pub async fn assign_hospital_to_patient(&self, ctx: &InvocationContext, zip: &str) -> Result<Hospital> {
        info!(execution_id = %ctx.execution_id(), zip, "Assigning hospital to patient");
        let hospital = self.services.assign_hospital(zip).await?;
        pause(self.work_delay).await;
        Ok(hospital)
    }

    /// Ask the onboarding service for a doctor treating `condition`.
    ///
    /// # Errors
    ///
    /// Returns an error if the service call fails.
    pub async fn assign_doctor_to_patient(&self, ctx: &InvocationContext, condition: &str) -> Result<Doctor> {
        info!(execution_id = %ctx.execution_id(), condition, "Assigning doctor to patient");
        let doctor = self.services.assign_doctor(condition).await?;
        pause(self.work_delay).await;
        Ok(doctor)
    }

    /// # Errors
    ///
    /// Returns an error if the notification cannot be sent.
    pub async fn notify_via_email(&self, ctx: &InvocationContext, email: &str) -> Result<()> {
        info!(execution_id = %ctx.execution_id(), "Notifying via email");
        self.services.notify(email).await?;
        pause(self.work_delay).await;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the notification cannot be sent.
    pub async fn notify_via_text(&self, ctx: &InvocationContext, phone: &str) -> Result<()> {
        info!(execution_id = %ctx.execution_id(), "Notifying via text");
        self.services.notify(phone).await?;
        pause(self.work_delay).await;
        Ok(())
    }

    /// Mark onboarding done. Always returns [`ONBOARDED`].
    pub async fn finalize_onboarding(&self, ctx: &InvocationContext) -> String {
        info!(execution_id = %ctx.execution_id(), "Finalizing");
        pause(self.work_delay).await;
        ONBOARDED.to_string()
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
