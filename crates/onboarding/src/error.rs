//! Onboarding errors.

use runonce_guard::{Failure, GuardError, OrchestratorError, StoreError};
use thiserror::Error;

/// Errors raised while onboarding a patient.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OnboardingError {
    /// The guard, its store or the orchestrator failed.
    #[error(transparent)]
    Guard(#[from] GuardError),

    /// A downstream service call failed.
    #[error("{operation} failed: {reason}")]
    Service { operation: String, reason: String },

    /// A detached step reported failure through its completion token.
    #[error("step '{step}' failed: {failure}")]
    StepFailed { step: String, failure: Failure },

    /// A detached step acknowledged cancellation.
    #[error("step '{step}' was cancelled")]
    StepCancelled { step: String },

    /// Service configuration is unusable.
    #[error("invalid service configuration: {reason}")]
    Config { reason: String },
}

impl OnboardingError {
    /// Create a service error.
    pub fn service(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Service {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for OnboardingError {
    fn from(err: StoreError) -> Self {
        Self::Guard(GuardError::Store(err))
    }
}

impl From<OrchestratorError> for OnboardingError {
    fn from(err: OrchestratorError) -> Self {
        Self::Guard(GuardError::Orchestrator(err))
    }
}

/// Result type for onboarding operations.
pub type Result<T> = std::result::Result<T, OnboardingError>;
