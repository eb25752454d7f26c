//! Patient onboarding on top of the run-once guard.
//!
//! A submitted [`Patient`] is onboarded as one logical execution:
//!
//! 1. save the patient (guarded, completed asynchronously)
//! 2. assign a hospital
//! 3. assign a doctor
//! 4. notify the patient through the preferred contact method
//! 5. finalize
//!
//! Any failing step marks the patient as not onboarded. The execution's
//! idempotency keys are released once the steps have run.

pub mod activities;
pub mod error;
pub mod model;
pub mod services;
pub mod workflow;

pub use activities::{ONBOARDED, PATIENTS_TABLE, ServiceExecutor};
pub use error::{OnboardingError, Result};
pub use model::{ContactMethod, Doctor, Hospital, Patient};
pub use services::{
    DEFAULT_SIMULATED_DELAY, HttpServices, OnboardingServices, ServicesConfig, SimulatedServices,
};
pub use workflow::{NOT_ONBOARDED, OnboardingWorkflow};
