//! Shared handler state.

use std::sync::Arc;

use runonce_onboarding::OnboardingWorkflow;

#[derive(Debug, Clone)]
pub struct AppState {
    pub workflow: Arc<OnboardingWorkflow>,
}

impl AppState {
    pub fn new(workflow: OnboardingWorkflow) -> Self {
        Self {
            workflow: Arc::new(workflow),
        }
    }
}
