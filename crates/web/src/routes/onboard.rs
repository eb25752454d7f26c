//! Onboarding endpoints: POST /onboard, GET /onboard?id=

use axum::{
    extract::{Query, State, rejection::JsonRejection},
    response::Json,
};
use runonce_onboarding::Patient;
use serde::Deserialize;
use tracing::info;

use crate::error::{AppError, Result};
use crate::state::AppState;

/// Query string of the status endpoint
#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    id: Option<String>,
}

/// POST /onboard - Onboard a patient and return it with its assignments
///
/// The patient id names the onboarding; a second request with the same id
/// while the first is still running is rejected with 409.
pub async fn onboard_patient(
    State(state): State<AppState>,
    payload: std::result::Result<Json<Patient>, JsonRejection>,
) -> Result<Json<Patient>> {
    let Json(patient) = payload?;
    validate(&patient)?;
    info!(patient_id = %patient.id, "About to call onboard workflow");
    let patient = state.workflow.onboard(patient).await?;
    Ok(Json(patient))
}

/// GET /onboard?id= - Current status text of an onboarding
pub async fn onboarding_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<String> {
    let id = query
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing required query parameter: id".to_string()))?;
    Ok(state.workflow.status(&id).await)
}

fn validate(patient: &Patient) -> Result<()> {
    if patient.id.trim().is_empty() {
        return Err(AppError::BadRequest("Missing required field: id".to_string()));
    }
    if patient.name.trim().is_empty() {
        return Err(AppError::BadRequest("Missing required field: name".to_string()));
    }
    Ok(())
}
