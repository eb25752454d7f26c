//! HTTP routes
//!
//! - `GET /health` - Health check endpoint
//! - `POST /onboard` - Onboard a patient
//! - `GET /onboard?id=` - Query onboarding status by patient id

use axum::{
    Router,
    routing::get,
};

use crate::state::AppState;

pub mod health;
pub mod onboard;

/// Create the router with every endpoint registered.
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/onboard",
            get(onboard::onboarding_status).post(onboard::onboard_patient),
        )
}
