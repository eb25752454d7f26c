//! Onboarding API driven in-process while a workflow is still running.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use http_body_util::BodyExt;
use runonce_guard::{
    ExecutionCleanup, GuardConfig, IdempotencyGuard, InMemoryOrchestrator, InMemoryStore, Ledger,
    Orchestrator, TransactionalStore,
};
use runonce_onboarding::{OnboardingWorkflow, ServiceExecutor, ServicesConfig};
use runonce_web::{AppState, ErrorResponse, create_app};
use serde_json::json;
use tower::ServiceExt;

fn slow_app() -> Router {
    let store: Arc<dyn TransactionalStore> = Arc::new(InMemoryStore::new());
    let orchestrator: Arc<dyn Orchestrator> = Arc::new(InMemoryOrchestrator::new());
    let guard = IdempotencyGuard::new(Arc::clone(&store), Ledger::default(), GuardConfig::default());
    let services = ServicesConfig::default()
        .with_simulated_delay_ms(100)
        .build()
        .unwrap();
    let executor = ServiceExecutor::new(guard, services);
    let workflow = OnboardingWorkflow::new(
        orchestrator,
        executor,
        ExecutionCleanup::new(store, Ledger::default()),
    );
    create_app(AppState::new(workflow))
}

fn onboard_request() -> Request<Body> {
    let patient = json!({
        "id": "p-42",
        "name": "Ivy",
        "zip": "73301",
        "email": "ivy@example.com"
    });
    Request::builder()
        .method(Method::POST)
        .uri("/onboard")
        .header("content-type", "application/json")
        .body(Body::from(patient.to_string()))
        .unwrap()
}

async fn text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_duplicate_while_running_is_conflict_and_status_is_live() {
    let app = slow_app();

    let first = tokio::spawn(app.clone().oneshot(onboard_request()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/onboard?id=p-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(status.status(), StatusCode::OK);
    let status = text(status).await;
    assert!(
        !status.is_empty() && !status.starts_with("Unable"),
        "status while running: {status}"
    );

    let duplicate = app.clone().oneshot(onboard_request()).await.unwrap();
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);
    let problem: ErrorResponse = serde_json::from_str(&text(duplicate).await).unwrap();
    assert_eq!(problem.status, 409);

    let response = first.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Once finished the id can be onboarded again.
    let again = app.oneshot(onboard_request()).await.unwrap();
    assert_eq!(again.status(), StatusCode::OK);
}
