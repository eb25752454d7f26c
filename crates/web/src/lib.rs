//! runonce web server
//!
//! HTTP API for patient onboarding, with tower middleware for CORS and
//! tracing.

use std::future::Future;
use std::net::SocketAddr;

use axum::{Router, http::Method};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

pub mod error;
pub mod routes;
pub mod state;

pub use error::{AppError, ErrorResponse};
pub use state::AppState;

/// Create the application: every route plus middleware.
pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    routes::create_router().with_state(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors),
    )
}

/// Serve the application on `addr` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve<F>(addr: SocketAddr, state: AppState, shutdown: F) -> Result<(), Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Web server listening");

    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Web server stopped");
    Ok(())
}

/// Web server errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::indexing_slicing)]

    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use runonce_guard::{
        ExecutionCleanup, GuardConfig, IdempotencyGuard, InMemoryOrchestrator, InMemoryStore,
        Ledger, Orchestrator, TransactionalStore,
    };
    use runonce_onboarding::{OnboardingWorkflow, ServiceExecutor, SimulatedServices};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_app() -> Router {
        let store: Arc<dyn TransactionalStore> = Arc::new(InMemoryStore::new());
        let orchestrator: Arc<dyn Orchestrator> = Arc::new(InMemoryOrchestrator::new());
        let guard =
            IdempotencyGuard::new(Arc::clone(&store), Ledger::default(), GuardConfig::default());
        let executor = ServiceExecutor::new(guard, Arc::new(SimulatedServices::default()));
        let workflow = OnboardingWorkflow::new(
            orchestrator,
            executor,
            ExecutionCleanup::new(store, Ledger::default()),
        );
        create_app(AppState::new(workflow))
    }

    async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = test_app().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_onboard_then_query_status() {
        let app = test_app();
        let patient = json!({
            "id": "p-7",
            "name": "Grace",
            "zip": "60601",
            "condition": "skin",
            "contactMethod": "TEXT",
            "phone": "555-0107"
        });

        let response = app
            .clone()
            .oneshot(post_json("/onboard", &patient))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["onboarded"], "yes");
        assert_eq!(body["doctor"]["specialty"], "Dermatology");

        let response = app.oneshot(get("/onboard?id=p-7")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_bytes(response).await,
            b"Finalizing onboarding for: Grace".to_vec()
        );
    }

    #[tokio::test]
    async fn test_status_of_unknown_id() {
        let response = test_app().oneshot(get("/onboard?id=ghost")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_bytes(response).await,
            b"Unable to query workflow with id: ghost".to_vec()
        );
    }

    #[tokio::test]
    async fn test_missing_fields_are_rejected() {
        let response = test_app()
            .oneshot(post_json("/onboard", &json!({"id": "", "name": "Hal"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["status"], 400);

        let response = test_app().oneshot(get("/onboard")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_body_is_problem_details() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/onboard")
            .header("content-type", "application/json")
            .body(Body::from("{\"id\": \"p-9\", \"name\":"))
            .unwrap();

        let response = test_app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["status"], 400);
        assert_eq!(body["title"], "Bad Request");
        assert!(body["detail"].as_str().unwrap().starts_with("Invalid request:"));
    }
}
