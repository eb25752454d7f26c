//! Run-at-most-once execution for work driven by an at-least-once
//! orchestrator.
//!
//! This crate provides:
//!
//! - **Idempotency guard**: claims a per-invocation key in the same
//!   transaction as the work, so the side effect and the claim commit
//!   together. Redeliveries find the claim and skip (or run a backup).
//! - **Idempotency ledger**: the table of claimed keys, keyed by idempotency
//!   key and tagged with the owning execution.
//! - **Key derivation**: keys from a stable invocation id, or random keys
//!   remembered in the orchestrator's progress marker.
//! - **Completion tokens**: detach an invocation and report its outcome later
//!   from any task.
//! - **Async-completion interceptor**: does the detach/complete handshake for
//!   operations that return a deferred result.
//! - **Ledger collector**: a background sweep that drops keys of executions
//!   that can no longer retry.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use runonce_guard::{
//!     GuardConfig, GuardError, IdempotencyGuard, InMemoryOrchestrator, InMemoryStore,
//!     InvocationContext, Ledger, Orchestrator,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), GuardError> {
//!     let store = Arc::new(InMemoryStore::new());
//!     let orchestrator: Arc<dyn Orchestrator> = Arc::new(InMemoryOrchestrator::new());
//!     let guard = IdempotencyGuard::new(store, Ledger::default(), GuardConfig::default());
//!
//!     let execution = "patient-1".into();
//!     orchestrator.start_execution(&execution).await?;
//!     let ctx = InvocationContext::start(orchestrator, &execution, &"save".into()).await?;
//!
//!     guard
//!         .run_once(&ctx, |tx| {
//!             Box::pin(async move {
//!                 tx.insert("patients", "Alice", json!({"name": "Alice"})).await?;
//!                 Ok::<_, GuardError>(())
//!             })
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod completion;
pub mod error;
pub mod gc;
pub mod guard;
pub mod interceptor;
pub mod keys;
pub mod ledger;
pub mod orchestrator;
pub mod store;
pub mod types;

pub use completion::{CompletionClient, complete_on_return};
pub use error::{GuardError, GuardResult};
pub use gc::{CollectorConfig, CollectorHandle, DEFAULT_SWEEP_INTERVAL, LedgerCollector, SweepReport};
pub use guard::{GuardConfig, IdempotencyGuard, RunOutcome};
pub use interceptor::{AsyncCompletion, ExecutionCleanup, Intercepted, Returned};
pub use keys::KeyDerivation;
pub use ledger::{ClaimOutcome, LEDGER_TABLE, Ledger, LedgerEntry};
pub use orchestrator::{
    DEFAULT_CLOSED_RETENTION, HeartbeatAck, InMemoryOrchestrator, InvocationContext, InvocationInfo, Orchestrator,
    OrchestratorError, OrchestratorResult,
};
pub use store::{
    InMemoryStore, StoreConfig, StoreError, StoreResult, SurrealStore, Transaction,
    TransactionalStore,
};
pub use types::{
    CompletionToken, ExecutionId, Failure, IdempotencyKey, InvocationId, InvocationOutcome,
};
