//! The orchestrator collaborator.
//!
//! The orchestrator drives executions, delivers invocations (at least once),
//! hands out completion tokens and keeps the durable progress marker of each
//! invocation. [`Orchestrator`] is the contract this crate consumes;
//! [`InMemoryOrchestrator`] is a complete single-process implementation.
//!
//! Each delivery of an invocation is represented by an [`InvocationContext`],
//! which activities receive explicitly instead of reading ambient state.

pub mod error;
pub mod memory;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

pub use error::{OrchestratorError, OrchestratorResult};
pub use memory::{DEFAULT_CLOSED_RETENTION, InMemoryOrchestrator};

use crate::completion::CompletionClient;
use crate::types::{CompletionToken, ExecutionId, Failure, InvocationId, InvocationOutcome};

/// Identity of one delivery of an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationInfo {
    /// The owning execution.
    pub execution_id: ExecutionId,
    /// The invocation within the execution.
    pub invocation_id: InvocationId,
    /// Delivery attempt, starting at 1.
    pub attempt: u32,
    /// Token authorizing one completion of this attempt.
    pub token: CompletionToken,
}

/// Orchestrator response to a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartbeatAck {
    /// The orchestrator asks the invocation to stop and report cancellation.
    pub cancel_requested: bool,
}

/// Contract of the external orchestrator.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Start a new logical execution.
    async fn start_execution(&self, execution_id: &ExecutionId) -> OrchestratorResult<()>;

    /// Mark an execution terminated. It can no longer redeliver invocations.
    async fn close_execution(&self, execution_id: &ExecutionId) -> OrchestratorResult<()>;

    /// Deliver an invocation. Redelivery of an invocation without an outcome
    /// bumps the attempt and mints a fresh token.
    async fn start_invocation(
        &self,
        execution_id: &ExecutionId,
        invocation_id: &InvocationId,
    ) -> OrchestratorResult<InvocationInfo>;

    /// Ids of every execution that has not terminated.
    async fn open_executions(&self) -> OrchestratorResult<Vec<ExecutionId>>;

    /// Last details recorded by a heartbeat for this invocation.
    async fn read_progress_marker(
        &self,
        execution_id: &ExecutionId,
        invocation_id: &InvocationId,
    ) -> OrchestratorResult<Option<Value>>;

    /// Record liveness and durably store `details` as the progress marker.
    async fn heartbeat(
        &self,
        token: &CompletionToken,
        details: Value,
    ) -> OrchestratorResult<HeartbeatAck>;

    /// Report success. Consumes the token.
    async fn complete(&self, token: &CompletionToken, value: Value) -> OrchestratorResult<()>;

    /// Report failure. Consumes the token.
    async fn complete_exceptionally(
        &self,
        token: &CompletionToken,
        failure: Failure,
    ) -> OrchestratorResult<()>;

    /// Report cancellation. Consumes the token.
    async fn report_cancellation(
        &self,
        token: &CompletionToken,
        details: Value,
    ) -> OrchestratorResult<()>;

    /// Ask a running invocation to cancel. Observed through heartbeats.
    async fn request_cancellation(
        &self,
        execution_id: &ExecutionId,
        invocation_id: &InvocationId,
    ) -> OrchestratorResult<()>;

    /// Wait until the invocation has an outcome.
    async fn wait_for_outcome(
        &self,
        execution_id: &ExecutionId,
        invocation_id: &InvocationId,
    ) -> OrchestratorResult<InvocationOutcome>;

    /// Record the human-readable status of an execution.
    async fn record_status(&self, execution_id: &ExecutionId, status: String)
    -> OrchestratorResult<()>;

    /// Read the recorded status of an execution.
    async fn read_status(&self, execution_id: &ExecutionId) -> OrchestratorResult<Option<String>>;
}

/// Handle for one delivery of an invocation.
///
/// Cloning shares the detached flag, so a clone moved into a background task
/// still sees a `detach()` performed by the caller.
#[derive(Clone)]
pub struct InvocationContext {
    info: InvocationInfo,
    orchestrator: Arc<dyn Orchestrator>,
    detached: Arc<AtomicBool>,
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("info", &self.info)
            .field("detached", &self.is_detached())
            .finish_non_exhaustive()
    }
}

impl InvocationContext {
    /// Wrap a delivery.
    pub fn new(info: InvocationInfo, orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            info,
            orchestrator,
            detached: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Deliver `invocation_id` and wrap the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the orchestrator refuses the delivery.
    pub async fn start(
        orchestrator: Arc<dyn Orchestrator>,
        execution_id: &ExecutionId,
        invocation_id: &InvocationId,
    ) -> OrchestratorResult<Self> {
        let info = orchestrator
            .start_invocation(execution_id, invocation_id)
            .await?;
        Ok(Self::new(info, orchestrator))
    }

    #[must_use]
    pub const fn info(&self) -> &InvocationInfo {
        &self.info
    }

    #[must_use]
    pub const fn execution_id(&self) -> &ExecutionId {
        &self.info.execution_id
    }

    #[must_use]
    pub const fn invocation_id(&self) -> &InvocationId {
        &self.info.invocation_id
    }

    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.info.attempt
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<dyn Orchestrator> {
        &self.orchestrator
    }

    /// Tell the dispatcher not to complete this invocation on return, and
    /// take the client that will complete it later.
    #[must_use]
    pub fn detach(&self) -> CompletionClient {
        self.detached.store(true, Ordering::SeqCst);
        debug!(
            execution_id = %self.info.execution_id,
            invocation_id = %self.info.invocation_id,
            attempt = self.info.attempt,
            "Invocation detached"
        );
        CompletionClient::new(Arc::clone(&self.orchestrator), self.info.clone())
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Decode the progress marker recorded for this invocation, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the orchestrator read fails or the marker does
    /// not decode as `V`.
    pub async fn progress_marker<V: DeserializeOwned>(&self) -> OrchestratorResult<Option<V>> {
        self.orchestrator
            .read_progress_marker(&self.info.execution_id, &self.info.invocation_id)
            .await?
            .map(serde_json::from_value)
            .transpose()
            .map_err(OrchestratorError::from)
    }

    /// Heartbeat with `details` recorded as the progress marker.
    ///
    /// # Errors
    ///
    /// Returns an error if `details` cannot be serialized or the orchestrator
    /// rejects the heartbeat.
    pub async fn heartbeat<V: Serialize + Sync>(
        &self,
        details: &V,
    ) -> OrchestratorResult<HeartbeatAck> {
        let details = serde_json::to_value(details)?;
        self.orchestrator
            .heartbeat(&self.info.token, details)
            .await
    }
}
