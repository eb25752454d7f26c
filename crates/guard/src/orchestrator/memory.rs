//! In-process orchestrator.
//!
//! Keeps executions and their invocations in memory. Tokens are the
//! JSON-encoded `(execution, invocation, attempt)` triple; an invocation's
//! outcome lives in a `watch` channel so waiters wake when it is settled.
//!
//! Closed executions are kept so their status can still be read, up to a
//! retention cap; past it the oldest closed execution is forgotten.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info};

use super::error::{OrchestratorError, OrchestratorResult};
use super::{HeartbeatAck, InvocationInfo, Orchestrator};
use crate::types::{CompletionToken, ExecutionId, Failure, InvocationId, InvocationOutcome};

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    execution_id: ExecutionId,
    invocation_id: InvocationId,
    attempt: u32,
}

impl TokenClaims {
    fn encode(&self) -> OrchestratorResult<CompletionToken> {
        Ok(CompletionToken::from_bytes(serde_json::to_vec(self)?))
    }

    fn decode(token: &CompletionToken) -> OrchestratorResult<Self> {
        serde_json::from_slice(token.as_bytes())
            .map_err(|e| OrchestratorError::invalid_token(e.to_string()))
    }
}

struct InvocationRecord {
    attempt: u32,
    marker: Option<Value>,
    cancel_requested: bool,
    outcome: watch::Sender<Option<InvocationOutcome>>,
}

impl InvocationRecord {
    fn new() -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            attempt: 0,
            marker: None,
            cancel_requested: false,
            outcome,
        }
    }

    fn is_settled(&self) -> bool {
        self.outcome.borrow().is_some()
    }
}

struct ExecutionRecord {
    open: bool,
    status: Option<String>,
    invocations: HashMap<InvocationId, InvocationRecord>,
}

impl ExecutionRecord {
    fn new() -> Self {
        Self {
            open: true,
            status: None,
            invocations: HashMap::new(),
        }
    }
}

type Executions = HashMap<ExecutionId, ExecutionRecord>;

/// Default number of closed executions kept for status queries.
pub const DEFAULT_CLOSED_RETENTION: usize = 1024;

#[derive(Default)]
struct Registry {
    executions: Executions,
    /// Closed executions, oldest first.
    closed: VecDeque<ExecutionId>,
}

impl Registry {
    fn close(&mut self, execution_id: &ExecutionId, retention: usize) -> OrchestratorResult<()> {
        let execution = self
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| OrchestratorError::execution_not_found(execution_id.as_str()))?;
        if !execution.open {
            return Ok(());
        }
        execution.open = false;
        self.closed.push_back(execution_id.clone());

        while self.closed.len() > retention {
            if let Some(evicted) = self.closed.pop_front() {
                self.executions.remove(&evicted);
                debug!(execution_id = %evicted, "Closed execution evicted");
            }
        }
        Ok(())
    }
}

/// Look up the invocation a token authorizes, enforcing the one-shot rules.
fn authorized<'a>(
    executions: &'a mut Executions,
    claims: &TokenClaims,
) -> OrchestratorResult<&'a mut InvocationRecord> {
    let execution = executions
        .get_mut(&claims.execution_id)
        .ok_or_else(|| OrchestratorError::execution_not_found(claims.execution_id.as_str()))?;

    if !execution.open {
        return Err(OrchestratorError::execution_closed(
            claims.execution_id.as_str(),
        ));
    }

    let invocation = execution
        .invocations
        .get_mut(&claims.invocation_id)
        .ok_or_else(|| {
            OrchestratorError::invocation_not_found(
                claims.execution_id.as_str(),
                claims.invocation_id.as_str(),
            )
        })?;

    if invocation.is_settled() {
        return Err(OrchestratorError::TokenAlreadyUsed {
            invocation_id: claims.invocation_id.to_string(),
        });
    }

    if invocation.attempt != claims.attempt {
        return Err(OrchestratorError::StaleToken {
            presented: claims.attempt,
            current: invocation.attempt,
        });
    }

    Ok(invocation)
}

/// Orchestrator that lives entirely in this process.
pub struct InMemoryOrchestrator {
    registry: RwLock<Registry>,
    retention: usize,
}

impl Default for InMemoryOrchestrator {
    fn default() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            retention: DEFAULT_CLOSED_RETENTION,
        }
    }
}

impl InMemoryOrchestrator {
    /// Create an orchestrator with no executions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `retention` closed executions.
    #[must_use]
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    /// Check whether an execution exists and has not been closed.
    pub async fn is_open(&self, execution_id: &ExecutionId) -> bool {
        self.registry
            .read()
            .await
            .executions
            .get(execution_id)
            .is_some_and(|e| e.open)
    }

    /// Number of executions currently remembered, open or closed.
    pub async fn execution_count(&self) -> usize {
        self.registry.read().await.executions.len()
    }

    async fn settle(
        &self,
        token: &CompletionToken,
        outcome: InvocationOutcome,
    ) -> OrchestratorResult<()> {
        let claims = TokenClaims::decode(token)?;
        let mut registry = self.registry.write().await;
        let invocation = authorized(&mut registry.executions, &claims)?;
        invocation.outcome.send_replace(Some(outcome));
        debug!(
            execution_id = %claims.execution_id,
            invocation_id = %claims.invocation_id,
            attempt = claims.attempt,
            "Invocation settled"
        );
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for InMemoryOrchestrator {
    async fn start_execution(&self, execution_id: &ExecutionId) -> OrchestratorResult<()> {
        let mut guard = self.registry.write().await;
        let registry = &mut *guard;
        if registry.executions.get(execution_id).is_some_and(|e| e.open) {
            return Err(OrchestratorError::ExecutionAlreadyStarted {
                execution_id: execution_id.to_string(),
            });
        }
        registry.closed.retain(|id| id != execution_id);
        registry
            .executions
            .insert(execution_id.clone(), ExecutionRecord::new());
        info!(execution_id = %execution_id, "Execution started");
        Ok(())
    }

    async fn close_execution(&self, execution_id: &ExecutionId) -> OrchestratorResult<()> {
        self.registry
            .write()
            .await
            .close(execution_id, self.retention)?;
        info!(execution_id = %execution_id, "Execution closed");
        Ok(())
    }

    async fn start_invocation(
        &self,
        execution_id: &ExecutionId,
        invocation_id: &InvocationId,
    ) -> OrchestratorResult<InvocationInfo> {
        let mut registry = self.registry.write().await;
        let execution = registry
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| OrchestratorError::execution_not_found(execution_id.as_str()))?;

        if !execution.open {
            return Err(OrchestratorError::execution_closed(execution_id.as_str()));
        }

        let invocation = execution
            .invocations
            .entry(invocation_id.clone())
            .or_insert_with(InvocationRecord::new);

        if invocation.is_settled() {
            return Err(OrchestratorError::InvocationCompleted {
                invocation_id: invocation_id.to_string(),
            });
        }

        invocation.attempt = invocation.attempt.saturating_add(1);
        invocation.cancel_requested = false;

        let claims = TokenClaims {
            execution_id: execution_id.clone(),
            invocation_id: invocation_id.clone(),
            attempt: invocation.attempt,
        };
        let token = claims.encode()?;

        debug!(
            execution_id = %execution_id,
            invocation_id = %invocation_id,
            attempt = claims.attempt,
            "Invocation delivered"
        );

        Ok(InvocationInfo {
            execution_id: claims.execution_id,
            invocation_id: claims.invocation_id,
            attempt: claims.attempt,
            token,
        })
    }

    async fn open_executions(&self) -> OrchestratorResult<Vec<ExecutionId>> {
        let registry = self.registry.read().await;
        let mut open: Vec<ExecutionId> = registry
            .executions
            .iter()
            .filter(|(_, e)| e.open)
            .map(|(id, _)| id.clone())
            .collect();
        open.sort();
        Ok(open)
    }

    async fn read_progress_marker(
        &self,
        execution_id: &ExecutionId,
        invocation_id: &InvocationId,
    ) -> OrchestratorResult<Option<Value>> {
        let registry = self.registry.read().await;
        let execution = registry
            .executions
            .get(execution_id)
            .ok_or_else(|| OrchestratorError::execution_not_found(execution_id.as_str()))?;
        Ok(execution
            .invocations
            .get(invocation_id)
            .and_then(|i| i.marker.clone()))
    }

    async fn heartbeat(
        &self,
        token: &CompletionToken,
        details: Value,
    ) -> OrchestratorResult<HeartbeatAck> {
        let claims = TokenClaims::decode(token)?;
        let mut registry = self.registry.write().await;
        let invocation = authorized(&mut registry.executions, &claims)?;
        invocation.marker = Some(details);
        Ok(HeartbeatAck {
            cancel_requested: invocation.cancel_requested,
        })
    }

    async fn complete(&self, token: &CompletionToken, value: Value) -> OrchestratorResult<()> {
        self.settle(token, InvocationOutcome::Completed { value })
            .await
    }

    async fn complete_exceptionally(
        &self,
        token: &CompletionToken,
        failure: Failure,
    ) -> OrchestratorResult<()> {
        self.settle(token, InvocationOutcome::Failed { failure })
            .await
    }

    async fn report_cancellation(
        &self,
        token: &CompletionToken,
        details: Value,
    ) -> OrchestratorResult<()> {
        self.settle(token, InvocationOutcome::Cancelled { details })
            .await
    }

    async fn request_cancellation(
        &self,
        execution_id: &ExecutionId,
        invocation_id: &InvocationId,
    ) -> OrchestratorResult<()> {
        let mut registry = self.registry.write().await;
        let invocation = registry
            .executions
            .get_mut(execution_id)
            .and_then(|e| e.invocations.get_mut(invocation_id))
            .ok_or_else(|| {
                OrchestratorError::invocation_not_found(execution_id.as_str(), invocation_id.as_str())
            })?;
        invocation.cancel_requested = true;
        Ok(())
    }

    async fn wait_for_outcome(
        &self,
        execution_id: &ExecutionId,
        invocation_id: &InvocationId,
    ) -> OrchestratorResult<InvocationOutcome> {
        let not_found =
            || OrchestratorError::invocation_not_found(execution_id.as_str(), invocation_id.as_str());

        let mut rx = {
            let registry = self.registry.read().await;
            registry
                .executions
                .get(execution_id)
                .and_then(|e| e.invocations.get(invocation_id))
                .map(|i| i.outcome.subscribe())
                .ok_or_else(not_found)?
        };

        // The sender disappears if the execution is restarted under the same id.
        let settled = rx.wait_for(Option::is_some).await.map_err(|_| not_found())?;
        let outcome: Option<InvocationOutcome> = (*settled).clone();
        outcome.ok_or_else(not_found)
    }

    async fn record_status(
        &self,
        execution_id: &ExecutionId,
        status: String,
    ) -> OrchestratorResult<()> {
        let mut registry = self.registry.write().await;
        let execution = registry
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| OrchestratorError::execution_not_found(execution_id.as_str()))?;
        execution.status = Some(status);
        Ok(())
    }

    async fn read_status(&self, execution_id: &ExecutionId) -> OrchestratorResult<Option<String>> {
        self.registry
            .read()
            .await
            .executions
            .get(execution_id)
            .map(|e| e.status.clone())
            .ok_or_else(|| OrchestratorError::execution_not_found(execution_id.as_str()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn ids() -> (ExecutionId, InvocationId) {
        (ExecutionId::new("wf-1"), InvocationId::new("save"))
    }

    async fn delivered(orch: &InMemoryOrchestrator) -> InvocationInfo {
        let (exec, inv) = ids();
        orch.start_execution(&exec).await.unwrap();
        orch.start_invocation(&exec, &inv).await.unwrap()
    }

    #[tokio::test]
    async fn test_second_completion_is_rejected() {
        let orch = InMemoryOrchestrator::new();
        let info = delivered(&orch).await;

        orch.complete(&info.token, json!("first")).await.unwrap();
        let err = orch.complete(&info.token, json!("second")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::TokenAlreadyUsed { .. }));

        let outcome = orch
            .wait_for_outcome(&info.execution_id, &info.invocation_id)
            .await
            .unwrap();
        assert_eq!(outcome, InvocationOutcome::Completed { value: json!("first") });
    }

    #[tokio::test]
    async fn test_cancellation_consumes_token() {
        let orch = InMemoryOrchestrator::new();
        let info = delivered(&orch).await;

        orch.report_cancellation(&info.token, json!({})).await.unwrap();
        let err = orch
            .complete_exceptionally(&info.token, Failure::new("Late", "too late"))
            .await
            .unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn test_redelivery_supersedes_old_token() {
        let orch = InMemoryOrchestrator::new();
        let first = delivered(&orch).await;
        let second = orch
            .start_invocation(&first.execution_id, &first.invocation_id)
            .await
            .unwrap();

        assert_eq!(second.attempt, 2);
        assert_ne!(first.token, second.token);

        let err = orch.complete(&first.token, json!(1)).await.unwrap_err();
        assert_eq!(err, OrchestratorError::StaleToken { presented: 1, current: 2 });
        orch.complete(&second.token, json!(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_progress_marker_survives_redelivery() {
        let orch = InMemoryOrchestrator::new();
        let first = delivered(&orch).await;
        orch.heartbeat(&first.token, json!({"step": 1})).await.unwrap();

        let second = orch
            .start_invocation(&first.execution_id, &first.invocation_id)
            .await
            .unwrap();
        let marker = orch
            .read_progress_marker(&second.execution_id, &second.invocation_id)
            .await
            .unwrap();
        assert_eq!(marker, Some(json!({"step": 1})));
    }

    #[tokio::test]
    async fn test_closed_execution_rejects_completion() {
        let orch = InMemoryOrchestrator::new();
        let info = delivered(&orch).await;
        orch.close_execution(&info.execution_id).await.unwrap();

        let err = orch.complete(&info.token, json!(null)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ExecutionClosed { .. }));
        assert!(orch.open_executions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_settled_invocation_is_not_redelivered() {
        let orch = InMemoryOrchestrator::new();
        let info = delivered(&orch).await;
        orch.complete(&info.token, json!(null)).await.unwrap();

        let err = orch
            .start_invocation(&info.execution_id, &info.invocation_id)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvocationCompleted { .. }));
    }

    #[tokio::test]
    async fn test_garbage_token_is_invalid() {
        let orch = InMemoryOrchestrator::new();
        let err = orch
            .complete(&CompletionToken::from_bytes(b"nope".to_vec()), json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidToken { .. }));
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_completion_from_other_task() {
        let orch = Arc::new(InMemoryOrchestrator::new());
        let info = delivered(&orch).await;

        let completer = Arc::clone(&orch);
        let token = info.token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            completer.complete(&token, json!(42)).await
        });

        let outcome = orch
            .wait_for_outcome(&info.execution_id, &info.invocation_id)
            .await
            .unwrap();
        assert_eq!(outcome, InvocationOutcome::Completed { value: json!(42) });
    }

    #[tokio::test]
    async fn test_heartbeat_reports_cancel_request() {
        let orch = InMemoryOrchestrator::new();
        let info = delivered(&orch).await;

        let ack = orch.heartbeat(&info.token, json!(null)).await.unwrap();
        assert!(!ack.cancel_requested);

        orch.request_cancellation(&info.execution_id, &info.invocation_id)
            .await
            .unwrap();
        let ack = orch.heartbeat(&info.token, json!(null)).await.unwrap();
        assert!(ack.cancel_requested);
    }

    #[tokio::test]
    async fn test_closed_executions_are_evicted_past_retention() {
        let orch = InMemoryOrchestrator::new().with_retention(2);
        for id in ["p-1", "p-2", "p-3"] {
            let exec = ExecutionId::new(id);
            orch.start_execution(&exec).await.unwrap();
            orch.record_status(&exec, format!("done {id}")).await.unwrap();
            orch.close_execution(&exec).await.unwrap();
        }
        let running = ExecutionId::new("p-4");
        orch.start_execution(&running).await.unwrap();

        assert_eq!(orch.execution_count().await, 3);
        assert!(orch.read_status(&ExecutionId::new("p-1")).await.is_err());
        assert_eq!(
            orch.read_status(&ExecutionId::new("p-3")).await.unwrap().as_deref(),
            Some("done p-3")
        );
        assert_eq!(orch.open_executions().await.unwrap(), vec![running]);
    }

    #[tokio::test]
    async fn test_restarted_execution_is_not_evicted() {
        let orch = InMemoryOrchestrator::new().with_retention(1);
        let a = ExecutionId::new("A");
        orch.start_execution(&a).await.unwrap();
        orch.close_execution(&a).await.unwrap();
        orch.start_execution(&a).await.unwrap();

        let b = ExecutionId::new("B");
        orch.start_execution(&b).await.unwrap();
        orch.close_execution(&b).await.unwrap();

        assert!(orch.is_open(&a).await);
        assert_eq!(orch.read_status(&b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_status_and_open_set() {
        let orch = InMemoryOrchestrator::new();
        let a = ExecutionId::new("A");
        let b = ExecutionId::new("B");
        orch.start_execution(&a).await.unwrap();
        orch.start_execution(&b).await.unwrap();
        orch.close_execution(&b).await.unwrap();

        assert_eq!(orch.open_executions().await.unwrap(), vec![a.clone()]);
        assert!(orch.start_execution(&a).await.is_err());

        assert_eq!(orch.read_status(&a).await.unwrap(), None);
        orch.record_status(&a, "Saving".to_string()).await.unwrap();
        assert_eq!(orch.read_status(&a).await.unwrap().as_deref(), Some("Saving"));
        assert!(orch.read_status(&ExecutionId::new("missing")).await.is_err());
    }
}
