//! Completion token protocol.
//!
//! A detached invocation is finished out-of-band: whoever holds its
//! [`CompletionClient`] reports exactly one of success, failure or
//! cancellation, and may heartbeat in between. The orchestrator rejects any
//! report after the first.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::{GuardError, GuardResult};
use crate::orchestrator::{
    HeartbeatAck, InvocationContext, InvocationInfo, Orchestrator, OrchestratorError,
};
use crate::types::{CompletionToken, Failure};

fn payload<V: Serialize>(value: &V) -> GuardResult<Value> {
    serde_json::to_value(value).map_err(|e| GuardError::from(OrchestratorError::from(e)))
}

/// Holder of a completion token.
#[derive(Clone)]
pub struct CompletionClient {
    orchestrator: Arc<dyn Orchestrator>,
    info: InvocationInfo,
}

impl std::fmt::Debug for CompletionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionClient")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl CompletionClient {
    /// Build a client for an invocation delivery.
    pub fn new(orchestrator: Arc<dyn Orchestrator>, info: InvocationInfo) -> Self {
        Self { orchestrator, info }
    }

    #[must_use]
    pub const fn token(&self) -> &CompletionToken {
        &self.info.token
    }

    #[must_use]
    pub const fn info(&self) -> &InvocationInfo {
        &self.info
    }

    /// Report success with `value` as the result.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be serialized or the orchestrator
    /// rejects the report (e.g. the token was already used).
    pub async fn complete<V: Serialize + Sync>(&self, value: &V) -> GuardResult<()> {
        let value = payload(value)?;
        self.orchestrator.complete(&self.info.token, value).await?;
        debug!(
            execution_id = %self.info.execution_id,
            invocation_id = %self.info.invocation_id,
            "Completion delivered"
        );
        Ok(())
    }

    /// Report failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the orchestrator rejects the report.
    pub async fn complete_exceptionally(&self, failure: Failure) -> GuardResult<()> {
        self.orchestrator
            .complete_exceptionally(&self.info.token, failure)
            .await?;
        debug!(
            execution_id = %self.info.execution_id,
            invocation_id = %self.info.invocation_id,
            "Failure delivered"
        );
        Ok(())
    }

    /// Acknowledge a cancellation request. No further report is legal.
    ///
    /// # Errors
    ///
    /// Returns an error if `details` cannot be serialized or the orchestrator
    /// rejects the report.
    pub async fn report_cancellation<V: Serialize + Sync>(&self, details: &V) -> GuardResult<()> {
        let details = payload(details)?;
        self.orchestrator
            .report_cancellation(&self.info.token, details)
            .await?;
        debug!(
            execution_id = %self.info.execution_id,
            invocation_id = %self.info.invocation_id,
            "Cancellation delivered"
        );
        Ok(())
    }

    /// Signal liveness and record `details` as the progress marker.
    ///
    /// # Errors
    ///
    /// Returns an error if `details` cannot be serialized or the orchestrator
    /// rejects the heartbeat.
    pub async fn heartbeat<V: Serialize + Sync>(&self, details: &V) -> GuardResult<HeartbeatAck> {
        let details = payload(details)?;
        Ok(self.orchestrator.heartbeat(&self.info.token, details).await?)
    }

    /// Deliver `result`: `Ok` through [`Self::complete`], `Err` through
    /// [`Self::complete_exceptionally`].
    ///
    /// Never fails. A rejected report is logged and `false` is returned; the
    /// side effect behind `result` has already happened either way.
    pub async fn handle<T, E>(&self, result: &Result<T, E>) -> bool
    where
        T: Serialize + Sync,
        E: std::fmt::Display + Sync,
    {
        let delivery = match result {
            Ok(value) => match self.complete(value).await {
                // A result the orchestrator cannot carry is still a failure to report.
                Err(GuardError::Orchestrator(OrchestratorError::Serialization { reason })) => {
                    self.complete_exceptionally(Failure::new("SerializationError", reason))
                        .await
                }
                other => other,
            },
            Err(err) => self.complete_exceptionally(Failure::from_error(err)).await,
        };

        match delivery {
            Ok(()) => true,
            Err(GuardError::Orchestrator(err)) if err.is_protocol_violation() => {
                warn!(
                    execution_id = %self.info.execution_id,
                    invocation_id = %self.info.invocation_id,
                    attempt = self.info.attempt,
                    error = %err,
                    "Completion rejected by orchestrator"
                );
                false
            }
            Err(err) => {
                error!(
                    execution_id = %self.info.execution_id,
                    invocation_id = %self.info.invocation_id,
                    error = %err,
                    "Failed to deliver completion"
                );
                false
            }
        }
    }
}

/// Complete a non-detached invocation with the value its body returned.
///
/// Does nothing if the body detached: the detached path owns completion.
/// Returns whether a completion was delivered.
pub async fn complete_on_return<T, E>(ctx: &InvocationContext, result: &Result<T, E>) -> bool
where
    T: Serialize + Sync,
    E: std::fmt::Display + Sync,
{
    if ctx.is_detached() {
        debug!(
            execution_id = %ctx.execution_id(),
            invocation_id = %ctx.invocation_id(),
            "Invocation detached, skipping completion on return"
        );
        return false;
    }

    CompletionClient::new(Arc::clone(ctx.orchestrator()), ctx.info().clone())
        .handle(result)
        .await
}
