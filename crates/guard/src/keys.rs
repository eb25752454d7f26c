//! Idempotency key derivation.
//!
//! A key must be stable across redeliveries of one logical invocation and
//! distinct across invocations. Two strategies are offered:
//!
//! - [`KeyDerivation::InvocationId`] trusts the orchestrator's invocation id
//!   to be stable, and scopes it by execution.
//! - [`KeyDerivation::ProgressMarker`] generates a random key on the first
//!   delivery and records it in the invocation's progress marker before any
//!   work runs; later deliveries read it back.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{GuardError, GuardResult};
use crate::orchestrator::InvocationContext;
use crate::types::IdempotencyKey;

/// Field of the progress marker holding the generated key.
pub const MARKER_KEY_FIELD: &str = "idempotency_key";

/// Strategy for deriving an invocation's idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyDerivation {
    /// `"{execution_id}/{invocation_id}"`.
    InvocationId,
    /// Random key remembered in the progress marker.
    #[default]
    ProgressMarker,
}

impl std::fmt::Display for KeyDerivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvocationId => write!(f, "invocation_id"),
            Self::ProgressMarker => write!(f, "progress_marker"),
        }
    }
}

impl std::str::FromStr for KeyDerivation {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "invocation_id" | "invocation-id" => Ok(Self::InvocationId),
            "progress_marker" | "progress-marker" => Ok(Self::ProgressMarker),
            other => Err(GuardError::key_derivation(format!(
                "unknown key derivation strategy '{other}'"
            ))),
        }
    }
}

impl KeyDerivation {
    /// Derive the key for the invocation behind `ctx`.
    ///
    /// With [`KeyDerivation::ProgressMarker`] this may heartbeat; a failed
    /// heartbeat is returned before any work has started.
    ///
    /// # Errors
    ///
    /// Returns an error if the invocation id is empty, the marker holds a
    /// malformed key, or the orchestrator call fails.
    pub async fn derive(self, ctx: &InvocationContext) -> GuardResult<IdempotencyKey> {
        match self {
            Self::InvocationId => from_invocation_id(ctx),
            Self::ProgressMarker => from_progress_marker(ctx).await,
        }
    }
}

fn from_invocation_id(ctx: &InvocationContext) -> GuardResult<IdempotencyKey> {
    if ctx.invocation_id().as_str().is_empty() {
        return Err(GuardError::key_derivation("invocation id is empty"));
    }
    Ok(IdempotencyKey::new(format!(
        "{}/{}",
        ctx.execution_id(),
        ctx.invocation_id()
    )))
}

async fn from_progress_marker(ctx: &InvocationContext) -> GuardResult<IdempotencyKey> {
    let marker: Option<Value> = ctx.progress_marker().await?;

    if let Some(recorded) = marker.as_ref().and_then(|m| m.get(MARKER_KEY_FIELD)) {
        let key = recorded
            .as_str()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| GuardError::key_derivation("progress marker holds a malformed key"))?;
        debug!(
            execution_id = %ctx.execution_id(),
            invocation_id = %ctx.invocation_id(),
            key,
            "Reusing idempotency key from progress marker"
        );
        return Ok(IdempotencyKey::new(key));
    }

    let key = IdempotencyKey::generate();

    // Keep whatever else the invocation recorded.
    let mut details = match marker {
        Some(Value::Object(fields)) => fields,
        _ => Map::new(),
    };
    details.insert(
        MARKER_KEY_FIELD.to_string(),
        Value::String(key.as_str().to_string()),
    );
    ctx.heartbeat(&Value::Object(details)).await?;

    debug!(
        execution_id = %ctx.execution_id(),
        invocation_id = %ctx.invocation_id(),
        key = %key,
        "Recorded fresh idempotency key"
    );
    Ok(key)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::indexing_slicing)]

    use super::*;
    use crate::orchestrator::{InMemoryOrchestrator, Orchestrator};
    use crate::types::{ExecutionId, InvocationId};
    use serde_json::json;
    use std::sync::Arc;

    async fn deliver(orch: &Arc<InMemoryOrchestrator>) -> InvocationContext {
        let orch: Arc<dyn Orchestrator> = Arc::clone(orch) as Arc<dyn Orchestrator>;
        InvocationContext::start(orch, &ExecutionId::new("wf"), &InvocationId::new("save"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_invocation_id_strategy_scopes_by_execution() {
        let orch = Arc::new(InMemoryOrchestrator::new());
        orch.start_execution(&ExecutionId::new("wf")).await.unwrap();
        let ctx = deliver(&orch).await;

        let key = KeyDerivation::InvocationId.derive(&ctx).await.unwrap();
        assert_eq!(key.as_str(), "wf/save");
    }

    #[tokio::test]
    async fn test_progress_marker_key_is_reused_on_redelivery() {
        let orch = Arc::new(InMemoryOrchestrator::new());
        orch.start_execution(&ExecutionId::new("wf")).await.unwrap();

        let first = deliver(&orch).await;
        let first_key = KeyDerivation::ProgressMarker.derive(&first).await.unwrap();

        let second = deliver(&orch).await;
        assert_eq!(second.attempt(), 2);
        let second_key = KeyDerivation::ProgressMarker.derive(&second).await.unwrap();

        assert_eq!(first_key, second_key);
    }

    #[tokio::test]
    async fn test_progress_marker_keeps_other_details() {
        let orch = Arc::new(InMemoryOrchestrator::new());
        orch.start_execution(&ExecutionId::new("wf")).await.unwrap();
        let ctx = deliver(&orch).await;
        ctx.heartbeat(&json!({"step": 3})).await.unwrap();

        let key = KeyDerivation::ProgressMarker.derive(&ctx).await.unwrap();
        let marker: Value = ctx.progress_marker().await.unwrap().unwrap();

        assert_eq!(marker["step"], json!(3));
        assert_eq!(marker[MARKER_KEY_FIELD], json!(key.as_str()));
    }

    #[tokio::test]
    async fn test_malformed_marker_is_rejected() {
        let orch = Arc::new(InMemoryOrchestrator::new());
        orch.start_execution(&ExecutionId::new("wf")).await.unwrap();
        let ctx = deliver(&orch).await;
        ctx.heartbeat(&json!({"idempotency_key": 7})).await.unwrap();

        let err = KeyDerivation::ProgressMarker.derive(&ctx).await.unwrap_err();
        assert!(matches!(err, GuardError::KeyDerivation { .. }));
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!(
            "invocation_id".parse::<KeyDerivation>().unwrap(),
            KeyDerivation::InvocationId
        );
        assert_eq!(
            "Progress-Marker".parse::<KeyDerivation>().unwrap(),
            KeyDerivation::ProgressMarker
        );
        assert!("uuid".parse::<KeyDerivation>().is_err());
        assert_eq!(KeyDerivation::default(), KeyDerivation::ProgressMarker);
    }
}
