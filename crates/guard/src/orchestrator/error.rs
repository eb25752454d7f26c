//! Errors reported by the orchestrator collaborator.

use thiserror::Error;

/// Errors that can occur when talking to the orchestrator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    /// No execution with this id is known.
    #[error("execution '{execution_id}' not found")]
    ExecutionNotFound { execution_id: String },

    /// An execution with this id is already running.
    #[error("execution '{execution_id}' is already running")]
    ExecutionAlreadyStarted { execution_id: String },

    /// The execution has terminated; nothing more may be reported against it.
    #[error("execution '{execution_id}' is closed")]
    ExecutionClosed { execution_id: String },

    /// No invocation with this id exists in the execution.
    #[error("invocation '{invocation_id}' not found in execution '{execution_id}'")]
    InvocationNotFound {
        execution_id: String,
        invocation_id: String,
    },

    /// The invocation already has an outcome and will not be redelivered.
    #[error("invocation '{invocation_id}' already completed")]
    InvocationCompleted { invocation_id: String },

    /// The token was already consumed by a completion call.
    #[error("completion token for invocation '{invocation_id}' was already used")]
    TokenAlreadyUsed { invocation_id: String },

    /// The token belongs to an attempt that has since been redelivered.
    #[error("stale completion token: attempt {presented}, current attempt {current}")]
    StaleToken { presented: u32, current: u32 },

    /// The token could not be decoded.
    #[error("invalid completion token: {reason}")]
    InvalidToken { reason: String },

    /// Payload serialization failed.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// The orchestrator could not be reached.
    #[error("orchestrator unavailable: {reason}")]
    Unavailable { reason: String },
}

impl OrchestratorError {
    /// Create an execution not found error.
    pub fn execution_not_found(execution_id: impl Into<String>) -> Self {
        Self::ExecutionNotFound {
            execution_id: execution_id.into(),
        }
    }

    /// Create an execution closed error.
    pub fn execution_closed(execution_id: impl Into<String>) -> Self {
        Self::ExecutionClosed {
            execution_id: execution_id.into(),
        }
    }

    /// Create an invocation not found error.
    pub fn invocation_not_found(
        execution_id: impl Into<String>,
        invocation_id: impl Into<String>,
    ) -> Self {
        Self::InvocationNotFound {
            execution_id: execution_id.into(),
            invocation_id: invocation_id.into(),
        }
    }

    /// Create an invalid token error.
    pub fn invalid_token(reason: impl Into<String>) -> Self {
        Self::InvalidToken {
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Check whether this error means the completion protocol was violated
    /// (double completion, superseded attempt, terminated execution).
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::TokenAlreadyUsed { .. }
                | Self::StaleToken { .. }
                | Self::ExecutionClosed { .. }
                | Self::InvalidToken { .. }
        )
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

/// Result type for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_violations() {
        assert!(
            OrchestratorError::TokenAlreadyUsed {
                invocation_id: "a".to_string()
            }
            .is_protocol_violation()
        );
        assert!(OrchestratorError::StaleToken { presented: 1, current: 2 }.is_protocol_violation());
        assert!(OrchestratorError::execution_closed("wf").is_protocol_violation());
        assert!(!OrchestratorError::execution_not_found("wf").is_protocol_violation());
    }

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::invocation_not_found("wf-1", "save");
        assert!(err.to_string().contains("wf-1"));
        assert!(err.to_string().contains("save"));
    }
}
