//! Error types for the guard, the completion protocol and the collector.

use thiserror::Error;

use crate::orchestrator::OrchestratorError;
use crate::store::StoreError;

/// Errors raised by this crate itself, as opposed to failures of the
/// caller's work.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GuardError {
    /// The transactional store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The orchestrator failed or rejected a call.
    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    /// No idempotency key could be derived for the invocation.
    #[error("key derivation failed: {reason}")]
    KeyDerivation { reason: String },

    /// A timer interval of zero was configured.
    #[error("invalid interval: {reason}")]
    InvalidInterval { reason: String },

    /// A background task ended abnormally.
    #[error("background task failed: {reason}")]
    BackgroundTask { reason: String },
}

impl GuardError {
    /// Create a key derivation error.
    pub fn key_derivation(reason: impl Into<String>) -> Self {
        Self::KeyDerivation {
            reason: reason.into(),
        }
    }

    /// Create an invalid interval error.
    pub fn invalid_interval(reason: impl Into<String>) -> Self {
        Self::InvalidInterval {
            reason: reason.into(),
        }
    }

    /// Create a background task error.
    pub fn background_task(reason: impl Into<String>) -> Self {
        Self::BackgroundTask {
            reason: reason.into(),
        }
    }

    /// Check whether the failure is transient.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Store(err) => err.is_retryable(),
            Self::Orchestrator(OrchestratorError::Unavailable { .. }) => true,
            _ => false,
        }
    }
}

/// Result type for guard operations.
pub type GuardResult<T> = Result<T, GuardError>;
