//! Store error types.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use std::fmt;

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A row with the same id already exists in the table.
    #[error("unique violation: {table} with id '{id}' already exists")]
    UniqueViolation { table: String, id: String },

    /// Failed to connect to the database
    #[error("connection failed: {reason}")]
    ConnectionFailed { reason: String },

    /// Query execution failed
    #[error("query failed: {reason}")]
    QueryFailed { reason: String },

    /// Serialization/deserialization error
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// The transaction was already committed or rolled back.
    #[error("transaction already closed")]
    TransactionClosed,
}

impl StoreError {
    /// Create a unique violation error.
    pub fn unique_violation(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self::UniqueViolation {
            table: table.into(),
            id: id.into(),
        }
    }

    /// Create a connection failed error.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            reason: reason.into(),
        }
    }

    /// Create a query failed error.
    pub fn query_failed(reason: impl Into<String>) -> Self {
        Self::QueryFailed {
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Check if this is a uniqueness violation on the given table.
    #[must_use]
    pub fn is_unique_violation_on(&self, expected: &str) -> bool {
        matches!(self, Self::UniqueViolation { table, .. } if table == expected)
    }

    /// Check if error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionFailed { .. } | Self::QueryFailed { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Convert a SurrealDB error to a `StoreError`.
///
/// SurrealDB reports duplicate record ids as "Database record `table:id`
/// already exists"; `tables` lists the candidate tables so the violation can
/// be attributed.
pub fn from_surrealdb_error(err: impl fmt::Display, tables: &[&str]) -> StoreError {
    let msg = err.to_string();

    if msg.contains("already exists") {
        let table = tables
            .iter()
            .find(|t| msg.contains(&format!("`{t}:")))
            .map_or("unknown", |t| t);
        StoreError::unique_violation(table, msg)
    } else if msg.contains("connection") || msg.contains("Connection") || msg.contains("connect") {
        StoreError::connection_failed(msg)
    } else {
        StoreError::query_failed(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_record_is_classified_by_table() {
        let err = from_surrealdb_error(
            "Database record `idempotency_keys:⟨abc⟩` already exists",
            &["patients", "idempotency_keys"],
        );
        assert!(err.is_unique_violation_on("idempotency_keys"));
        assert!(!err.is_unique_violation_on("patients"));
    }

    #[test]
    fn test_connection_errors_are_retryable() {
        let err = from_surrealdb_error("connection refused", &[]);
        assert!(matches!(err, StoreError::ConnectionFailed { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unique_violation_is_not_retryable() {
        assert!(!StoreError::unique_violation("t", "1").is_retryable());
        assert!(!StoreError::TransactionClosed.is_retryable());
    }
}
