//! Transactional storage for the ledger and for business writes.
//!
//! The guard composes its ledger claim with arbitrary caller writes, so both
//! go through the same [`Transaction`]. Two backends are provided:
//!
//! - [`InMemoryStore`]: pessimistic row locks, the loser of an insert race
//!   waits for the winner the way a unique index does.
//! - [`SurrealStore`]: SurrealDB-backed, buffers writes and commits them in a
//!   single `BEGIN ... COMMIT` batch; duplicates surface at commit.
//!
//! # Example
//!
//! ```ignore
//! use runonce_guard::store::{InMemoryStore, TransactionalStore};
//! use serde_json::json;
//!
//! let store = InMemoryStore::new();
//! let tx = store.begin().await?;
//! tx.insert("patients", "Alice", json!({"name": "Alice"})).await?;
//! tx.commit().await?;
//! ```

pub mod error;
pub mod memory;
pub mod surreal;

use async_trait::async_trait;
use serde_json::Value;

pub use error::{StoreError, StoreResult, from_surrealdb_error};
pub use memory::InMemoryStore;
pub use surreal::{StoreConfig, SurrealStore};

/// A store that can open scoped transactions.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    /// Open a new transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot start a transaction.
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>>;
}

/// One open transaction.
///
/// Writes are invisible to other transactions until [`Transaction::commit`].
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Insert a new row.
    ///
    /// Fails with [`StoreError::UniqueViolation`] if `id` already exists in
    /// `table`. Depending on the backend the violation may instead surface
    /// from [`Transaction::commit`].
    async fn insert(&self, table: &str, id: &str, row: Value) -> StoreResult<()>;

    /// Read a row by id.
    async fn get(&self, table: &str, id: &str) -> StoreResult<Option<Value>>;

    /// Read every row of a table as `(id, row)` pairs.
    async fn scan(&self, table: &str) -> StoreResult<Vec<(String, Value)>>;

    /// Delete a row, returning whether it existed.
    async fn delete(&self, table: &str, id: &str) -> StoreResult<bool>;

    /// Atomically apply every write made in this transaction.
    async fn commit(&self) -> StoreResult<()>;

    /// Discard every write made in this transaction.
    async fn rollback(&self) -> StoreResult<()>;
}
