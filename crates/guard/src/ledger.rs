//! The idempotency ledger: which keys have been claimed, and by which
//! execution.
//!
//! Every operation runs against a caller-supplied [`Transaction`] so that a
//! claim commits or rolls back together with the caller's business writes.
//! A key is inserted at most once and never updated; only the collector
//! (or execution cleanup) deletes it.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use crate::store::{StoreError, StoreResult, Transaction};
use crate::types::{ExecutionId, IdempotencyKey};

/// Default ledger table name.
pub const LEDGER_TABLE: &str = "idempotency_keys";

/// One claimed key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// The claimed key.
    pub idempotency_key: IdempotencyKey,
    /// The execution that claimed it.
    pub execution_id: ExecutionId,
    /// When the claim was made.
    pub claimed_at: DateTime<Utc>,
}

/// Result of attempting to claim a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The key was free and is now held by this transaction.
    Claimed,
    /// The key was already claimed by a committed transaction.
    AlreadyClaimed,
}

/// Ledger operations over one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    table: String,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(LEDGER_TABLE)
    }
}

impl Ledger {
    /// Create a ledger over the given table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    /// The table this ledger writes to.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Check whether a key has been claimed.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn exists(&self, tx: &dyn Transaction, key: &IdempotencyKey) -> StoreResult<bool> {
        Ok(tx.get(&self.table, key.as_str()).await?.is_some())
    }

    /// Claim a key for an execution.
    ///
    /// A uniqueness violation is reported as [`ClaimOutcome::AlreadyClaimed`],
    /// not as an error.
    ///
    /// # Errors
    ///
    /// Returns an error for any store failure other than a uniqueness violation.
    pub async fn claim(
        &self,
        tx: &dyn Transaction,
        key: &IdempotencyKey,
        execution_id: &ExecutionId,
    ) -> StoreResult<ClaimOutcome> {
        let entry = LedgerEntry {
            idempotency_key: key.clone(),
            execution_id: execution_id.clone(),
            claimed_at: Utc::now(),
        };
        let row = serde_json::to_value(&entry)?;

        match tx.insert(&self.table, key.as_str(), row).await {
            Ok(()) => Ok(ClaimOutcome::Claimed),
            Err(err) if err.is_unique_violation_on(&self.table) => {
                debug!(key = %key, "Idempotency key already claimed");
                Ok(ClaimOutcome::AlreadyClaimed)
            }
            Err(err) => Err(err),
        }
    }

    /// List every ledger entry visible to the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails or a row cannot be decoded.
    pub async fn entries(&self, tx: &dyn Transaction) -> StoreResult<Vec<LedgerEntry>> {
        tx.scan(&self.table)
            .await?
            .into_iter()
            .map(|(_, row)| serde_json::from_value(row).map_err(StoreError::from))
            .collect()
    }

    /// Delete every entry whose execution is not in `open`.
    ///
    /// An empty `open` set deletes every entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan or any delete fails.
    pub async fn delete_where_execution_not_in(
        &self,
        tx: &dyn Transaction,
        open: &[ExecutionId],
    ) -> StoreResult<u64> {
        let entries = self.entries(tx).await?;
        self.delete_closed(tx, entries, open).await
    }

    /// Delete those of `entries` whose execution is not in `open`.
    ///
    /// Rows claimed after `entries` was read are left alone, so a caller
    /// that reads the entries before the open set never deletes a key of an
    /// execution that started in between.
    ///
    /// # Errors
    ///
    /// Returns an error if any delete fails.
    pub async fn delete_closed(
        &self,
        tx: &dyn Transaction,
        entries: Vec<LedgerEntry>,
        open: &[ExecutionId],
    ) -> StoreResult<u64> {
        let open: HashSet<&ExecutionId> = open.iter().collect();
        let stale = entries
            .into_iter()
            .filter(|entry| !open.contains(&entry.execution_id))
            .collect_vec();

        self.delete_entries(tx, &stale).await
    }

    /// Delete every entry held by one execution.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan or any delete fails.
    pub async fn delete_for_execution(
        &self,
        tx: &dyn Transaction,
        execution_id: &ExecutionId,
    ) -> StoreResult<u64> {
        let owned = self
            .entries(tx)
            .await?
            .into_iter()
            .filter(|entry| &entry.execution_id == execution_id)
            .collect_vec();

        self.delete_entries(tx, &owned).await
    }

    async fn delete_entries(&self, tx: &dyn Transaction, entries: &[LedgerEntry]) -> StoreResult<u64> {
        let mut deleted: u64 = 0;
        for entry in entries {
            if tx.delete(&self.table, entry.idempotency_key.as_str()).await? {
                deleted = deleted.saturating_add(1);
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::store::{InMemoryStore, TransactionalStore};

    async fn seed(store: &InMemoryStore, ledger: &Ledger, rows: &[(&str, &str)]) {
        let tx = store.begin().await.unwrap();
        for (key, exec) in rows {
            ledger
                .claim(tx.as_ref(), &IdempotencyKey::new(*key), &ExecutionId::new(*exec))
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_claim_then_exists() {
        let store = InMemoryStore::new();
        let ledger = Ledger::default();
        let key = IdempotencyKey::new("attempt-1");

        let tx = store.begin().await.unwrap();
        assert!(!ledger.exists(tx.as_ref(), &key).await.unwrap());
        let outcome = ledger
            .claim(tx.as_ref(), &key, &ExecutionId::new("wf-1"))
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::Claimed);
        assert!(ledger.exists(tx.as_ref(), &key).await.unwrap());
        tx.commit().await.unwrap();

        assert_eq!(store.table_len(LEDGER_TABLE).await, 1);
    }

    #[tokio::test]
    async fn test_second_claim_is_already_claimed() {
        let store = InMemoryStore::new();
        let ledger = Ledger::default();
        seed(&store, &ledger, &[("k", "wf-1")]).await;

        let tx = store.begin().await.unwrap();
        let outcome = ledger
            .claim(tx.as_ref(), &IdempotencyKey::new("k"), &ExecutionId::new("wf-2"))
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::AlreadyClaimed);
    }

    #[tokio::test]
    async fn test_claim_is_undone_by_rollback() {
        let store = InMemoryStore::new();
        let ledger = Ledger::default();
        let key = IdempotencyKey::new("k");

        let tx = store.begin().await.unwrap();
        ledger
            .claim(tx.as_ref(), &key, &ExecutionId::new("wf-1"))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let tx = store.begin().await.unwrap();
        assert!(!ledger.exists(tx.as_ref(), &key).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_where_execution_not_in_keeps_open() {
        let store = InMemoryStore::new();
        let ledger = Ledger::default();
        seed(&store, &ledger, &[("a1", "A"), ("a2", "A"), ("b1", "B"), ("c1", "C")]).await;

        let tx = store.begin().await.unwrap();
        let deleted = ledger
            .delete_where_execution_not_in(tx.as_ref(), &[ExecutionId::new("A")])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(deleted, 2);
        let remaining: Vec<String> = store
            .rows(LEDGER_TABLE)
            .await
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(remaining, vec!["a1".to_string(), "a2".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_open_set_deletes_everything() {
        let store = InMemoryStore::new();
        let ledger = Ledger::default();
        seed(&store, &ledger, &[("a1", "A"), ("b1", "B")]).await;

        let tx = store.begin().await.unwrap();
        let deleted = ledger
            .delete_where_execution_not_in(tx.as_ref(), &[])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(deleted, 2);
        assert_eq!(store.table_len(LEDGER_TABLE).await, 0);
    }

    #[tokio::test]
    async fn test_delete_for_execution() {
        let store = InMemoryStore::new();
        let ledger = Ledger::default();
        seed(&store, &ledger, &[("a1", "A"), ("b1", "B"), ("b2", "B")]).await;

        let tx = store.begin().await.unwrap();
        let deleted = ledger
            .delete_for_execution(tx.as_ref(), &ExecutionId::new("B"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(deleted, 2);
        assert_eq!(store.table_len(LEDGER_TABLE).await, 1);
    }
}
