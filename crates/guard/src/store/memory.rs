//! In-memory transactional store.
//!
//! Rows live in per-table ordered maps. Every insert or delete takes a
//! per-row lock held until the transaction ends, so two transactions racing
//! to insert the same id serialize: the second waits, then observes either
//! the committed row (unique violation) or a clean slate (winner rolled back).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use super::error::{StoreError, StoreResult};
use super::{Transaction, TransactionalStore};

type Tables = HashMap<String, BTreeMap<String, Value>>;
type RowKey = (String, String);

#[derive(Default)]
struct Shared {
    tables: RwLock<Tables>,
    row_locks: std::sync::Mutex<HashMap<RowKey, Arc<Mutex<()>>>>,
}

impl Shared {
    fn row_lock(&self, key: &RowKey) -> Arc<Mutex<()>> {
        let mut locks = self
            .row_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Forget row locks nobody holds or waits on.
    fn prune_row_locks(&self) {
        let mut locks = self
            .row_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

/// In-memory store for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed rows in a table.
    pub async fn table_len(&self, table: &str) -> usize {
        self.shared
            .tables
            .read()
            .await
            .get(table)
            .map_or(0, BTreeMap::len)
    }

    /// Committed rows of a table, ordered by id.
    pub async fn rows(&self, table: &str) -> Vec<(String, Value)> {
        self.shared
            .tables
            .read()
            .await
            .get(table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TransactionalStore for InMemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            state: Mutex::new(TxState::default()),
        }))
    }
}

#[derive(Debug, Clone)]
enum Write {
    Insert { table: String, id: String, row: Value },
    Delete { table: String, id: String },
}

impl Write {
    fn targets(&self, table: &str, id: &str) -> bool {
        match self {
            Self::Insert { table: t, id: i, .. } | Self::Delete { table: t, id: i } => {
                t == table && i == id
            }
        }
    }
}

struct TxState {
    open: bool,
    writes: Vec<Write>,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
}

impl Default for TxState {
    fn default() -> Self {
        Self {
            open: true,
            writes: Vec::new(),
            held: HashMap::new(),
        }
    }
}

impl TxState {
    const fn ensure_open(&self) -> StoreResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::TransactionClosed)
        }
    }

    /// Latest staged write for a row, if any: `Some(Some(row))` for an
    /// insert, `Some(None)` for a delete.
    fn staged(&self, table: &str, id: &str) -> Option<Option<Value>> {
        self.writes
            .iter()
            .rev()
            .find(|w| w.targets(table, id))
            .map(|w| match w {
                Write::Insert { row, .. } => Some(row.clone()),
                Write::Delete { .. } => None,
            })
    }
}

/// Transaction over an [`InMemoryStore`].
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    state: Mutex<TxState>,
}

impl MemoryTransaction {
    async fn lock_row(&self, state: &mut TxState, table: &str, id: &str) {
        let key = (table.to_string(), id.to_string());
        if state.held.contains_key(&key) {
            return;
        }
        let lock = self.shared.row_lock(&key);
        let guard = lock.lock_owned().await;
        state.held.insert(key, guard);
    }

    async fn visible(&self, state: &TxState, table: &str, id: &str) -> Option<Value> {
        match state.staged(table, id) {
            Some(staged) => staged,
            None => self
                .shared
                .tables
                .read()
                .await
                .get(table)
                .and_then(|rows| rows.get(id))
                .cloned(),
        }
    }

    fn close(&self, state: &mut TxState) {
        state.open = false;
        state.writes.clear();
        state.held.clear();
        self.shared.prune_row_locks();
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn insert(&self, table: &str, id: &str, row: Value) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        self.lock_row(&mut state, table, id).await;

        if self.visible(&state, table, id).await.is_some() {
            return Err(StoreError::unique_violation(table, id));
        }

        state.writes.push(Write::Insert {
            table: table.to_string(),
            id: id.to_string(),
            row,
        });
        Ok(())
    }

    async fn get(&self, table: &str, id: &str) -> StoreResult<Option<Value>> {
        let state = self.state.lock().await;
        state.ensure_open()?;
        Ok(self.visible(&state, table, id).await)
    }

    async fn scan(&self, table: &str) -> StoreResult<Vec<(String, Value)>> {
        let state = self.state.lock().await;
        state.ensure_open()?;

        let mut rows = self
            .shared
            .tables
            .read()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default();

        for write in &state.writes {
            match write {
                Write::Insert { table: t, id, row } if t == table => {
                    rows.insert(id.clone(), row.clone());
                }
                Write::Delete { table: t, id } if t == table => {
                    rows.remove(id);
                }
                _ => {}
            }
        }

        Ok(rows.into_iter().collect())
    }

    async fn delete(&self, table: &str, id: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        self.lock_row(&mut state, table, id).await;

        if self.visible(&state, table, id).await.is_none() {
            return Ok(false);
        }

        state.writes.push(Write::Delete {
            table: table.to_string(),
            id: id.to_string(),
        });
        Ok(true)
    }

    async fn commit(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let writes = std::mem::take(&mut state.writes);
        let applied = writes.len();
        {
            let mut tables = self.shared.tables.write().await;
            for write in writes {
                match write {
                    Write::Insert { table, id, row } => {
                        tables.entry(table).or_default().insert(id, row);
                    }
                    Write::Delete { table, id } => {
                        if let Some(rows) = tables.get_mut(&table) {
                            rows.remove(&id);
                        }
                    }
                }
            }
        }

        self.close(&mut state);
        debug!(writes = applied, "In-memory transaction committed");
        Ok(())
    }

    async fn rollback(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        let discarded = state.writes.len();
        self.close(&mut state);
        debug!(writes = discarded, "In-memory transaction rolled back");
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.open {
            state.open = false;
            state.writes.clear();
            state.held.clear();
            self.shared.prune_row_locks();
        }
    }
}
