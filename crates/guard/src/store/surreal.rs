//! SurrealDB-backed transactional store.
//!
//! The SurrealDB client has no interactive transactions, so a
//! [`SurrealTransaction`] buffers its writes and sends them as one
//! `BEGIN TRANSACTION; ... COMMIT TRANSACTION;` batch on commit. Inserts use
//! `CREATE`, which fails on an existing record id and aborts the whole batch:
//! a concurrent duplicate therefore surfaces as a unique violation from
//! [`Transaction::commit`] with none of the batch applied.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use surrealdb::Surreal;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::error::{StoreError, StoreResult, from_surrealdb_error};
use super::{Transaction, TransactionalStore};

/// Configuration for the SurrealDB store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection URL (e.g., "mem://", "rocksdb://data/db", "ws://localhost:8000")
    pub url: String,
    /// Namespace to use
    pub namespace: String,
    /// Database to use
    pub database: String,
    /// Optional root credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

/// Root credentials for authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

impl StoreConfig {
    /// Create an in-memory configuration for testing.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            url: "mem://".to_string(),
            namespace: "runonce".to_string(),
            database: "test".to_string(),
            credentials: None,
        }
    }

    /// Set the connection URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set credentials for authentication.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Set the namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Row layout on disk: the caller's id and the JSON document as text.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRow {
    row_id: String,
    body: String,
}

impl StoredRow {
    fn decode(self) -> StoreResult<(String, Value)> {
        let value = serde_json::from_str(&self.body)?;
        Ok((self.row_id, value))
    }
}

/// Connection to SurrealDB.
#[derive(Debug, Clone)]
pub struct SurrealStore {
    db: Arc<Surreal<Any>>,
    config: StoreConfig,
}

impl SurrealStore {
    /// Connect to the database with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or authentication fails.
    pub async fn connect(config: StoreConfig) -> StoreResult<Self> {
        let db = Surreal::<Any>::init();

        db.connect(&config.url)
            .await
            .map_err(|e| StoreError::connection_failed(e.to_string()))?;

        if let Some(creds) = &config.credentials {
            db.signin(Root {
                username: &creds.username,
                password: &creds.password,
            })
            .await
            .map_err(|e| StoreError::connection_failed(e.to_string()))?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| from_surrealdb_error(e, &[]))?;

        info!(url = %config.url, namespace = %config.namespace, database = %config.database, "Connected to SurrealDB");

        Ok(Self {
            db: Arc::new(db),
            config,
        })
    }

    /// Get the store configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Check if the database is healthy.
    ///
    /// # Errors
    ///
    /// Returns an error if the health check fails.
    pub async fn health_check(&self) -> StoreResult<()> {
        self.db
            .query("INFO FOR DB")
            .await
            .map_err(|e| from_surrealdb_error(e, &[]))?;
        Ok(())
    }

    async fn select_row(&self, table: &str, id: &str) -> StoreResult<Option<Value>> {
        let rows: Vec<StoredRow> = self
            .db
            .query("SELECT row_id, body FROM type::thing($table, $id)")
            .bind(("table", table.to_string()))
            .bind(("id", id.to_string()))
            .await
            .map_err(|e| from_surrealdb_error(e, &[table]))?
            .take(0)
            .map_err(|e| from_surrealdb_error(e, &[table]))?;

        rows.into_iter()
            .next()
            .map(StoredRow::decode)
            .transpose()
            .map(|row| row.map(|(_, value)| value))
    }

    async fn select_table(&self, table: &str) -> StoreResult<BTreeMap<String, Value>> {
        let rows: Vec<StoredRow> = self
            .db
            .query("SELECT row_id, body FROM type::table($table)")
            .bind(("table", table.to_string()))
            .await
            .map_err(|e| from_surrealdb_error(e, &[table]))?
            .take(0)
            .map_err(|e| from_surrealdb_error(e, &[table]))?;

        rows.into_iter().map(StoredRow::decode).collect()
    }
}

#[async_trait]
impl TransactionalStore for SurrealStore {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        Ok(Box::new(SurrealTransaction {
            store: self.clone(),
            state: Mutex::new(Buffer::default()),
        }))
    }
}

#[derive(Debug, Clone)]
enum Op {
    Create { table: String, id: String, body: String },
    Delete { table: String, id: String },
}

impl Op {
    fn targets(&self, table: &str, id: &str) -> bool {
        match self {
            Self::Create { table: t, id: i, .. } | Self::Delete { table: t, id: i } => {
                t == table && i == id
            }
        }
    }

    fn table(&self) -> &str {
        match self {
            Self::Create { table, .. } | Self::Delete { table, .. } => table,
        }
    }
}

struct Buffer {
    open: bool,
    ops: Vec<Op>,
}

impl Default for Buffer {
    fn default() -> Self {
        Self {
            open: true,
            ops: Vec::new(),
        }
    }
}

impl Buffer {
    const fn ensure_open(&self) -> StoreResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::TransactionClosed)
        }
    }

    fn staged(&self, table: &str, id: &str) -> StoreResult<Option<Option<Value>>> {
        self.ops
            .iter()
            .rev()
            .find(|op| op.targets(table, id))
            .map(|op| match op {
                Op::Create { body, .. } => serde_json::from_str(body).map(Some),
                Op::Delete { .. } => Ok(None),
            })
            .transpose()
            .map_err(StoreError::from)
    }
}

/// Buffered transaction over a [`SurrealStore`].
pub struct SurrealTransaction {
    store: SurrealStore,
    state: Mutex<Buffer>,
}

impl SurrealTransaction {
    async fn visible(&self, buffer: &Buffer, table: &str, id: &str) -> StoreResult<Option<Value>> {
        match buffer.staged(table, id)? {
            Some(staged) => Ok(staged),
            None => self.store.select_row(table, id).await,
        }
    }
}

impl SurrealTransaction {
    /// An aborted batch may only report that it was not executed. If one of
    /// its created records now exists, someone else committed it first.
    async fn probe_conflict(&self, ops: &[Op]) -> Option<StoreError> {
        for op in ops {
            if let Op::Create { table, id, .. } = op {
                if let Ok(Some(_)) = self.store.select_row(table, id).await {
                    return Some(StoreError::unique_violation(table.as_str(), id.as_str()));
                }
            }
        }
        None
    }
}

/// Render buffered operations as one transactional statement batch plus
/// its bind variables.
fn render_batch(ops: &[Op]) -> (String, BTreeMap<String, String>) {
    let mut sql = String::from("BEGIN TRANSACTION;\n");
    let mut vars = BTreeMap::new();

    for (n, op) in ops.iter().enumerate() {
        match op {
            Op::Create { table, id, body } => {
                sql.push_str(&format!(
                    "CREATE type::thing($t{n}, $i{n}) CONTENT {{ row_id: $i{n}, body: $b{n} }};\n"
                ));
                vars.insert(format!("t{n}"), table.clone());
                vars.insert(format!("i{n}"), id.clone());
                vars.insert(format!("b{n}"), body.clone());
            }
            Op::Delete { table, id } => {
                sql.push_str(&format!("DELETE type::thing($t{n}, $i{n});\n"));
                vars.insert(format!("t{n}"), table.clone());
                vars.insert(format!("i{n}"), id.clone());
            }
        }
    }

    sql.push_str("COMMIT TRANSACTION;");
    (sql, vars)
}

#[async_trait]
impl Transaction for SurrealTransaction {
    async fn insert(&self, table: &str, id: &str, row: Value) -> StoreResult<()> {
        let mut buffer = self.state.lock().await;
        buffer.ensure_open()?;

        // Early detection only; the authoritative check is CREATE at commit.
        if self.visible(&buffer, table, id).await?.is_some() {
            return Err(StoreError::unique_violation(table, id));
        }

        buffer.ops.push(Op::Create {
            table: table.to_string(),
            id: id.to_string(),
            body: serde_json::to_string(&row)?,
        });
        Ok(())
    }

    async fn get(&self, table: &str, id: &str) -> StoreResult<Option<Value>> {
        let buffer = self.state.lock().await;
        buffer.ensure_open()?;
        self.visible(&buffer, table, id).await
    }

    async fn scan(&self, table: &str) -> StoreResult<Vec<(String, Value)>> {
        let buffer = self.state.lock().await;
        buffer.ensure_open()?;

        let mut rows = self.store.select_table(table).await?;
        for op in buffer.ops.iter().filter(|op| op.table() == table) {
            match op {
                Op::Create { id, body, .. } => {
                    rows.insert(id.clone(), serde_json::from_str(body)?);
                }
                Op::Delete { id, .. } => {
                    rows.remove(id);
                }
            }
        }
        Ok(rows.into_iter().collect())
    }

    async fn delete(&self, table: &str, id: &str) -> StoreResult<bool> {
        let mut buffer = self.state.lock().await;
        buffer.ensure_open()?;

        if self.visible(&buffer, table, id).await?.is_none() {
            return Ok(false);
        }

        buffer.ops.push(Op::Delete {
            table: table.to_string(),
            id: id.to_string(),
        });
        Ok(true)
    }

    async fn commit(&self) -> StoreResult<()> {
        let mut buffer = self.state.lock().await;
        buffer.ensure_open()?;
        buffer.open = false;

        let ops = std::mem::take(&mut buffer.ops);
        if ops.is_empty() {
            return Ok(());
        }

        let tables: BTreeSet<&str> = ops.iter().map(Op::table).collect();
        let tables: Vec<&str> = tables.into_iter().collect();
        let (sql, vars) = render_batch(&ops);

        let mut response = self
            .store
            .db
            .query(sql)
            .bind(vars)
            .await
            .map_err(|e| from_surrealdb_error(e, &tables))?;

        let errors: Vec<StoreError> = response
            .take_errors()
            .into_iter()
            .sorted_by_key(|(index, _)| *index)
            .map(|(_, e)| from_surrealdb_error(e, &tables))
            .collect();

        if let Some(first) = errors.first() {
            let failure = match errors
                .iter()
                .find(|e| matches!(e, StoreError::UniqueViolation { .. }))
            {
                Some(violation) => violation.clone(),
                None => self.probe_conflict(&ops).await.unwrap_or_else(|| first.clone()),
            };
            debug!(error = %failure, "SurrealDB transaction aborted");
            return Err(failure);
        }

        debug!(statements = ops.len(), "SurrealDB transaction committed");
        Ok(())
    }

    async fn rollback(&self) -> StoreResult<()> {
        let mut buffer = self.state.lock().await;
        buffer.ensure_open()?;
        buffer.open = false;
        buffer.ops.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_in_memory() {
        let config = StoreConfig::in_memory();
        assert_eq!(config.url, "mem://");
        assert_eq!(config.namespace, "runonce");
        assert_eq!(config.database, "test");
        assert!(config.credentials.is_none());
    }

    #[test]
    fn test_store_config_builders() {
        let config = StoreConfig::default()
            .with_url("ws://localhost:8000")
            .with_namespace("ns")
            .with_database("db")
            .with_credentials("root", "root");
        assert_eq!(config.url, "ws://localhost:8000");
        assert_eq!(config.namespace, "ns");
        assert_eq!(config.database, "db");
        assert!(config.credentials.is_some());
    }

    #[test]
    fn test_render_batch_wraps_ops_in_transaction() {
        let ops = vec![
            Op::Create {
                table: "idempotency_keys".to_string(),
                id: "k".to_string(),
                body: "{}".to_string(),
            },
            Op::Delete {
                table: "patients".to_string(),
                id: "Alice".to_string(),
            },
        ];
        let (sql, vars) = render_batch(&ops);

        assert!(sql.starts_with("BEGIN TRANSACTION;"));
        assert!(sql.ends_with("COMMIT TRANSACTION;"));
        assert!(sql.contains("CREATE type::thing($t0, $i0)"));
        assert!(sql.contains("DELETE type::thing($t1, $i1)"));
        assert_eq!(vars.get("t0").map(String::as_str), Some("idempotency_keys"));
        assert_eq!(vars.get("i1").map(String::as_str), Some("Alice"));
        assert!(!vars.contains_key("b1"));
    }
}
