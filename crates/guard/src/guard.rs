//! The idempotent-execution guard.
//!
//! [`IdempotencyGuard::run_once`] runs a unit of work at most once per
//! logical invocation. The ledger claim and the work's own writes share one
//! transaction, so they commit together or not at all: a failed attempt
//! leaves no claim behind and the next delivery starts clean.
//!
//! # Example
//!
//! ```ignore
//! let outcome = guard
//!     .run_once(&ctx, |tx| {
//!         Box::pin(async move {
//!             tx.insert("patients", "Alice", json!({"name": "Alice"})).await?;
//!             Ok::<_, GuardError>(())
//!         })
//!     })
//!     .await?;
//! ```

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::GuardError;
use crate::keys::KeyDerivation;
use crate::ledger::{ClaimOutcome, Ledger};
use crate::orchestrator::InvocationContext;
use crate::store::{Transaction, TransactionalStore};
use crate::types::IdempotencyKey;

/// Guard configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// How idempotency keys are derived.
    #[serde(default)]
    pub key_derivation: KeyDerivation,
}

impl GuardConfig {
    #[must_use]
    pub const fn with_key_derivation(mut self, key_derivation: KeyDerivation) -> Self {
        self.key_derivation = key_derivation;
        self
    }
}

/// What happened to the work passed to [`IdempotencyGuard::run_once`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome<T> {
    /// The key was fresh; the work ran and committed.
    Executed(T),
    /// The key was already claimed; the work did not run.
    Skipped,
}

impl<T> RunOutcome<T> {
    #[must_use]
    pub const fn is_executed(&self) -> bool {
        matches!(self, Self::Executed(_))
    }

    /// The work's result, if it ran.
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Executed(value) => Some(value),
            Self::Skipped => None,
        }
    }
}

/// Runs work at most once per idempotency key.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn TransactionalStore>,
    ledger: Ledger,
    config: GuardConfig,
}

impl std::fmt::Debug for IdempotencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyGuard")
            .field("ledger", &self.ledger)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn TransactionalStore>, ledger: Ledger, config: GuardConfig) -> Self {
        Self {
            store,
            ledger,
            config,
        }
    }

    #[must_use]
    pub const fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn TransactionalStore> {
        &self.store
    }

    #[must_use]
    pub const fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Run `work` unless this invocation's key was already claimed.
    ///
    /// Returns [`RunOutcome::Skipped`] when the key is taken.
    ///
    /// # Errors
    ///
    /// Returns the work's own error after rolling back, or a [`GuardError`]
    /// (converted into `E`) if key derivation or the store fails.
    pub async fn run_once<T, E, W>(&self, ctx: &InvocationContext, work: W) -> Result<RunOutcome<T>, E>
    where
        W: for<'t> FnOnce(&'t dyn Transaction) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send + 'static,
        E: From<GuardError> + Send + 'static,
    {
        self.run_once_or_else(
            ctx,
            move |tx| {
                let pending = work(tx);
                Box::pin(async move { pending.await.map(RunOutcome::Executed) })
            },
            |_| Box::pin(async { Ok(RunOutcome::Skipped) }),
        )
        .await
    }

    /// Run `work` on the first delivery of this invocation, `backup` on any
    /// later one.
    ///
    /// `backup` runs in its own transaction and is expected to rebuild the
    /// result without repeating the side effect.
    ///
    /// # Errors
    ///
    /// Returns the error of whichever closure ran, or a [`GuardError`]
    /// (converted into `E`) if key derivation or the store fails.
    pub async fn run_once_or_else<T, E, W, B>(
        &self,
        ctx: &InvocationContext,
        work: W,
        backup: B,
    ) -> Result<T, E>
    where
        W: for<'t> FnOnce(&'t dyn Transaction) -> BoxFuture<'t, Result<T, E>> + Send,
        B: for<'t> FnOnce(&'t dyn Transaction) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send + 'static,
        E: From<GuardError> + Send + 'static,
    {
        let key = self.config.key_derivation.derive(ctx).await?;
        let execution_id = ctx.execution_id();

        let tx = self.store.begin().await.map_err(GuardError::from)?;

        if self
            .ledger
            .exists(tx.as_ref(), &key)
            .await
            .map_err(GuardError::from)?
        {
            debug!(key = %key, execution_id = %execution_id, "Idempotency key found, running backup");
            return self.run_backup(tx, backup, &key).await;
        }

        debug!(key = %key, execution_id = %execution_id, "Idempotency key not found, claiming");

        let claim = self
            .ledger
            .claim(tx.as_ref(), &key, execution_id)
            .await
            .map_err(GuardError::from)?;

        if claim == ClaimOutcome::AlreadyClaimed {
            info!(key = %key, execution_id = %execution_id, "Lost claim race, running backup");
            tx.rollback().await.map_err(GuardError::from)?;
            let tx = self.store.begin().await.map_err(GuardError::from)?;
            return self.run_backup(tx, backup, &key).await;
        }

        let value = match work(tx.as_ref()).await {
            Ok(value) => value,
            Err(err) => {
                warn!(key = %key, execution_id = %execution_id, "Work failed, rolling back claim");
                if let Err(rollback) = tx.rollback().await {
                    error!(key = %key, error = %rollback, "Rollback failed");
                }
                return Err(err);
            }
        };

        match tx.commit().await {
            Ok(()) => {
                debug!(key = %key, execution_id = %execution_id, "Work committed with claim");
                Ok(value)
            }
            // Optimistic stores only see the duplicate claim at commit.
            Err(err) if err.is_unique_violation_on(self.ledger.table()) => {
                info!(key = %key, execution_id = %execution_id, "Claim conflict at commit, running backup");
                let tx = self.store.begin().await.map_err(GuardError::from)?;
                self.run_backup(tx, backup, &key).await
            }
            Err(err) => Err(GuardError::from(err).into()),
        }
    }

    async fn run_backup<T, E, B>(
        &self,
        tx: Box<dyn Transaction>,
        backup: B,
        key: &IdempotencyKey,
    ) -> Result<T, E>
    where
        B: for<'t> FnOnce(&'t dyn Transaction) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send + 'static,
        E: From<GuardError> + Send + 'static,
    {
        match backup(tx.as_ref()).await {
            Ok(value) => {
                tx.commit().await.map_err(GuardError::from)?;
                Ok(value)
            }
            Err(err) => {
                warn!(key = %key, "Backup failed, rolling back");
                if let Err(rollback) = tx.rollback().await {
                    error!(key = %key, error = %rollback, "Rollback failed");
                }
                Err(err)
            }
        }
    }
}
