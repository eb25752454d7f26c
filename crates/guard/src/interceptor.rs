//! Cross-cutting policies applied at call sites.
//!
//! [`AsyncCompletion`] performs the detach/complete handshake around an
//! operation that hands back a deferred result, and [`ExecutionCleanup`]
//! releases an execution's ledger keys once its body has returned.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::GuardResult;
use crate::ledger::Ledger;
use crate::orchestrator::InvocationContext;
use crate::store::TransactionalStore;
use crate::types::ExecutionId;

/// What an operation handed back to the interceptor.
pub enum Returned<T, E> {
    /// A result that will resolve later.
    Deferred(BoxFuture<'static, Result<T, E>>),
    /// A result that is already available.
    Ready(Result<T, E>),
}

impl<T, E> Returned<T, E> {
    /// Wrap a future as a deferred result.
    pub fn deferred<F>(pending: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::Deferred(Box::pin(pending))
    }

    pub const fn ready(result: Result<T, E>) -> Self {
        Self::Ready(result)
    }
}

impl<T, E> std::fmt::Debug for Returned<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deferred(_) => write!(f, "Returned::Deferred(..)"),
            Self::Ready(_) => write!(f, "Returned::Ready(..)"),
        }
    }
}

/// Result of [`AsyncCompletion::around`].
#[derive(Debug)]
pub enum Intercepted<T, E> {
    /// The invocation was detached. The task resolves to whether the
    /// completion was accepted.
    Detached(JoinHandle<bool>),
    /// The operation returned synchronously and was not detached.
    Returned(Result<T, E>),
}

/// Detach-and-complete policy for deferred operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsyncCompletion;

impl AsyncCompletion {
    /// Call `op` and, if it returns a deferred result, detach the invocation
    /// and complete it from a background task once the result resolves.
    ///
    /// A ready result is passed back untouched with a warning; the caller
    /// completes it on return as usual. Must be called within a tokio runtime.
    pub fn around<T, E, F>(ctx: &InvocationContext, operation: &str, op: F) -> Intercepted<T, E>
    where
        F: FnOnce() -> Returned<T, E>,
        T: Serialize + Send + Sync + 'static,
        E: std::fmt::Display + Send + Sync + 'static,
    {
        match op() {
            Returned::Deferred(pending) => {
                let client = ctx.detach();
                debug!(
                    operation,
                    execution_id = %ctx.execution_id(),
                    invocation_id = %ctx.invocation_id(),
                    "Deferred result, completing asynchronously"
                );
                Intercepted::Detached(tokio::spawn(async move {
                    let result = pending.await;
                    client.handle(&result).await
                }))
            }
            Returned::Ready(result) => {
                warn!(
                    operation,
                    execution_id = %ctx.execution_id(),
                    "Operation marked asynchronous returned a ready result; not detaching"
                );
                Intercepted::Returned(result)
            }
        }
    }
}

/// Releases an execution's ledger keys after its body returns.
#[derive(Clone)]
pub struct ExecutionCleanup {
    store: Arc<dyn TransactionalStore>,
    ledger: Ledger,
}

impl std::fmt::Debug for ExecutionCleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCleanup")
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl ExecutionCleanup {
    pub fn new(store: Arc<dyn TransactionalStore>, ledger: Ledger) -> Self {
        Self { store, ledger }
    }

    /// Delete every ledger entry held by `execution_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails; nothing is deleted in that case.
    pub async fn release(&self, execution_id: &ExecutionId) -> GuardResult<u64> {
        let tx = self.store.begin().await?;
        let deleted = self
            .ledger
            .delete_for_execution(tx.as_ref(), execution_id)
            .await?;
        tx.commit().await?;
        Ok(deleted)
    }

    /// Hand back `returned` after releasing the execution's keys.
    ///
    /// A failed release is logged and otherwise ignored; the periodic
    /// collector will get to those keys.
    pub async fn after<R>(&self, execution_id: &ExecutionId, returned: R) -> R {
        match self.release(execution_id).await {
            Ok(deleted) => {
                info!(execution_id = %execution_id, deleted, "Released idempotency keys");
            }
            Err(err) => {
                warn!(
                    execution_id = %execution_id,
                    error = %err,
                    "Failed to release idempotency keys"
                );
            }
        }
        returned
    }

    /// Await `body`, then release the execution's keys.
    pub async fn around<F>(&self, execution_id: &ExecutionId, body: F) -> F::Output
    where
        F: Future + Send,
        F::Output: Send,
    {
        let returned = body.await;
        self.after(execution_id, returned).await
    }
}
