//! Ledger garbage collection.
//!
//! Once an execution has terminated it can never redeliver, so the keys it
//! claimed are dead weight. [`LedgerCollector::sweep`] asks the orchestrator
//! which executions are still open and deletes every entry belonging to any
//! other. [`LedgerCollector::start`] runs the sweep on a fixed interval in a
//! background task owned by the returned [`CollectorHandle`].
//!
//! The ledger is read before the open set. An entry claimed after that read
//! is not a candidate, even if its execution started too late to appear in
//! the open set. An execution that closes after the open-set query keeps its
//! keys until the next sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::error::{GuardError, GuardResult};
use crate::ledger::Ledger;
use crate::orchestrator::Orchestrator;
use crate::store::TransactionalStore;

/// Default sweep interval (60 seconds).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for the periodic collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Time between sweeps.
    pub interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl CollectorConfig {
    /// Create a configuration with the given interval.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::InvalidInterval`] if `interval` is zero.
    pub fn new(interval: Duration) -> GuardResult<Self> {
        let config = Self { interval };
        config.validate()?;
        Ok(config)
    }

    /// Create a configuration from a whole number of seconds.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::InvalidInterval`] if `secs` is zero.
    pub fn from_secs(secs: u64) -> GuardResult<Self> {
        Self::new(Duration::from_secs(secs))
    }

    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::InvalidInterval`] if the interval is zero.
    pub fn validate(&self) -> GuardResult<()> {
        if self.interval.is_zero() {
            return Err(GuardError::invalid_interval(
                "sweep interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    /// Number of executions the orchestrator reported open.
    pub open_executions: usize,
    /// Number of ledger entries deleted.
    pub deleted: u64,
}

/// Reconciles the ledger against the orchestrator's open executions.
#[derive(Clone)]
pub struct LedgerCollector {
    store: Arc<dyn TransactionalStore>,
    ledger: Ledger,
    orchestrator: Arc<dyn Orchestrator>,
}

impl std::fmt::Debug for LedgerCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerCollector")
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl LedgerCollector {
    pub fn new(
        store: Arc<dyn TransactionalStore>,
        ledger: Ledger,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Self {
        Self {
            store,
            ledger,
            orchestrator,
        }
    }

    /// Run one sweep.
    ///
    /// An empty open set deletes every entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the open-set query, the delete or the commit
    /// fails. Nothing is deleted in that case.
    pub async fn sweep(&self) -> GuardResult<SweepReport> {
        let tx = self.store.begin().await?;
        let claimed = self.ledger.entries(tx.as_ref()).await?;
        let open = self.orchestrator.open_executions().await?;
        debug!(
            entries = claimed.len(),
            open_executions = open.len(),
            "Sweeping idempotency ledger"
        );

        let deleted = self
            .ledger
            .delete_closed(tx.as_ref(), claimed, &open)
            .await?;
        tx.commit().await?;

        Ok(SweepReport {
            open_executions: open.len(),
            deleted,
        })
    }

    /// Start sweeping every `config.interval` until the handle is shut down
    /// or dropped. The first sweep happens one interval after start.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::InvalidInterval`] if the interval is zero.
    pub fn start(self, config: CollectorConfig) -> GuardResult<CollectorHandle> {
        config.validate()?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let period = config.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // immediate

            info!(
                interval_secs = period.as_secs(),
                table = self.ledger.table(),
                "Ledger collector started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.sweep().await {
                            Ok(report) => {
                                info!(
                                    open_executions = report.open_executions,
                                    deleted = report.deleted,
                                    "Ledger sweep finished"
                                );
                            }
                            Err(e) => {
                                // Retried on the next tick.
                                error!(error = %e, "Ledger sweep failed");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Shutdown signal received, stopping ledger collector");
                        break;
                    }
                }
            }

            info!("Ledger collector stopped");
        });

        Ok(CollectorHandle {
            shutdown_tx,
            handle: Some(handle),
        })
    }
}

/// Owner of a running collector task.
///
/// Dropping the handle aborts the task.
#[derive(Debug)]
pub struct CollectorHandle {
    shutdown_tx: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl CollectorHandle {
    /// Whether the background task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop the collector, waiting at most `timeout` for an in-flight sweep.
    /// The task is aborted if it does not stop in time.
    ///
    /// # Errors
    ///
    /// Returns an error if the task panicked.
    pub async fn shutdown(mut self, timeout: Duration) -> GuardResult<()> {
        if let Err(e) = self.shutdown_tx.send(()).await {
            warn!(error = %e, "Failed to send shutdown signal, channel closed");
        }

        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(error = %e, "Ledger collector task panicked");
                Err(GuardError::background_task(e.to_string()))
            }
            Err(_) => {
                warn!("Ledger collector shutdown timed out, aborting task");
                handle.abort();
                Ok(())
            }
        }
    }
}

impl Drop for CollectorHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
