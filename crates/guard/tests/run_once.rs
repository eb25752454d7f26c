//! End-to-end behavior of the guard under redelivery and races.

#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use runonce_guard::{
    ExecutionId, GuardConfig, GuardError, IdempotencyGuard, InMemoryOrchestrator, InMemoryStore,
    InvocationContext, InvocationId, KeyDerivation, LEDGER_TABLE, Ledger, Orchestrator,
    RunOutcome,
};
use serde_json::json;

struct Harness {
    store: InMemoryStore,
    guard: IdempotencyGuard,
    orchestrator: Arc<dyn Orchestrator>,
}

impl Harness {
    async fn new(derivation: KeyDerivation, executions: &[&str]) -> Self {
        let store = InMemoryStore::new();
        let guard = IdempotencyGuard::new(
            Arc::new(store.clone()),
            Ledger::default(),
            GuardConfig::default().with_key_derivation(derivation),
        );
        let orchestrator: Arc<dyn Orchestrator> = Arc::new(InMemoryOrchestrator::new());
        for exec in executions {
            orchestrator
                .start_execution(&ExecutionId::new(*exec))
                .await
                .unwrap();
        }
        Self {
            store,
            guard,
            orchestrator,
        }
    }

    async fn deliver(&self, exec: &str, invocation: &str) -> InvocationContext {
        InvocationContext::start(
            Arc::clone(&self.orchestrator),
            &ExecutionId::new(exec),
            &InvocationId::new(invocation),
        )
        .await
        .unwrap()
    }

    /// Redelivery that has been told which key to use, as if a previous
    /// attempt had recorded it before crashing.
    async fn deliver_with_key(&self, exec: &str, invocation: &str, key: &str) -> InvocationContext {
        let ctx = self.deliver(exec, invocation).await;
        if ctx.progress_marker::<serde_json::Value>().await.unwrap().is_none() {
            ctx.heartbeat(&json!({ "idempotency_key": key })).await.unwrap();
        }
        ctx
    }
}

async fn save_patient(
    guard: &IdempotencyGuard,
    ctx: &InvocationContext,
    name: &'static str,
) -> Result<RunOutcome<()>, GuardError> {
    guard
        .run_once(ctx, move |tx| {
            Box::pin(async move {
                tx.insert("patients", name, json!({ "name": name })).await?;
                Ok(())
            })
        })
        .await
}

#[tokio::test]
async fn test_crash_and_redeliver_inserts_one_row_per_patient() {
    let h = Harness::new(KeyDerivation::ProgressMarker, &["Alice", "Bob"]).await;

    // Alice is delivered, saved, then "crashes" before completing and is
    // redelivered.
    for _ in 0..2 {
        let ctx = h.deliver_with_key("Alice", "save", "attempt-1").await;
        save_patient(&h.guard, &ctx, "Alice").await.unwrap();
    }

    let bob = h.deliver_with_key("Bob", "save", "attempt-2").await;
    let outcome = save_patient(&h.guard, &bob, "Bob").await.unwrap();
    assert!(outcome.is_executed(), "Bob has his own key");

    let patients: Vec<String> = h
        .store
        .rows("patients")
        .await
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(patients, vec!["Alice".to_string(), "Bob".to_string()]);

    let keys: Vec<String> = h
        .store
        .rows(LEDGER_TABLE)
        .await
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(keys, vec!["attempt-1".to_string(), "attempt-2".to_string()]);
}

#[tokio::test]
async fn test_work_side_effect_runs_exactly_once() {
    let h = Harness::new(KeyDerivation::InvocationId, &["wf"]).await;
    let runs = Arc::new(AtomicUsize::new(0));
    let backups = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let ctx = h.deliver("wf", "notify").await;
        let runs = Arc::clone(&runs);
        let backups = Arc::clone(&backups);
        h.guard
            .run_once_or_else(
                &ctx,
                move |_| {
                    Box::pin(async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, GuardError>(())
                    })
                },
                move |_| {
                    Box::pin(async move {
                        backups.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                },
            )
            .await
            .unwrap();
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(backups.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_attempt_is_retried_with_same_key() {
    let h = Harness::new(KeyDerivation::ProgressMarker, &["wf"]).await;

    let first = h.deliver("wf", "save").await;
    let failed = h
        .guard
        .run_once(&first, |tx| {
            Box::pin(async move {
                tx.insert("patients", "Carol", json!({})).await?;
                Err::<(), _>(GuardError::key_derivation("downstream unavailable"))
            })
        })
        .await;
    assert!(failed.is_err());
    assert_eq!(h.store.table_len(LEDGER_TABLE).await, 0);
    let recorded: serde_json::Value = first.progress_marker().await.unwrap().unwrap();

    let second = h.deliver("wf", "save").await;
    let outcome = save_patient(&h.guard, &second, "Carol").await.unwrap();
    assert!(outcome.is_executed());

    let entries = h.store.rows(LEDGER_TABLE).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(
        json!(entries[0].0),
        recorded["idempotency_key"],
        "Redelivery must reuse the recorded key"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_redeliveries_race_on_claim() {
    let h = Harness::new(KeyDerivation::InvocationId, &["wf"]).await;
    let first = h.deliver("wf", "save").await;
    let second = h.deliver("wf", "save").await;

    let race = |ctx: InvocationContext| {
        let guard = h.guard.clone();
        tokio::spawn(async move {
            guard
                .run_once(&ctx, |tx| {
                    Box::pin(async move {
                        tx.insert("patients", "Dave", json!({})).await?;
                        // Hold the claim long enough for the other attempt to collide.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, GuardError>(())
                    })
                })
                .await
        })
    };

    let (a, b) = tokio::join!(race(first), race(second));
    let outcomes = [a.unwrap().unwrap(), b.unwrap().unwrap()];

    let executed = outcomes.iter().filter(|o| o.is_executed()).count();
    assert_eq!(executed, 1, "Exactly one attempt may win the claim");
    assert!(outcomes.contains(&RunOutcome::Skipped));
    assert_eq!(h.store.table_len("patients").await, 1);
}
