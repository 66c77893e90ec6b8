mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use optimistic_txn::config::TransactionConfig;
use optimistic_txn::error::{MutationError, TransactionError};
use optimistic_txn::transaction::{
    mutation_fn, EventKind, InMemoryRemote, MutationRequest, Operation, OperationOutcome, TransactionManager,
    TransactionStatus,
};
use optimistic_txn::types::{EntityId, OperationKind};
use serde_json::{json, Value};
use tokio::sync::Notify;

use common::{events, kinds, manager, map, record};

#[tokio::test]
async fn same_entity_updates_reach_remote_once_with_merged_data() -> Result<()> {
    let manager = manager("events");
    let received: Arc<Mutex<Vec<MutationRequest>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let mutation = mutation_fn("recording", move |request: MutationRequest| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(request.clone());
            Ok(Value::Object(request.data))
        }
    });

    let first = manager.add_operation(Operation::update("events", "E", map(json!({"x": 1})), mutation.clone()), None)?;
    let second = manager.add_operation(Operation::update("events", "E", map(json!({"x": 2})), mutation), None)?;

    let outcome = manager.commit(false).await?;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1, "one call for the entity");
    assert_eq!(received[0].kind, OperationKind::Update);
    assert_eq!(received[0].data["x"], json!(2));

    assert_eq!(outcome.result_for(second).map(|r| r.outcome), Some(OperationOutcome::Applied));
    assert_eq!(
        outcome.result_for(first).map(|r| r.outcome),
        Some(OperationOutcome::Coalesced { into: second })
    );
    Ok(())
}

#[tokio::test]
async fn entities_commit_concurrently_up_to_limit() -> Result<()> {
    let config = TransactionConfig { max_concurrency: 2, ..TransactionConfig::default() };
    let manager = TransactionManager::with_config("events", config);

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (current, max) = (in_flight.clone(), peak.clone());
    let mutation = mutation_fn("slow", move |request: MutationRequest| {
        let (current, max) = (current.clone(), max.clone());
        async move {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            max.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Object(request.data))
        }
    });

    for id in 1..=5 {
        manager.add_operation(Operation::delete("events", id.to_string(), mutation.clone()), None)?;
    }
    let outcome = manager.commit(false).await?;

    assert_eq!(outcome.applied_count(), 5);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn failure_marks_transaction_failed_and_keeps_applied_work() -> Result<()> {
    let manager = manager("events");
    let remote = Arc::new(InMemoryRemote::new());
    remote.seed("events", events());
    remote.fail_next("2", "locked by another user");
    let seen = record(&manager);

    manager.add_operation(Operation::update("events", "1", map(json!({"title": "Daily"})), remote.clone()), None)?;
    let failing = manager.add_operation(Operation::delete("events", "2", remote.clone()), None)?;

    let outcome = manager.commit(false).await?;
    assert_eq!(outcome.status, TransactionStatus::Failed);
    assert_eq!(outcome.failed_entities(), vec![EntityId::new("2")]);
    match &outcome.result_for(failing).and_then(|r| r.error.clone()) {
        Some(TransactionError::MutationFailed { operation_id, source }) => {
            assert_eq!(*operation_id, failing);
            assert_eq!(*source, MutationError::Rejected("locked by another user".to_string()));
        }
        other => panic!("expected MutationFailed, got {:?}", other),
    }

    // applied work is not undone automatically
    assert_eq!(remote.get("events", &EntityId::new("1")).unwrap()["title"], json!("Daily"));
    assert!(!manager.has_operations());
    assert_eq!(manager.last_transaction().map(|t| t.status), Some(TransactionStatus::Failed));

    let kinds = kinds(&seen);
    assert_eq!(kinds.first(), Some(&EventKind::OperationAdded));
    assert!(kinds.contains(&EventKind::TransactionError));
    assert_eq!(kinds.last(), Some(&EventKind::TransactionComplete));
    Ok(())
}

#[tokio::test]
async fn partial_success_completes_despite_failures() -> Result<()> {
    let config = TransactionConfig { allow_partial_success: true, ..TransactionConfig::default() };
    let manager = TransactionManager::with_config("events", config);
    let remote = Arc::new(InMemoryRemote::new());
    remote.seed("events", events());

    manager.add_operation(Operation::delete("events", "1", remote.clone()), None)?;
    manager.add_operation(Operation::delete("events", "missing", remote.clone()), None)?;

    let outcome = manager.commit(false).await?;
    assert_eq!(outcome.status, TransactionStatus::Completed);
    assert!(outcome.has_failures());
    assert_eq!(outcome.applied_count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn slow_mutation_times_out() -> Result<()> {
    let config = TransactionConfig { timeout_ms: 50, ..TransactionConfig::default() };
    let manager = TransactionManager::with_config("events", config);
    let remote = Arc::new(InMemoryRemote::new().with_latency(Duration::from_secs(5)));
    remote.seed("events", events());

    let id = manager.add_operation(Operation::delete("events", "1", remote.clone()), None)?;
    let outcome = manager.commit(false).await?;

    let result = outcome.result_for(id).expect("result");
    assert_eq!(result.outcome, OperationOutcome::Failed);
    assert!(matches!(
        result.error,
        Some(TransactionError::MutationFailed { source: MutationError::Timeout(_), .. })
    ));
    Ok(())
}

#[tokio::test]
async fn rollback_restores_remote_after_failed_commit() -> Result<()> {
    let manager = manager("events");
    let remote = Arc::new(InMemoryRemote::new());
    remote.seed("events", events());
    let rows = events();

    manager.add_operation(
        Operation::update("events", "1", map(json!({"title": "Daily"})), remote.clone()).with_original(rows[0].clone()),
        None,
    )?;
    manager.add_operation(Operation::delete("events", "2", remote.clone()).with_original(rows[1].clone()), None)?;
    manager.add_operation(Operation::create("events", map(json!({"title": "Launch"})), remote.clone()), None)?;
    remote.fail_next("3", "conflict");
    manager.add_operation(
        Operation::update("events", "3", map(json!({"room": "Z"})), remote.clone()).with_original(rows[2].clone()),
        None,
    )?;

    let committed = manager.commit(false).await?;
    assert_eq!(committed.status, TransactionStatus::Failed);
    assert_eq!(committed.applied_count(), 3);
    assert_eq!(remote.rows("events").len(), 3);

    let seen = record(&manager);
    let rolled_back = manager.rollback().await?;
    assert_eq!(rolled_back.status, TransactionStatus::RolledBack);
    assert_eq!(rolled_back.applied_count(), 3);
    assert_eq!(remote.rows("events"), rows);
    assert_eq!(kinds(&seen), vec![EventKind::RollbackComplete]);
    assert_eq!(manager.last_transaction().map(|t| t.status), Some(TransactionStatus::RolledBack));

    // only once
    assert!(matches!(manager.rollback().await, Err(TransactionError::InvalidState(_))));
    Ok(())
}

#[tokio::test]
async fn rollback_requires_failed_transaction() -> Result<()> {
    let manager = manager("events");
    assert!(matches!(manager.rollback().await, Err(TransactionError::InvalidState(_))));

    let remote = Arc::new(InMemoryRemote::new());
    remote.seed("events", events());
    manager.add_operation(Operation::delete("events", "1", remote), None)?;
    manager.commit(false).await?;
    assert!(matches!(manager.rollback().await, Err(TransactionError::InvalidState(_))));
    Ok(())
}

#[tokio::test]
async fn executing_transaction_rejects_changes() -> Result<()> {
    let manager = common::manager("events");
    let gate = Arc::new(Notify::new());
    let started = Arc::new(Notify::new());

    let (wait, signal) = (gate.clone(), started.clone());
    let mutation = mutation_fn("gated", move |request: MutationRequest| {
        let (wait, signal) = (wait.clone(), signal.clone());
        async move {
            signal.notify_one();
            wait.notified().await;
            Ok(Value::Object(request.data))
        }
    });
    manager.add_operation(Operation::delete("events", "1", mutation.clone()), None)?;

    let committing = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.commit(false).await })
    };
    started.notified().await;

    assert_eq!(manager.status(), Some(TransactionStatus::Executing));
    assert!(matches!(manager.cancel(), Err(TransactionError::InvalidState(_))));
    assert!(matches!(
        manager.add_operation(Operation::delete("events", "2", mutation), None),
        Err(TransactionError::InvalidState(_))
    ));
    assert!(!manager.remove_operation(manager.operations()[0].id));

    gate.notify_one();
    let outcome = committing.await??;
    assert_eq!(outcome.status, TransactionStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn commit_event_sequence() -> Result<()> {
    let manager = manager("events");
    let remote = Arc::new(InMemoryRemote::new());
    remote.seed("events", events());
    manager.add_operation(Operation::delete("events", "1", remote.clone()), None)?;
    manager.add_operation(Operation::delete("events", "2", remote), None)?;

    let seen = record(&manager);
    manager.commit(false).await?;

    assert_eq!(
        kinds(&seen),
        vec![
            EventKind::TransactionStart,
            EventKind::OperationComplete,
            EventKind::OperationComplete,
            EventKind::TransactionComplete,
        ]
    );
    Ok(())
}

#[tokio::test]
async fn listener_may_call_back_into_manager() -> Result<()> {
    let manager = common::manager("events");
    let counts = Arc::new(Mutex::new(Vec::new()));

    let (weak, sink) = (Arc::downgrade(&manager), counts.clone());
    manager.on(EventKind::OperationAdded, move |_| {
        if let Some(manager) = weak.upgrade() {
            sink.lock().unwrap().push(manager.operation_count());
        }
    });

    let remote = Arc::new(InMemoryRemote::new());
    manager.add_operation(Operation::delete("events", "1", remote.clone()), None)?;
    manager.add_operation(Operation::delete("events", "2", remote), None)?;

    assert_eq!(*counts.lock().unwrap(), vec![1, 2]);
    Ok(())
}

#[tokio::test]
async fn cancel_discards_without_remote_calls() -> Result<()> {
    let manager = manager("events");
    let remote = Arc::new(InMemoryRemote::new());
    manager.add_operation(Operation::update("events", "1", map(json!({"title": "x"})), remote.clone()), None)?;
    let seen = record(&manager);

    manager.cancel()?;
    assert!(remote.calls().is_empty());
    assert_eq!(manager.status(), Some(TransactionStatus::Cancelled));
    assert_eq!(kinds(&seen), vec![EventKind::TransactionCancelled]);
    Ok(())
}
