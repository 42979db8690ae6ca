//! End-to-end engine tests against the in-memory store

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;
use uuid::Uuid;

use process_engine::{
    ActionError, ActionRegistry, AuditMutation, AuditOperation, AuditRecorder, AuditSchemaRegistry,
    EngineError, InMemoryAuditLog, InMemoryProcessStore, ProcessRegistry, ProcessResolution,
    ProcessStepStatus, ProcessStore, RetriggerPolicy, StepCatalog, StepExecutor, StepOutcome,
};

/// Offer subscription catalog used across the scenarios
fn subscription_catalog() -> Arc<StepCatalog> {
    Arc::new(
        StepCatalog::builder()
            .process_type("OFFER_SUBSCRIPTION")
            .step("TRIGGER_PROVIDER")
            .on_success("OFFERSUBSCRIPTION_CLIENT_CREATION")
            .retrigger("RETRIGGER_PROVIDER")
            .step("RETRIGGER_PROVIDER")
            .on_success("OFFERSUBSCRIPTION_CLIENT_CREATION")
            .retrigger("RETRIGGER_PROVIDER")
            .step("OFFERSUBSCRIPTION_CLIENT_CREATION")
            .on_success("ACTIVATE_SUBSCRIPTION")
            .step("ACTIVATE_SUBSCRIPTION")
            .build()
            .unwrap(),
    )
}

fn engine(
    store: Arc<InMemoryProcessStore>,
    actions: ActionRegistry,
) -> (
    ProcessRegistry<InMemoryProcessStore>,
    StepExecutor<InMemoryProcessStore>,
) {
    let catalog = subscription_catalog();
    (
        ProcessRegistry::new(store.clone(), catalog.clone()),
        StepExecutor::new(store, catalog, actions, RetriggerPolicy::immediate(3)),
    )
}

async fn drive_to_completion(executor: &StepExecutor<InMemoryProcessStore>, process_id: Uuid) {
    while executor
        .execute_next(process_id, "test-worker")
        .await
        .unwrap()
        .is_some()
    {}
}

#[test_log::test(tokio::test)]
async fn test_subscription_activation_chain() {
    let store = Arc::new(InMemoryProcessStore::new());
    let mut actions = ActionRegistry::new();
    actions.register("TRIGGER_PROVIDER", |_ctx| async {
        Ok(Some("provider notified".to_string()))
    });
    actions.register("OFFERSUBSCRIPTION_CLIENT_CREATION", |_ctx| async {
        Ok(Some("client created".to_string()))
    });
    actions.register("ACTIVATE_SUBSCRIPTION", |_ctx| async { Ok(None) });
    let (registry, executor) = engine(store.clone(), actions);

    let process_id = registry.create_process("OFFER_SUBSCRIPTION").await.unwrap();
    assert_ok!(executor.enqueue_step(process_id, "TRIGGER_PROVIDER").await);
    drive_to_completion(&executor, process_id).await;

    let steps = store.list_steps(process_id).await.unwrap();
    let types: Vec<&str> = steps.iter().map(|s| s.step_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "TRIGGER_PROVIDER",
            "OFFERSUBSCRIPTION_CLIENT_CREATION",
            "ACTIVATE_SUBSCRIPTION"
        ]
    );
    assert!(steps.iter().all(|s| s.status == ProcessStepStatus::Done));
    assert_eq!(
        executor.resolution(process_id).await.unwrap(),
        ProcessResolution::Resolved
    );
}

#[test_log::test(tokio::test)]
async fn test_failed_step_is_immutable_and_retriggered() {
    let store = Arc::new(InMemoryProcessStore::new());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut actions = ActionRegistry::new();
    actions.register("TRIGGER_PROVIDER", move |_ctx| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ActionError::retryable("clearing house unreachable"))
        }
    });
    actions.register("RETRIGGER_PROVIDER", |_ctx| async {
        Ok(Some("provider reached on retry".to_string()))
    });
    actions.register("OFFERSUBSCRIPTION_CLIENT_CREATION", |_ctx| async { Ok(None) });
    actions.register("ACTIVATE_SUBSCRIPTION", |_ctx| async { Ok(None) });
    let (registry, executor) = engine(store.clone(), actions);

    let process_id = registry.create_process("OFFER_SUBSCRIPTION").await.unwrap();
    executor
        .enqueue_step(process_id, "TRIGGER_PROVIDER")
        .await
        .unwrap();

    let outcome = executor
        .execute_next(process_id, "test-worker")
        .await
        .unwrap()
        .unwrap();
    let StepOutcome::Failed {
        step_id: failed_id,
        retrigger: Some(retrigger_id),
    } = outcome
    else {
        panic!("expected failure with retrigger");
    };

    // The failed step keeps its state; recovery runs as a new step.
    let failed = store.get_step(failed_id).await.unwrap();
    assert_eq!(failed.status, ProcessStepStatus::Failed);
    assert!(failed
        .message
        .as_deref()
        .unwrap()
        .contains("clearing house unreachable"));

    let retrigger = store.get_step(retrigger_id).await.unwrap();
    assert_eq!(retrigger.step_type, "RETRIGGER_PROVIDER");
    assert_eq!(retrigger.attempt_of, Some(failed_id));

    drive_to_completion(&executor, process_id).await;

    // The original action ran exactly once; the retrigger carried on.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let failed_after = store.get_step(failed_id).await.unwrap();
    assert_eq!(failed_after.status, ProcessStepStatus::Failed);
    assert_eq!(failed_after.message, failed.message);
    assert_eq!(
        executor.resolution(process_id).await.unwrap(),
        ProcessResolution::Resolved
    );
}

#[tokio::test]
async fn test_audit_records_one_row_per_mutation() {
    let schema = Arc::new(AuditSchemaRegistry::new());
    schema.register("process_steps", "v20230614").unwrap();
    let audit = InMemoryAuditLog::new(schema.clone());

    let store = Arc::new(InMemoryProcessStore::new());
    let mut actions = ActionRegistry::new();
    actions.register("ACTIVATE_SUBSCRIPTION", |_ctx| async { Ok(None) });
    let (registry, executor) = engine(store.clone(), actions);

    let process_id = registry.create_process("OFFER_SUBSCRIPTION").await.unwrap();
    let step_id = executor
        .enqueue_step(process_id, "ACTIVATE_SUBSCRIPTION")
        .await
        .unwrap();

    // Mirror the step lifecycle into the audit trail.
    let step = store.get_step(step_id).await.unwrap();
    audit
        .record(AuditMutation::new(
            "process_steps",
            step_id,
            AuditOperation::Insert,
            serde_json::to_value(&step).unwrap(),
        ))
        .await
        .unwrap();

    executor
        .execute_next(process_id, "test-worker")
        .await
        .unwrap();
    let step = store.get_step(step_id).await.unwrap();
    audit
        .record(AuditMutation::new(
            "process_steps",
            step_id,
            AuditOperation::Update,
            serde_json::to_value(&step).unwrap(),
        ))
        .await
        .unwrap();

    let entries = audit
        .entries_for("process_steps", step_id, None, None)
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].operation, AuditOperation::Insert);
    assert_eq!(entries[1].operation, AuditOperation::Update);
    assert_eq!(entries[0].snapshot["status"], "todo");
    assert_eq!(entries[1].snapshot["status"], "done");

    // A schema generation change leaves existing entries untouched.
    schema.add_generation("process_steps", "v20231115").unwrap();
    let entries = audit
        .entries_for("process_steps", step_id, None, None)
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.generation == "v20230614"));
}

#[tokio::test]
async fn test_concurrent_claims_are_exclusive() {
    let store = Arc::new(InMemoryProcessStore::new());
    let process_id = Uuid::now_v7();
    store
        .create_process(process_id, "OFFER_SUBSCRIPTION", None)
        .await
        .unwrap();
    store
        .enqueue_step(process_engine::StepEnqueue::new(
            process_id,
            "TRIGGER_PROVIDER",
        ))
        .await
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .claim_next_steps(
                        &format!("worker-{i}"),
                        &["TRIGGER_PROVIDER".to_string()],
                        10,
                    )
                    .await
                    .unwrap()
            })
        })
        .collect();

    let total: usize = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|claimed| claimed.unwrap().len())
        .sum();
    assert_eq!(total, 1, "exactly one worker wins the claim");
}

#[tokio::test]
async fn test_unknown_process_type_rejected_end_to_end() {
    let store = Arc::new(InMemoryProcessStore::new());
    let (registry, executor) = engine(store.clone(), ActionRegistry::new());

    let err = registry.create_process("PARTNER_REGISTRATION").await;
    assert!(matches!(err, Err(EngineError::InvalidProcessType(_))));

    let process_id = registry.create_process("OFFER_SUBSCRIPTION").await.unwrap();
    let err = executor.enqueue_step(process_id, "SELF_DESCRIPTION_CREATION").await;
    assert!(matches!(err, Err(EngineError::InvalidStepType { .. })));
}

#[tokio::test]
async fn test_delayed_retrigger_respects_backoff() {
    let store = Arc::new(InMemoryProcessStore::new());
    let mut actions = ActionRegistry::new();
    actions.register("TRIGGER_PROVIDER", |_ctx| async {
        Err(ActionError::retryable("timeout"))
    });
    let catalog = subscription_catalog();
    let executor = StepExecutor::new(
        store.clone(),
        catalog.clone(),
        actions,
        RetriggerPolicy::fixed(Duration::from_secs(120), 3),
    );
    let registry = ProcessRegistry::new(store.clone(), catalog);

    let process_id = registry.create_process("OFFER_SUBSCRIPTION").await.unwrap();
    executor
        .enqueue_step(process_id, "TRIGGER_PROVIDER")
        .await
        .unwrap();
    executor
        .execute_next(process_id, "test-worker")
        .await
        .unwrap();

    // The retrigger row exists but its delay has not elapsed, so neither
    // the polling path nor the step-through path may see it yet.
    let steps = store.list_steps(process_id).await.unwrap();
    let retrigger = steps
        .iter()
        .find(|s| s.step_type == "RETRIGGER_PROVIDER")
        .unwrap();
    assert_eq!(retrigger.status, ProcessStepStatus::Todo);

    let pending = store.pending_steps(process_id).await.unwrap();
    assert!(pending.is_empty());

    let outcome = executor
        .execute_next(process_id, "test-worker")
        .await
        .unwrap();
    assert!(outcome.is_none());

    let claimed = store
        .claim_next_steps("test-worker", &["RETRIGGER_PROVIDER".to_string()], 10)
        .await
        .unwrap();
    assert!(claimed.is_empty());
}
