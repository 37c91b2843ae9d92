//! End-to-end execution flows against in-memory collaborators.

mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use intsync_common::{
    ConflictStatus, ConflictStrategy, Error, ExecutionErrorKind, ExecutionStatus, SyncExecution,
    SyncPhase, TargetConfig, TaskSchedule, TaskStatus, TenantId, TriggerSource, UserId,
};
use intsync_connectors::{IntegrationAdapter, StaticAdapter};
use intsync_sync::{
    BatchConfig, EngineConfig, RetryConfig, SyncEvent, EXECUTION_COMPLETED, RECORDS_FETCHED,
};

use common::{
    contacts, FlakySchemaService, GatedAdapter, Harness, PanickingShardService, SpyTaskRepository,
    YieldingShardService,
};

/// Defaults without the inter-batch pause.
fn fast_config() -> EngineConfig {
    EngineConfig::default().with_batch(BatchConfig::new(100, Duration::ZERO))
}

#[tokio::test]
async fn test_clean_records_succeed() {
    let h = Harness::new(fast_config());
    let (task, adapter) = h.add_task(h.schema(), contacts(5));
    let user = UserId::new();

    let execution = h
        .engine
        .trigger_sync(task.id, h.tenant, Some(user))
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert_eq!(execution.triggered_by_user_id, Some(user));

    let done = h.finished(&execution).await;
    assert_eq!(done.status, ExecutionStatus::Success);
    assert_eq!(done.records_processed, 5);
    assert_eq!(done.progress.succeeded, 5);
    assert!(done.error.is_none());
    assert!(done.completed_at.is_some());
    assert_eq!(adapter.fetch_count(), 1);
    assert_eq!(h.store.len(), 5);

    let stats = h.engine.get_statistics();
    assert_eq!(stats.executions_started, 1);
    assert_eq!(stats.executions_succeeded, 1);
    assert_eq!(stats.executions_running, 0);
    assert_eq!(stats.records_fetched, 5);
    assert_eq!(stats.records_succeeded, 5);

    let task = h.tasks.get(task.id).unwrap();
    assert_eq!(task.last_run_status, Some(ExecutionStatus::Success));
    assert_eq!(task.last_execution_id, Some(execution.id));
}

#[tokio::test]
async fn test_empty_fetch_is_success() {
    let h = Harness::new(fast_config());
    let (task, _) = h.add_task(h.schema(), Vec::new());

    let execution = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    let done = h.finished(&execution).await;

    assert_eq!(done.status, ExecutionStatus::Success);
    assert_eq!(done.records_processed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_never_both_succeed() {
    let h = Arc::new(Harness::new(fast_config()));
    let adapter = Arc::new(GatedAdapter::new(contacts(3)));
    let gate = adapter.gate.clone();
    let task_id = h.add_task_with_adapter(h.schema(), adapter).id;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let h = h.clone();
            tokio::spawn(async move { h.engine.trigger_sync(task_id, h.tenant, None).await })
        })
        .collect();

    let mut started = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(execution) => started.push(execution),
            Err(err) => assert!(matches!(err, Error::AlreadyRunning(_)), "{}", err),
        }
    }
    assert_eq!(started.len(), 1);
    assert_eq!(h.executions.len(), 1);
    assert_eq!(h.engine.running_count(), 1);

    gate.notify_one();
    let done = h.finished(&started[0]).await;
    assert_eq!(done.status, ExecutionStatus::Success);

    // Released once finished
    assert_eq!(h.engine.running_count(), 0);
    let again = h.engine.trigger_sync(task_id, h.tenant, None).await;
    assert!(again.is_ok());
    gate.notify_one();
    h.engine.drain().await;
}

#[tokio::test]
async fn test_disabled_task_creates_no_execution() {
    let h = Harness::new(fast_config());
    let (task, adapter) = h.add_task(h.schema(), contacts(1));
    h.tasks.insert(task.clone().with_status(TaskStatus::Disabled));

    let result = h.engine.trigger_sync(task.id, h.tenant, None).await;

    assert!(matches!(result, Err(Error::InvalidState(_))));
    assert!(h.executions.is_empty());
    assert_eq!(adapter.fetch_count(), 0);
    assert_eq!(h.engine.get_statistics().executions_started, 0);
}

#[tokio::test]
async fn test_unknown_task_not_found() {
    let h = Harness::new(fast_config());
    let (task, _) = h.add_task(h.schema(), Vec::new());

    let missing = h
        .engine
        .trigger_sync(intsync_common::TaskId::new(), h.tenant, None)
        .await;
    assert!(matches!(missing, Err(Error::NotFound(_))));

    let foreign = h.engine.trigger_sync(task.id, TenantId::new(), None).await;
    assert!(matches!(foreign, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_retry_of_success_is_rejected() {
    let h = Harness::new(fast_config());
    let (task, _) = h.add_task(h.schema(), contacts(2));

    let execution = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    let done = h.finished(&execution).await;
    assert_eq!(done.status, ExecutionStatus::Success);

    let err = h
        .engine
        .retry_execution(done.id, h.tenant, None)
        .await
        .unwrap_err();
    match err {
        Error::InvalidState(message) => {
            assert_eq!(message, "Can only retry failed or partial executions")
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(h.executions.len(), 1);
}

#[tokio::test]
async fn test_retry_of_failed_execution() {
    let h = Harness::new(fast_config());
    let (task, _) = h.add_task_without_schema(contacts(2));

    let first = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    let failed = h.finished(&first).await;
    assert_eq!(failed.status, ExecutionStatus::Failed);

    let user = UserId::new();
    let retry = h
        .engine
        .retry_execution(failed.id, h.tenant, Some(user))
        .await
        .unwrap();

    assert_ne!(retry.id, failed.id);
    assert_eq!(retry.triggered_by, TriggerSource::Retry);
    assert_eq!(retry.retry_of, Some(failed.id));
    assert_eq!(retry.triggered_by_user_id, Some(user));
    h.engine.drain().await;
}

#[tokio::test]
async fn test_retry_of_partial_execution() {
    let h = Harness::new(fast_config());
    let schema = h.schema().map("email", "email", true);
    let (task, _) = h.add_task(
        schema,
        vec![json!({ "email": "a@example.com" }), json!({ "name": "no email" })],
    );

    let first = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    let partial = h.finished(&first).await;
    assert_eq!(partial.status, ExecutionStatus::Partial);

    let retry = h
        .engine
        .retry_execution(partial.id, h.tenant, None)
        .await
        .unwrap();
    assert_eq!(retry.retry_of, Some(partial.id));
    h.engine.drain().await;
}

#[tokio::test]
async fn test_retry_of_unknown_execution() {
    let h = Harness::new(fast_config());
    let result = h
        .engine
        .retry_execution(intsync_common::ExecutionId::new(), h.tenant, None)
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_all_records_failing_fails_execution() {
    let h = Harness::new(fast_config());
    let schema = h.schema().map("email", "email", true);
    let (task, _) = h.add_task(schema, vec![json!({ "name": "a" }), json!({ "name": "b" })]);

    let execution = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    let done = h.finished(&execution).await;

    assert_eq!(done.status, ExecutionStatus::Failed);
    assert_eq!(done.records_processed, 2);
    assert_eq!(done.progress.failed, 2);
    assert_eq!(done.record_failures.len(), 2);
    assert!(done.record_failures[0].message.contains("missing required field"));
    let error = done.error.unwrap();
    assert_eq!(error.kind, ExecutionErrorKind::AllRecordsFailed);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_single_failing_record_fails_execution() {
    let h = Harness::new(fast_config());
    let schema = h.schema().map("email", "email", true);
    let (task, _) = h.add_task(schema, vec![json!({ "name": "a" })]);

    let execution = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    let done = h.finished(&execution).await;

    assert_eq!(done.status, ExecutionStatus::Failed);
    assert_eq!(done.records_processed, 1);
}

#[tokio::test]
async fn test_mixed_records_are_partial() {
    let h = Harness::new(fast_config());
    let schema = h.schema().map("email", "email", true);
    let (task, _) = h.add_task(
        schema,
        vec![
            json!({ "email": "a@example.com" }),
            json!({ "name": "missing" }),
            json!({ "email": "c@example.com" }),
        ],
    );

    let execution = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    let done = h.finished(&execution).await;

    assert_eq!(done.status, ExecutionStatus::Partial);
    assert_eq!(done.records_processed, 3);
    assert_eq!(done.progress.succeeded, 2);
    assert_eq!(done.progress.failed, 1);
    assert_eq!(done.record_failures[0].index, 1);
    assert!(done.error.is_none());
    assert_eq!(h.store.len(), 2);
    assert_eq!(h.engine.get_statistics().executions_partial, 1);
}

#[tokio::test(start_paused = true)]
async fn test_recoverable_transform_succeeds_on_second_attempt() {
    let initial = Duration::from_millis(200);
    let multiplier = 2.0;
    let config = fast_config().with_retry(
        RetryConfig::new(3)
            .with_initial_delay(initial)
            .with_backoff_multiplier(multiplier)
            .with_jitter(true),
    );

    let mut flaky = None;
    let h = Harness::build(config, |mut services, _, schemas| {
        let service = Arc::new(FlakySchemaService::new(schemas.clone(), 1));
        services.schemas = service.clone();
        flaky = Some(service);
        services
    });
    let flaky = flaky.unwrap();
    let (task, _) = h.add_task(h.schema(), contacts(1));

    let execution = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    let done = h.finished(&execution).await;

    assert_eq!(done.status, ExecutionStatus::Success);
    assert_eq!(done.progress.succeeded, 1);
    assert_eq!(done.progress.failed, 0);

    let calls = flaky.call_times();
    assert_eq!(calls.len(), 2);
    let delay = calls[1] - calls[0];
    assert!(delay >= initial, "delay {:?} below initial", delay);
    assert!(
        delay <= initial.mul_f64(multiplier),
        "delay {:?} above one backoff step",
        delay
    );
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_record() {
    let config = fast_config().with_retry(
        RetryConfig::new(2).with_initial_delay(Duration::from_millis(50)),
    );
    let mut flaky = None;
    let h = Harness::build(config, |mut services, _, schemas| {
        let service = Arc::new(FlakySchemaService::new(schemas.clone(), 2));
        services.schemas = service.clone();
        flaky = Some(service);
        services
    });
    let flaky = flaky.unwrap();
    let (task, _) = h.add_task(h.schema(), contacts(2));

    let execution = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    let done = h.finished(&execution).await;

    // First record uses up both attempts; the second succeeds at once
    assert_eq!(done.status, ExecutionStatus::Partial);
    assert_eq!(done.progress.failed, 1);
    assert_eq!(done.progress.succeeded, 1);
    assert_eq!(flaky.call_times().len(), 3);
    assert!(done.record_failures[0].message.contains("timed out"));
}

#[tokio::test]
async fn test_process_due_tasks_uses_limit_and_schedule_trigger() {
    let config = fast_config().with_due_task_limit(4);
    let mut spy = None;
    let h = Harness::build(config, |mut services, tasks, _| {
        let repository = Arc::new(SpyTaskRepository::new(tasks.clone()));
        services.tasks = repository.clone();
        spy = Some(repository);
        services
    });
    let spy = spy.unwrap();

    for _ in 0..6 {
        let (task, _) = h.add_task(h.schema(), contacts(1));
        h.tasks.insert(task.with_schedule(TaskSchedule::every(300)));
    }
    // Unscheduled tasks are never due
    h.add_task(h.schema(), contacts(1));

    let report = h.engine.process_due_tasks().await.unwrap();
    assert_eq!(spy.limits(), vec![4]);
    assert_eq!(report.triggered.len(), 4);
    assert!(report.skipped.is_empty());
    assert!(report
        .triggered
        .iter()
        .all(|execution| execution.triggered_by == TriggerSource::Schedule));

    h.engine.drain().await;

    // Completed runs advance their schedule; only the two leftovers are due
    let report = h.engine.process_due_tasks().await.unwrap();
    assert_eq!(report.triggered.len(), 2);
    assert_eq!(spy.limits(), vec![4, 4]);
    h.engine.drain().await;

    let report = h.engine.process_due_tasks().await.unwrap();
    assert!(report.is_empty());
}

#[tokio::test]
async fn test_due_task_already_running_is_skipped() {
    let h = Harness::new(fast_config());
    let adapter = Arc::new(GatedAdapter::new(contacts(1)));
    let gate = adapter.gate.clone();
    let task = h.add_task_with_adapter(h.schema(), adapter);
    h.tasks
        .insert(task.clone().with_schedule(TaskSchedule::every(60)));

    let manual = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();

    let report = h.engine.process_due_tasks().await.unwrap();
    assert!(report.triggered.is_empty());
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].0, task.id);

    gate.notify_one();
    let done = h.finished(&manual).await;
    assert_eq!(done.status, ExecutionStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn test_batches_and_fetched_metric() {
    let config = EngineConfig::default().with_batch(BatchConfig::new(10, Duration::from_millis(100)));
    let h = Harness::new(config);
    let (task, _) = h.add_task(h.schema(), contacts(250));

    let start = tokio::time::Instant::now();
    let execution = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    let done = h.finished(&execution).await;

    assert_eq!(done.status, ExecutionStatus::Success);
    assert_eq!(done.records_processed, 250);
    assert_eq!(done.progress.total_batches, 25);
    assert_eq!(done.progress.current_batch, 25);

    // 24 pauses between 25 batches, none after the last
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(2_400), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2_500), "{:?}", elapsed);

    let fetched = h.monitor.metrics_named(RECORDS_FETCHED);
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].value, 250.0);

    let completed = h.monitor.metrics_named(EXECUTION_COMPLETED);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].tag_value("status"), Some("success"));
}

#[tokio::test]
async fn test_completion_event_carries_outcome() {
    let h = Harness::new(fast_config());
    let (task, _) = h.add_task(h.schema(), contacts(3));

    let execution = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    h.finished(&execution).await;

    let events = h.monitor.events();
    assert!(matches!(
        events.first(),
        Some(SyncEvent::ExecutionStarted { triggered_by: TriggerSource::Manual, .. })
    ));
    let completed = events.iter().find_map(|event| match event {
        SyncEvent::ExecutionCompleted {
            task_id,
            status,
            records_processed,
            ..
        } => Some((*task_id, *status, *records_processed)),
        _ => None,
    });
    assert_eq!(completed, Some((task.id, ExecutionStatus::Success, 3)));
}

#[tokio::test]
async fn test_missing_schema_fails_without_fetch() {
    let h = Harness::new(fast_config());
    let (task, adapter) = h.add_task_without_schema(contacts(3));

    let execution = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    let done = h.finished(&execution).await;

    assert_eq!(done.status, ExecutionStatus::Failed);
    assert_eq!(done.records_processed, 0);
    let error = done.error.unwrap();
    assert_eq!(error.kind, ExecutionErrorKind::SchemaNotFound);
    assert!(error.message.contains("not found"));
    assert_eq!(adapter.fetch_count(), 0);
    assert!(h.monitor.metrics_named(RECORDS_FETCHED).is_empty());
}

#[tokio::test]
async fn test_adapter_failure_fails_execution() {
    let h = Harness::new(fast_config());
    let adapter: Arc<dyn IntegrationAdapter> =
        Arc::new(StaticAdapter::failing("connection refused"));
    let task = h.add_task_with_adapter(h.schema(), adapter);

    let execution = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    let done = h.finished(&execution).await;

    assert_eq!(done.status, ExecutionStatus::Failed);
    let error = done.error.unwrap();
    assert_eq!(error.kind, ExecutionErrorKind::Adapter);
    assert!(error.message.contains("connection refused"));
    assert_eq!(h.engine.get_statistics().executions_failed, 1);
}

#[tokio::test]
async fn test_bidirectional_merge_persists_resolved_value() {
    let h = Harness::new(fast_config());
    let existing = h
        .store
        .insert("contact", json!({ "external_id": "c-1", "name": "John" }))
        .unwrap();
    let schema = h
        .schema()
        .with_external_id("external_id")
        .with_bidirectional(ConflictStrategy::Merge);
    let (task, _) = h.add_task(schema, vec![json!({ "external_id": "c-1", "name": "Jonathan" })]);

    let execution = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    let done = h.finished(&execution).await;

    assert_eq!(done.status, ExecutionStatus::Success);
    assert_eq!(done.progress.conflicts, 1);
    assert_eq!(h.store.len(), 1);
    assert_eq!(
        h.store.get(&existing).unwrap().data,
        json!({ "external_id": "c-1", "name": "Jonathan" })
    );

    let conflicts = h.conflicts.for_execution(execution.id);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, "field_level");
    assert_eq!(conflicts[0].status, ConflictStatus::Resolved);
    assert_eq!(conflicts[0].local_data["name"], json!("John"));
    assert_eq!(conflicts[0].remote_data["name"], json!("Jonathan"));

    let stats = h.engine.get_statistics();
    assert_eq!(stats.conflicts_detected, 1);
    assert_eq!(stats.conflicts_auto_resolved, 1);
}

#[tokio::test]
async fn test_resolved_value_supersedes_transformed_payload() {
    let h = Harness::new(fast_config());
    let existing = h
        .store
        .insert("contact", json!({ "external_id": "c-1", "name": "John" }))
        .unwrap();
    let schema = h
        .schema()
        .with_external_id("external_id")
        .with_bidirectional(ConflictStrategy::PreferLocal);
    let (task, _) = h.add_task(
        schema,
        vec![json!({ "external_id": "c-1", "name": "Jonathan", "phone": "555" })],
    );

    let execution = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    h.finished(&execution).await;

    assert_eq!(
        h.store.get(&existing).unwrap().data,
        json!({ "external_id": "c-1", "name": "John", "phone": "555" })
    );
}

#[tokio::test]
async fn test_manual_conflict_stays_pending_until_resolved() {
    let h = Harness::new(fast_config());
    let existing = h
        .store
        .insert("contact", json!({ "external_id": "c-1", "name": "John" }))
        .unwrap();
    let schema = h
        .schema()
        .with_external_id("external_id")
        .with_bidirectional(ConflictStrategy::Manual);
    let (task, _) = h.add_task(schema, vec![json!({ "external_id": "c-1", "name": "Jonathan" })]);

    let execution = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    let done = h.finished(&execution).await;

    assert_eq!(done.status, ExecutionStatus::Success);
    assert_eq!(done.progress.skipped, 1);
    assert_eq!(done.records_processed, 1);
    assert_eq!(h.store.get(&existing).unwrap().data["name"], json!("John"));

    let pending = h
        .engine
        .list_pending_conflicts(h.tenant, Some(execution.id))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(h.engine.get_statistics().conflicts_pending, 1);

    // Other tenants cannot see or resolve it
    let foreign = h
        .engine
        .resolve_conflict(pending[0].id, TenantId::new(), None, json!({}))
        .await;
    assert!(matches!(foreign, Err(Error::NotFound(_))));

    let user = UserId::new();
    let resolution = json!({ "external_id": "c-1", "name": "Jon" });
    let resolved = h
        .engine
        .resolve_conflict(pending[0].id, h.tenant, Some(user), resolution.clone())
        .await
        .unwrap();

    assert_eq!(resolved.status, ConflictStatus::Resolved);
    assert_eq!(resolved.resolved_by, Some(user));
    assert_eq!(h.store.get(&existing).unwrap().data, resolution);
    assert!(h
        .engine
        .list_pending_conflicts(h.tenant, None)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(h.engine.get_statistics().conflicts_pending, 0);

    let again = h
        .engine
        .resolve_conflict(pending[0].id, h.tenant, None, json!({}))
        .await;
    assert!(matches!(again, Err(Error::InvalidState(_))));
}

#[tokio::test]
async fn test_target_config_controls_save() {
    let h = Harness::new(fast_config());
    h.store
        .insert("contact", json!({ "external_id": "c-0", "name": "Old" }))
        .unwrap();
    let schema = h.schema().with_external_id("external_id").with_target(TargetConfig {
        create_if_missing: false,
        update_if_exists: true,
    });
    let (task, _) = h.add_task(schema, contacts(3));

    let execution = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    let done = h.finished(&execution).await;

    // c-0 exists and is updated; c-1 and c-2 would need creating
    assert_eq!(done.status, ExecutionStatus::Success);
    assert_eq!(done.progress.succeeded, 1);
    assert_eq!(done.progress.skipped, 2);
    assert_eq!(done.records_processed, 3);
    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn test_duplicates_are_merged_into_one_target() {
    let h = Harness::new(fast_config());
    let first = h
        .store
        .insert("contact", json!({ "external_id": "c-1", "phone": "555" }))
        .unwrap();
    h.store
        .insert("contact", json!({ "external_id": "c-1", "email": "c@example.com" }))
        .unwrap();
    let schema = h.schema().with_external_id("external_id");
    let (task, _) = h.add_task(schema, vec![json!({ "external_id": "c-1", "name": "Carla" })]);

    let execution = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    let done = h.finished(&execution).await;

    assert_eq!(done.status, ExecutionStatus::Success);
    assert_eq!(h.store.len(), 1);
    assert_eq!(h.store.get(&first).unwrap().data["name"], json!("Carla"));
}

#[tokio::test]
async fn test_recover_interrupted_execution() {
    let h = Harness::new(fast_config());
    let (task, _) = h.add_task(h.schema(), contacts(1));

    // A running execution left behind by a previous process
    let orphan = SyncExecution::start(&task, TriggerSource::Manual, None, None);
    h.executions.insert(orphan.clone());

    let blocked = h.engine.trigger_sync(task.id, h.tenant, None).await;
    assert!(matches!(blocked, Err(Error::AlreadyRunning(_))));

    let recovered = h.engine.recover_interrupted().await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].id, orphan.id);
    assert_eq!(recovered[0].status, ExecutionStatus::Failed);
    assert_eq!(
        recovered[0].error.as_ref().map(|e| e.kind),
        Some(ExecutionErrorKind::Interrupted)
    );

    let retry = h
        .engine
        .retry_execution(orphan.id, h.tenant, None)
        .await
        .unwrap();
    let done = h.finished(&retry).await;
    assert_eq!(done.status, ExecutionStatus::Success);

    // Nothing left to recover
    assert!(h.engine.recover_interrupted().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_loop_triggers_due_tasks() {
    let h = Harness::new(fast_config().with_scheduler_interval(Duration::from_secs(60)));
    let (task, _) = h.add_task(h.schema(), contacts(2));
    h.tasks
        .insert(task.clone().with_schedule(TaskSchedule::every(3_600)));

    let (scheduler, join) = h.engine.spawn_scheduler();
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.engine.drain().await;

    let runs = h.executions.for_task(task.id);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].triggered_by, TriggerSource::Schedule);
    assert_eq!(runs[0].status, ExecutionStatus::Success);

    // Not due again until the interval elapses
    let report = scheduler.run_now().await.unwrap();
    assert!(report.triggered.is_empty());

    scheduler.shutdown().await;
    join.await.unwrap();
}

#[tokio::test]
async fn test_panicking_collaborator_fails_execution() {
    let h = Harness::build(fast_config(), |mut services, _, _| {
        services.shards = Arc::new(PanickingShardService);
        services
    });
    let (task, _) = h.add_task(h.schema(), contacts(1));

    let execution = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    let done = h.finished(&execution).await;

    assert_eq!(done.status, ExecutionStatus::Failed);
    assert!(done.completed_at.is_some());
    let error = done.error.unwrap();
    assert_eq!(error.kind, ExecutionErrorKind::Internal);
    assert!(error.message.contains("shard backend crashed"), "{}", error.message);

    let stats = h.engine.get_statistics();
    assert_eq!(stats.executions_running, 0);
    assert_eq!(stats.executions_failed, 1);
    assert_eq!(h.engine.running_count(), 0);
    assert_eq!(
        h.tasks.get(task.id).unwrap().last_run_status,
        Some(ExecutionStatus::Failed)
    );

    // The task is free to run again
    let again = h.engine.trigger_sync(task.id, h.tenant, None).await;
    assert!(again.is_ok());
    h.engine.drain().await;
}

#[tokio::test]
async fn test_concurrent_manual_resolutions_agree_with_entity() {
    let h = Harness::build(fast_config(), |mut services, _, _| {
        services.shards = Arc::new(YieldingShardService::new(services.shards.clone()));
        services
    });
    let existing = h
        .store
        .insert("contact", json!({ "external_id": "c-1", "name": "John" }))
        .unwrap();
    let schema = h
        .schema()
        .with_external_id("external_id")
        .with_bidirectional(ConflictStrategy::Manual);
    let (task, _) = h.add_task(schema, vec![json!({ "external_id": "c-1", "name": "Jonathan" })]);

    let execution = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    h.finished(&execution).await;
    let pending = h
        .engine
        .list_pending_conflicts(h.tenant, Some(execution.id))
        .await
        .unwrap();
    let conflict_id = pending[0].id;

    let (first, second) = tokio::join!(
        h.engine.resolve_conflict(
            conflict_id,
            h.tenant,
            None,
            json!({ "external_id": "c-1", "name": "A" })
        ),
        h.engine.resolve_conflict(
            conflict_id,
            h.tenant,
            None,
            json!({ "external_id": "c-1", "name": "B" })
        ),
    );

    let (winner, loser) = match (first, second) {
        (Ok(winner), Err(loser)) | (Err(loser), Ok(winner)) => (winner, loser),
        (first, second) => panic!("expected exactly one winner: {:?} / {:?}", first, second),
    };
    assert!(matches!(loser, Error::InvalidState(_)), "{}", loser);

    let stored = h.store.get(&existing).unwrap().data;
    assert_eq!(winner.resolution, Some(stored.clone()));
    let recorded = h.conflicts.for_execution(execution.id);
    assert_eq!(recorded[0].resolution, Some(stored));
    assert_eq!(h.engine.get_statistics().conflicts_pending, 0);
}

#[tokio::test]
async fn test_progress_phase_follows_current_record() {
    let h = Harness::new(fast_config());
    let schema = h.schema().map("email", "email", true);
    let (task, _) = h.add_task(
        schema,
        vec![json!({ "email": "a@example.com" }), json!({ "name": "no email" })],
    );

    let execution = h.engine.trigger_sync(task.id, h.tenant, None).await.unwrap();
    let done = h.finished(&execution).await;

    // The last record never got past transformation
    assert_eq!(done.status, ExecutionStatus::Partial);
    assert_eq!(done.progress.phase, SyncPhase::Transforming);
}
