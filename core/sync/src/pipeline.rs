//! The per-execution pipeline: resolve schema, fetch, then transform,
//! deduplicate, reconcile and save every record in bounded batches.

use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use intsync_common::{
    ConflictId, ConversionSchema, Error, ExecutionCompletion, ExecutionError, ExecutionErrorKind,
    ExecutionProgress, ExecutionStatus, ExecutionUpdate, Record, RecordFailure, Result, ShardId,
    SyncExecution, SyncPhase, SyncTask, MAX_FAILURE_SAMPLES,
};
use intsync_connectors::{ShardWrite, TransformOutcome};

use crate::conflict::ConflictOutcome;
use crate::engine::EngineInner;
use crate::monitor::{
    Metric, SyncEvent, EXECUTION_COMPLETED, EXECUTION_DURATION_MS, RECORDS_FETCHED,
};
use crate::state::RunningGuard;

/// Terminal outcome of a single record.
#[derive(Debug)]
enum RecordOutcome {
    Saved,
    Skipped(&'static str),
    Failed(String),
}

/// Turn a transform outcome into the payload or a classified error.
///
/// A failure is recoverable only if every reported issue is.
fn transformed(outcome: TransformOutcome) -> Result<Record> {
    if outcome.success {
        return outcome
            .data
            .ok_or_else(|| Error::transform("transform succeeded without data", false));
    }

    let recoverable =
        !outcome.errors.is_empty() && outcome.errors.iter().all(|issue| issue.recoverable);
    let message = if outcome.errors.is_empty() {
        "transform failed".to_string()
    } else {
        outcome
            .errors
            .iter()
            .map(|issue| issue.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    };
    Err(Error::transform(message, recoverable))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// State of one running execution.
pub(crate) struct ExecutionRun {
    inner: Arc<EngineInner>,
    task: SyncTask,
    execution: SyncExecution,
    started: Instant,
    progress: ExecutionProgress,
    /// Failures not yet written to the repository.
    new_failures: Vec<RecordFailure>,
    failures_kept: usize,
}

impl ExecutionRun {
    pub(crate) fn new(inner: Arc<EngineInner>, task: SyncTask, execution: SyncExecution) -> Self {
        Self {
            inner,
            task,
            execution,
            started: Instant::now(),
            progress: ExecutionProgress::default(),
            new_failures: Vec::new(),
            failures_kept: 0,
        }
    }

    /// Drive the execution to completion, then release the task.
    ///
    /// A panicking collaborator fails the execution instead of leaving it
    /// running.
    pub(crate) async fn run(mut self, guard: RunningGuard) {
        let outcome = match AssertUnwindSafe(self.execute()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(ExecutionError::new(
                ExecutionErrorKind::Internal,
                format!("Sync pipeline panicked: {}", panic_message(&*panic)),
            )),
        };
        let duration_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let completion = match outcome {
            Ok(()) => self.classify(duration_ms),
            Err(error) => {
                error!(
                    execution_id = %self.execution.id,
                    task_id = %self.task.id,
                    kind = ?error.kind,
                    "Sync execution failed: {}",
                    error.message
                );
                ExecutionCompletion::fatal(error, duration_ms)
            }
        };

        self.finish(completion).await;
        drop(guard);
    }

    async fn execute(&mut self) -> std::result::Result<(), ExecutionError> {
        let inner = self.inner.clone();
        let schema = self.resolve_schema().await?;

        self.progress.phase = SyncPhase::Fetching;
        self.write_progress().await;

        let records = self.fetch().await?;
        let total = records.len();
        inner.stats.records_fetched(total);
        inner.services.monitor.record_metric(
            &Metric::counter(RECORDS_FETCHED, total as f64)
                .tag("task_id", self.task.id.to_string())
                .tag("tenant_id", self.task.tenant_id.to_string()),
        );

        let batch_size = inner.config.batch.batch_size.max(1);
        let delay = inner.config.batch.delay_between_batches();
        self.progress.total_records = total;
        self.progress.total_batches = inner.config.batch.batch_count(total);

        info!(
            execution_id = %self.execution.id,
            records = total,
            batches = self.progress.total_batches,
            "Fetched records"
        );

        for (batch_index, chunk) in records.chunks(batch_size).enumerate() {
            if batch_index > 0 && !delay.is_zero() {
                sleep(delay).await;
            }
            self.progress.current_batch = batch_index + 1;

            for (offset, record) in chunk.iter().enumerate() {
                let outcome = self.process_record(&schema, record).await;
                self.tally(batch_index * batch_size + offset, outcome);
            }

            debug!(
                execution_id = %self.execution.id,
                batch = self.progress.current_batch,
                of = self.progress.total_batches,
                succeeded = self.progress.succeeded,
                failed = self.progress.failed,
                "Processed batch"
            );
            self.write_progress().await;
        }

        Ok(())
    }

    async fn resolve_schema(&self) -> std::result::Result<ConversionSchema, ExecutionError> {
        let schema_id = self.task.conversion_schema_id;
        match self.inner.services.schemas.get_schema(schema_id).await {
            Ok(Some(schema)) if schema.tenant_id == self.task.tenant_id => Ok(schema),
            Ok(_) => Err(ExecutionError::new(
                ExecutionErrorKind::SchemaNotFound,
                format!("Conversion schema {} not found", schema_id),
            )),
            Err(err) => Err(ExecutionError::new(
                ExecutionErrorKind::Internal,
                format!("Failed to load conversion schema {}: {}", schema_id, err),
            )),
        }
    }

    async fn fetch(&self) -> std::result::Result<Vec<Record>, ExecutionError> {
        let adapter = self
            .inner
            .services
            .adapters
            .resolve(self.task.tenant_id, self.task.tenant_integration_id)
            .await
            .map_err(|err| ExecutionError::new(ExecutionErrorKind::Adapter, err.to_string()))?;

        let fetched = adapter.fetch(&self.task.config).await.map_err(|err| {
            ExecutionError::new(
                ExecutionErrorKind::Adapter,
                format!("{} fetch failed: {}", adapter.name(), err),
            )
        })?;

        Ok(fetched.data)
    }

    async fn process_record(&mut self, schema: &ConversionSchema, record: &Record) -> RecordOutcome {
        self.progress.phase = SyncPhase::Transforming;
        let inner = self.inner.clone();
        let retry = &inner.retry;
        let schemas = &inner.services.schemas;
        let dedup = &inner.services.dedup;
        let shards = &inner.services.shards;

        let data = match retry
            .execute(move || async move { transformed(schemas.transform(schema, record).await?) })
            .await
        {
            Ok(data) => data,
            Err(err) => return RecordOutcome::Failed(err.to_string()),
        };

        let dedup_config = &schema.deduplication;
        let candidate = &data;
        let duplicates = match retry
            .execute(move || async move { dedup.find_duplicates(dedup_config, candidate).await })
            .await
        {
            Ok(ids) => ids,
            Err(err) => return RecordOutcome::Failed(format!("deduplication: {}", err)),
        };

        let target: Option<ShardId> = match duplicates.as_slice() {
            [] => None,
            [single] => Some(single.clone()),
            ids => match retry
                .execute(move || async move { dedup.merge_duplicates(ids).await })
                .await
            {
                Ok(merged) => Some(merged),
                Err(err) => return RecordOutcome::Failed(format!("merge duplicates: {}", err)),
            },
        };

        let mut payload = data;
        if schema.bidirectional_sync.enabled {
            if let Some(entity_id) = &target {
                let local = match retry
                    .execute(move || async move { shards.get_shard_data(entity_id).await })
                    .await
                {
                    Ok(local) => local,
                    Err(err) => return RecordOutcome::Failed(format!("load local data: {}", err)),
                };

                if let Some(local) = local {
                    let outcome = inner
                        .conflicts
                        .reconcile(
                            &self.execution,
                            entity_id,
                            &local,
                            &payload,
                            schema.bidirectional_sync.conflict_resolution,
                        )
                        .await;

                    match outcome {
                        Ok(ConflictOutcome::NoConflict) => {}
                        Ok(ConflictOutcome::Resolved { conflict_id, value }) => {
                            self.conflict_detected(conflict_id, entity_id, true);
                            payload = value;
                        }
                        Ok(ConflictOutcome::Pending { conflict_id }) => {
                            self.conflict_detected(conflict_id, entity_id, false);
                            return RecordOutcome::Skipped("conflict pending manual resolution");
                        }
                        Err(err) => {
                            return RecordOutcome::Failed(format!("conflict resolution: {}", err))
                        }
                    }
                }
            }
        }

        let write = match (target, schema.target) {
            (None, config) if config.create_if_missing => ShardWrite {
                target_type: schema.target_type.clone(),
                data: payload,
                existing: None,
            },
            (Some(existing), config) if config.update_if_exists => ShardWrite {
                target_type: schema.target_type.clone(),
                data: payload,
                existing: Some(existing),
            },
            (None, _) => return RecordOutcome::Skipped("creating entities is disabled"),
            (Some(_), _) => return RecordOutcome::Skipped("updating entities is disabled"),
        };

        self.progress.phase = SyncPhase::Saving;
        let saved = retry
            .execute(move || {
                let write = write.clone();
                async move { shards.create_shards_from_integration_data(write).await }
            })
            .await;

        match saved {
            Ok(result) => {
                debug!(
                    execution_id = %self.execution.id,
                    shard = %result.primary_shard_id,
                    derived = result.derived_shard_ids.len(),
                    "Saved record"
                );
                RecordOutcome::Saved
            }
            Err(err) => RecordOutcome::Failed(format!("save: {}", err)),
        }
    }

    fn conflict_detected(
        &mut self,
        conflict_id: ConflictId,
        entity_id: &ShardId,
        auto_resolved: bool,
    ) {
        self.progress.conflicts += 1;
        self.inner.stats.conflict_detected(auto_resolved);
        self.inner.services.monitor.record_event(&SyncEvent::ConflictDetected {
            conflict_id,
            execution_id: self.execution.id,
            entity_id: entity_id.clone(),
            auto_resolved,
        });
    }

    fn tally(&mut self, index: usize, outcome: RecordOutcome) {
        self.progress.processed += 1;
        match outcome {
            RecordOutcome::Saved => self.progress.succeeded += 1,
            RecordOutcome::Skipped(reason) => {
                debug!(execution_id = %self.execution.id, index, "Skipped record: {}", reason);
                self.progress.skipped += 1;
            }
            RecordOutcome::Failed(message) => {
                warn!(execution_id = %self.execution.id, index, "Record failed: {}", message);
                self.progress.failed += 1;
                if self.failures_kept < MAX_FAILURE_SAMPLES {
                    self.failures_kept += 1;
                    self.new_failures.push(RecordFailure { index, message });
                }
            }
        }
    }

    /// Write counters and new failure samples; a failed write is logged and
    /// does not affect the run.
    async fn write_progress(&mut self) {
        let update = ExecutionUpdate {
            progress: self.progress.clone(),
            records_processed: self.progress.processed,
            new_failures: std::mem::take(&mut self.new_failures),
        };
        if let Err(err) = self
            .inner
            .services
            .executions
            .update(self.execution.id, update)
            .await
        {
            warn!(
                execution_id = %self.execution.id,
                "Failed to write execution progress: {}", err
            );
        }
    }

    fn classify(&self, duration_ms: u64) -> ExecutionCompletion {
        let progress = &self.progress;
        let status = if progress.failed == 0 {
            ExecutionStatus::Success
        } else if progress.succeeded + progress.skipped > 0 {
            ExecutionStatus::Partial
        } else {
            ExecutionStatus::Failed
        };

        let error = (status == ExecutionStatus::Failed).then(|| {
            ExecutionError::new(
                ExecutionErrorKind::AllRecordsFailed,
                format!("All {} records failed", progress.failed),
            )
        });

        ExecutionCompletion {
            status,
            records_processed: progress.succeeded + progress.failed + progress.skipped,
            duration_ms,
            error,
            progress: Some(progress.clone()),
        }
    }

    async fn finish(&self, completion: ExecutionCompletion) {
        let inner = &self.inner;
        let status = completion.status;
        let records_processed = completion.records_processed;
        let duration_ms = completion.duration_ms;
        let error = completion.error.clone();

        if let Err(err) = inner
            .services
            .executions
            .complete(self.execution.id, completion)
            .await
        {
            error!(
                execution_id = %self.execution.id,
                "Failed to complete sync execution: {}", err
            );
        }

        inner.stats.execution_completed(status, &self.progress, true);

        let monitor = &inner.services.monitor;
        monitor.record_metric(
            &Metric::counter(EXECUTION_COMPLETED, 1.0)
                .tag("status", status.as_str())
                .tag("task_id", self.task.id.to_string()),
        );
        monitor.record_metric(
            &Metric::histogram(EXECUTION_DURATION_MS, duration_ms as f64)
                .tag("status", status.as_str())
                .tag("task_id", self.task.id.to_string()),
        );
        monitor.record_event(&SyncEvent::ExecutionCompleted {
            execution_id: self.execution.id,
            task_id: self.task.id,
            tenant_id: self.task.tenant_id,
            status,
            records_processed,
            duration_ms,
            error,
        });

        self.record_task_run(status).await;
    }

    /// Write last-run bookkeeping onto a fresh copy of the task.
    async fn record_task_run(&self, status: ExecutionStatus) {
        let tasks = &self.inner.services.tasks;
        match tasks.find_by_id(self.task.id).await {
            Ok(Some(mut task)) => {
                task.record_run(self.execution.id, status, Utc::now());
                if let Err(err) = tasks.update(&task).await {
                    warn!(task_id = %self.task.id, "Failed to record task run: {}", err);
                }
            }
            Ok(None) => warn!(task_id = %self.task.id, "Task disappeared during execution"),
            Err(err) => warn!(task_id = %self.task.id, "Failed to reload task: {}", err),
        }
    }
}
