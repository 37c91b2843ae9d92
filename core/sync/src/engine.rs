//! Sync engine: trigger gating, execution lifecycle and the operations the
//! rest of the system calls.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use intsync_common::{
    ConflictId, ConflictStatus, Error, ExecutionCompletion, ExecutionError, ExecutionErrorKind,
    ExecutionId, ExecutionStatus, Result, SyncConflict, SyncExecution, SyncTask, TaskId, TenantId,
    TriggerSource, UserId,
};
use intsync_connectors::{
    AdapterRegistry, BidirectionalEngine, DedupService, SchemaService, ShardService, ShardWrite,
};
use intsync_storage::{ConflictRepository, ExecutionRepository, TaskRepository};

use crate::config::EngineConfig;
use crate::conflict::ConflictHandler;
use crate::monitor::{SyncEvent, SyncMonitor};
use crate::pipeline::ExecutionRun;
use crate::retry::RetryExecutor;
use crate::scheduler::DueTaskScheduler;
use crate::state::{ConflictClaims, EngineStatistics, RunningRegistry, StatisticsTracker};

/// Collaborators the engine orchestrates.
#[derive(Clone)]
pub struct SyncServices {
    pub tasks: Arc<dyn TaskRepository>,
    pub executions: Arc<dyn ExecutionRepository>,
    pub conflicts: Arc<dyn ConflictRepository>,
    pub adapters: Arc<dyn AdapterRegistry>,
    pub schemas: Arc<dyn SchemaService>,
    pub dedup: Arc<dyn DedupService>,
    pub shards: Arc<dyn ShardService>,
    pub bidirectional: Arc<dyn BidirectionalEngine>,
    pub monitor: Arc<dyn SyncMonitor>,
}

/// Outcome of one `process_due_tasks` pass.
#[derive(Debug, Clone, Default)]
pub struct DueTaskReport {
    /// Executions started by this pass.
    pub triggered: Vec<SyncExecution>,
    /// Tasks that were not started, with the reason.
    pub skipped: Vec<(TaskId, String)>,
}

impl DueTaskReport {
    pub fn is_empty(&self) -> bool {
        self.triggered.is_empty() && self.skipped.is_empty()
    }
}

/// State shared between the engine handle and running pipelines.
pub(crate) struct EngineInner {
    pub(crate) services: SyncServices,
    pub(crate) config: EngineConfig,
    pub(crate) retry: RetryExecutor,
    pub(crate) conflicts: ConflictHandler,
    pub(crate) registry: Arc<RunningRegistry>,
    pub(crate) claims: Arc<ConflictClaims>,
    pub(crate) stats: StatisticsTracker,
}

/// Main engine for running integration sync tasks.
///
/// Cheap to clone; clones share the running registry, statistics and the
/// set of in-flight pipelines.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    tracker: TaskTracker,
}

impl SyncEngine {
    /// Create a new engine.
    ///
    /// # Errors
    /// - `InvalidInput` if `config` does not validate
    pub fn new(services: SyncServices, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let conflicts = ConflictHandler::new(
            services.bidirectional.clone(),
            services.conflicts.clone(),
        );
        let inner = EngineInner {
            retry: RetryExecutor::new(config.retry.clone()),
            conflicts,
            registry: Arc::new(RunningRegistry::new()),
            claims: Arc::new(ConflictClaims::new()),
            stats: StatisticsTracker::new(),
            services,
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
            tracker: TaskTracker::new(),
        })
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Start a manual execution of `task_id`.
    ///
    /// Returns as soon as the execution record exists; the pipeline runs in
    /// the background.
    ///
    /// # Errors
    /// - `NotFound` if the task does not exist for `tenant_id`
    /// - `InvalidState` if the task is disabled
    /// - `AlreadyRunning` if the task has a running execution
    pub async fn trigger_sync(
        &self,
        task_id: TaskId,
        tenant_id: TenantId,
        user_id: Option<UserId>,
    ) -> Result<SyncExecution> {
        self.start_execution(task_id, tenant_id, user_id, TriggerSource::Manual, None)
            .await
    }

    /// Start a new execution re-running a failed or partial one.
    ///
    /// # Errors
    /// - `NotFound` if the execution does not exist for `tenant_id`
    /// - `InvalidState` unless the execution is failed or partial
    /// - any error of [`trigger_sync`](Self::trigger_sync)
    pub async fn retry_execution(
        &self,
        execution_id: ExecutionId,
        tenant_id: TenantId,
        user_id: Option<UserId>,
    ) -> Result<SyncExecution> {
        let previous = self.get_execution(execution_id, tenant_id).await?;
        if !previous.status.is_retryable() {
            return Err(Error::InvalidState(
                "Can only retry failed or partial executions".to_string(),
            ));
        }

        self.start_execution(
            previous.sync_task_id,
            tenant_id,
            user_id,
            TriggerSource::Retry,
            Some(previous.id),
        )
        .await
    }

    /// Trigger every due task, up to the configured limit.
    ///
    /// Ineligible tasks are skipped and reported; only a failure to query
    /// due tasks is returned as an error.
    pub async fn process_due_tasks(&self) -> Result<DueTaskReport> {
        let limit = self.inner.config.due_task_limit;
        let due = self.inner.services.tasks.find_due_tasks(limit).await?;
        let mut report = DueTaskReport::default();

        for candidate in due {
            let task_id = candidate.id;
            match self
                .start_execution(task_id, candidate.tenant_id, None, TriggerSource::Schedule, None)
                .await
            {
                Ok(execution) => report.triggered.push(execution),
                Err(err) => {
                    if err.is_eligibility() {
                        debug!(%task_id, "Skipping due task: {}", err);
                    } else {
                        warn!(%task_id, "Failed to trigger due task: {}", err);
                    }
                    report.skipped.push((task_id, err.to_string()));
                }
            }
        }

        if !report.is_empty() {
            info!(
                triggered = report.triggered.len(),
                skipped = report.skipped.len(),
                "Processed due tasks"
            );
        }
        Ok(report)
    }

    /// Snapshot of the in-process counters.
    pub fn get_statistics(&self) -> EngineStatistics {
        self.inner.stats.snapshot()
    }

    /// Number of executions running in this process.
    pub fn running_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Load an execution for polling.
    ///
    /// # Errors
    /// - `NotFound` if it does not exist for `tenant_id`
    pub async fn get_execution(
        &self,
        execution_id: ExecutionId,
        tenant_id: TenantId,
    ) -> Result<SyncExecution> {
        self.inner
            .services
            .executions
            .find_by_id(execution_id)
            .await?
            .filter(|execution| execution.tenant_id == tenant_id)
            .ok_or_else(|| Error::NotFound(format!("Sync execution {} not found", execution_id)))
    }

    /// Pending conflicts of a tenant, optionally for one execution.
    pub async fn list_pending_conflicts(
        &self,
        tenant_id: TenantId,
        execution_id: Option<ExecutionId>,
    ) -> Result<Vec<SyncConflict>> {
        self.inner
            .services
            .conflicts
            .list_pending(tenant_id, execution_id)
            .await
    }

    /// Settle a pending conflict by hand.
    ///
    /// The conflict is claimed for the whole call, then the resolution is
    /// written to the conflicting entity before the conflict is marked
    /// resolved.
    ///
    /// # Errors
    /// - `NotFound` if the conflict does not exist for `tenant_id`
    /// - `InvalidState` if it is already resolved or being resolved
    pub async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        tenant_id: TenantId,
        user_id: Option<UserId>,
        resolution: Value,
    ) -> Result<SyncConflict> {
        let services = &self.inner.services;
        self.load_conflict(conflict_id, tenant_id).await?;
        let _claim = self.inner.claims.try_claim(conflict_id)?;

        // Re-read under the claim; a resolution may have finished meanwhile
        let conflict = self.load_conflict(conflict_id, tenant_id).await?;
        if conflict.status == ConflictStatus::Resolved {
            return Err(Error::InvalidState(format!(
                "Sync conflict {} is already resolved",
                conflict_id
            )));
        }

        match self.target_type_for(conflict.sync_task_id).await? {
            Some(target_type) => {
                services
                    .shards
                    .create_shards_from_integration_data(ShardWrite {
                        target_type,
                        data: resolution.clone(),
                        existing: Some(conflict.entity_id.clone()),
                    })
                    .await?;
            }
            None => warn!(
                %conflict_id,
                "Schema for conflict is gone; recording resolution without writing the entity"
            ),
        }

        let resolved = services
            .conflicts
            .resolve(conflict_id, resolution, user_id)
            .await?;
        self.inner.stats.conflict_resolved_manually();

        info!(%conflict_id, entity = %resolved.entity_id, "Resolved sync conflict");
        Ok(resolved)
    }

    /// Fail every execution the repository reports as running that this
    /// process is not running, e.g. after a crash.
    ///
    /// Recovered executions become eligible for [`retry_execution`](Self::retry_execution).
    pub async fn recover_interrupted(&self) -> Result<Vec<SyncExecution>> {
        let services = &self.inner.services;
        let running = services.executions.find_running().await?;
        let mut recovered = Vec::new();

        for execution in running {
            if self.inner.registry.contains_execution(execution.id) {
                continue;
            }

            let duration_ms = u64::try_from(
                (Utc::now() - execution.created_at).num_milliseconds().max(0),
            )
            .unwrap_or(0);
            let completion = ExecutionCompletion {
                status: ExecutionStatus::Failed,
                records_processed: execution.records_processed,
                duration_ms,
                error: Some(ExecutionError::new(
                    ExecutionErrorKind::Interrupted,
                    "Execution was interrupted before completion",
                )),
                progress: None,
            };

            match services.executions.complete(execution.id, completion).await {
                Ok(failed) => {
                    warn!(
                        execution_id = %failed.id,
                        task_id = %failed.sync_task_id,
                        "Marked interrupted execution as failed"
                    );
                    self.inner
                        .stats
                        .execution_completed(ExecutionStatus::Failed, &failed.progress, false);
                    services.monitor.record_event(&SyncEvent::ExecutionCompleted {
                        execution_id: failed.id,
                        task_id: failed.sync_task_id,
                        tenant_id: failed.tenant_id,
                        status: failed.status,
                        records_processed: failed.records_processed,
                        duration_ms,
                        error: failed.error.clone(),
                    });
                    recovered.push(failed);
                }
                Err(err) => warn!(
                    execution_id = %execution.id,
                    "Failed to recover interrupted execution: {}", err
                ),
            }
        }

        Ok(recovered)
    }

    /// Wait for every in-flight pipeline to finish.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Spawn the due-task loop at the configured interval.
    ///
    /// Returns the scheduler for on-demand runs and shutdown, and the join
    /// handle of the loop.
    pub fn spawn_scheduler(&self) -> (DueTaskScheduler, JoinHandle<()>) {
        let (scheduler, handle) = DueTaskScheduler::new(self.inner.config.scheduler_interval());
        let engine = self.clone();
        let join = tokio::spawn(handle.run(move || {
            let engine = engine.clone();
            async move { engine.process_due_tasks().await }
        }));
        (scheduler, join)
    }

    /// Gate, register and spawn an execution.
    async fn start_execution(
        &self,
        task_id: TaskId,
        tenant_id: TenantId,
        user_id: Option<UserId>,
        triggered_by: TriggerSource,
        retry_of: Option<ExecutionId>,
    ) -> Result<SyncExecution> {
        let services = &self.inner.services;
        let task = self.load_task(task_id, tenant_id).await?;
        if !task.is_active() {
            return Err(Error::InvalidState(format!(
                "Sync task {} is disabled",
                task_id
            )));
        }

        let execution = SyncExecution::start(&task, triggered_by, user_id, retry_of);
        let guard = self.inner.registry.try_acquire(task.id, execution.id)?;

        if let Some(running) = services.executions.find_running_for_task(task.id).await? {
            return Err(Error::AlreadyRunning(format!(
                "task {} is already running as execution {}",
                task.id, running.id
            )));
        }
        services.executions.create(&execution).await?;

        self.inner.stats.execution_started();
        services.monitor.record_event(&SyncEvent::ExecutionStarted {
            execution_id: execution.id,
            task_id: task.id,
            tenant_id: task.tenant_id,
            triggered_by,
        });

        let run = ExecutionRun::new(self.inner.clone(), task, execution.clone());
        self.tracker.spawn(run.run(guard));

        Ok(execution)
    }

    async fn load_task(&self, task_id: TaskId, tenant_id: TenantId) -> Result<SyncTask> {
        self.inner
            .services
            .tasks
            .find_by_id(task_id)
            .await?
            .filter(|task| task.tenant_id == tenant_id)
            .ok_or_else(|| Error::NotFound(format!("Sync task {} not found", task_id)))
    }

    async fn load_conflict(
        &self,
        conflict_id: ConflictId,
        tenant_id: TenantId,
    ) -> Result<SyncConflict> {
        self.inner
            .services
            .conflicts
            .find_by_id(conflict_id)
            .await?
            .filter(|conflict| conflict.tenant_id == tenant_id)
            .ok_or_else(|| Error::NotFound(format!("Sync conflict {} not found", conflict_id)))
    }

    async fn target_type_for(&self, task_id: TaskId) -> Result<Option<String>> {
        let services = &self.inner.services;
        let Some(task) = services.tasks.find_by_id(task_id).await? else {
            return Ok(None);
        };
        Ok(services
            .schemas
            .get_schema(task.conversion_schema_id)
            .await?
            .map(|schema| schema.target_type))
    }
}
