//! Repository trait definitions for the three persisted entity kinds.

use async_trait::async_trait;
use serde_json::Value;

use intsync_common::{
    ConflictId, ExecutionCompletion, ExecutionId, ExecutionUpdate, Result, SyncConflict,
    SyncExecution, SyncTask, TaskId, TenantId, UserId,
};

/// Storage for sync task configuration.
///
/// Tasks are created by the owning configuration flow; the engine only
/// reads them and writes last-run bookkeeping back.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Load a task by id.
    async fn find_by_id(&self, id: TaskId) -> Result<Option<SyncTask>>;

    /// Replace a stored task.
    ///
    /// # Errors
    /// - `NotFound` if the task does not exist
    async fn update(&self, task: &SyncTask) -> Result<()>;

    /// Return up to `limit` active tasks whose schedule is due now,
    /// earliest first.
    async fn find_due_tasks(&self, limit: usize) -> Result<Vec<SyncTask>>;
}

/// Storage for execution records.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Persist a new execution.
    ///
    /// Implementations backed by shared storage should make this a
    /// conditional write that fails with `AlreadyRunning` when the task
    /// already has a running execution.
    async fn create(&self, execution: &SyncExecution) -> Result<()>;

    /// Apply an incremental progress update to a running execution.
    async fn update(&self, id: ExecutionId, update: ExecutionUpdate) -> Result<()>;

    /// Finalize an execution. Must only succeed once per execution.
    async fn complete(&self, id: ExecutionId, completion: ExecutionCompletion)
        -> Result<SyncExecution>;

    /// Load an execution by id.
    async fn find_by_id(&self, id: ExecutionId) -> Result<Option<SyncExecution>>;

    /// The running execution of a task, if any.
    async fn find_running_for_task(&self, task_id: TaskId) -> Result<Option<SyncExecution>>;

    /// All executions currently marked running.
    async fn find_running(&self) -> Result<Vec<SyncExecution>>;
}

/// Storage for bidirectional sync conflicts.
#[async_trait]
pub trait ConflictRepository: Send + Sync {
    /// Persist a newly detected conflict.
    async fn create(&self, conflict: &SyncConflict) -> Result<()>;

    /// Pending conflicts of a tenant, optionally narrowed to one execution.
    async fn list_pending(
        &self,
        tenant_id: TenantId,
        execution_id: Option<ExecutionId>,
    ) -> Result<Vec<SyncConflict>>;

    /// Load a conflict by id.
    async fn find_by_id(&self, id: ConflictId) -> Result<Option<SyncConflict>>;

    /// Mark a conflict resolved.
    ///
    /// # Errors
    /// - `NotFound` if the conflict does not exist
    /// - `InvalidState` if it was already resolved
    async fn resolve(
        &self,
        id: ConflictId,
        resolution: Value,
        resolved_by: Option<UserId>,
    ) -> Result<SyncConflict>;
}
