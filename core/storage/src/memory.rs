//! In-memory repositories for testing and local runs.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use intsync_common::{
    ConflictId, ConflictStatus, Error, ExecutionCompletion, ExecutionId, ExecutionStatus,
    ExecutionUpdate, Result, SyncConflict, SyncExecution, SyncTask, TaskId, TenantId, UserId,
};

use crate::repository::{ConflictRepository, ExecutionRepository, TaskRepository};

/// Shared map guarded by a std lock; never held across an await.
#[derive(Debug)]
struct Table<K, V> {
    rows: Arc<RwLock<HashMap<K, V>>>,
}

impl<K, V> Table<K, V> {
    fn new() -> Self {
        Self {
            rows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<K, V>> {
        self.rows.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, V>> {
        self.rows.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V> Clone for Table<K, V> {
    fn clone(&self) -> Self {
        Self {
            rows: self.rows.clone(),
        }
    }
}

/// In-memory task repository.
///
/// Clones share the same underlying storage.
#[derive(Debug, Clone)]
pub struct MemoryTaskRepository {
    tasks: Table<TaskId, SyncTask>,
}

impl MemoryTaskRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self { tasks: Table::new() }
    }

    /// Insert or replace a task.
    pub fn insert(&self, task: SyncTask) {
        self.tasks.write().insert(task.id, task);
    }

    /// Snapshot of a task, for assertions.
    pub fn get(&self, id: TaskId) -> Option<SyncTask> {
        self.tasks.read().get(&id).cloned()
    }

    /// Number of stored tasks.
    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryTaskRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn find_by_id(&self, id: TaskId) -> Result<Option<SyncTask>> {
        Ok(self.tasks.read().get(&id).cloned())
    }

    async fn update(&self, task: &SyncTask) -> Result<()> {
        let mut tasks = self.tasks.write();
        match tasks.get_mut(&task.id) {
            Some(stored) => {
                *stored = task.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("sync task {}", task.id))),
        }
    }

    async fn find_due_tasks(&self, limit: usize) -> Result<Vec<SyncTask>> {
        let now = Utc::now();
        let mut due: Vec<SyncTask> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.is_active() && t.schedule.is_due(now))
            .cloned()
            .collect();

        // Never-run tasks first, then by due time.
        due.sort_by_key(|t| (t.schedule.next_run_at, t.id));
        due.truncate(limit);
        Ok(due)
    }
}

/// In-memory execution repository.
///
/// `create` is a conditional write: it refuses a second running execution
/// for the same task.
#[derive(Debug, Clone)]
pub struct MemoryExecutionRepository {
    executions: Table<ExecutionId, SyncExecution>,
}

impl MemoryExecutionRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self {
            executions: Table::new(),
        }
    }

    /// Insert an execution as-is, bypassing the running check.
    pub fn insert(&self, execution: SyncExecution) {
        self.executions.write().insert(execution.id, execution);
    }

    /// All executions of a task, oldest first.
    pub fn for_task(&self, task_id: TaskId) -> Vec<SyncExecution> {
        let mut executions: Vec<SyncExecution> = self
            .executions
            .read()
            .values()
            .filter(|e| e.sync_task_id == task_id)
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.created_at);
        executions
    }

    /// Count executions by status.
    pub fn count_by_status(&self) -> HashMap<ExecutionStatus, usize> {
        let mut counts = HashMap::new();
        for execution in self.executions.read().values() {
            *counts.entry(execution.status).or_insert(0) += 1;
        }
        counts
    }

    /// Total number of stored executions.
    pub fn len(&self) -> usize {
        self.executions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryExecutionRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionRepository for MemoryExecutionRepository {
    async fn create(&self, execution: &SyncExecution) -> Result<()> {
        let mut executions = self.executions.write();

        if executions.contains_key(&execution.id) {
            return Err(Error::InvalidInput(format!(
                "execution {} already exists",
                execution.id
            )));
        }

        if execution.status == ExecutionStatus::Running {
            if let Some(running) = executions.values().find(|e| {
                e.sync_task_id == execution.sync_task_id && e.status == ExecutionStatus::Running
            }) {
                return Err(Error::AlreadyRunning(format!(
                    "task {} has running execution {}",
                    execution.sync_task_id, running.id
                )));
            }
        }

        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update(&self, id: ExecutionId, update: ExecutionUpdate) -> Result<()> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("sync execution {}", id)))?;
        execution.apply_update(update)
    }

    async fn complete(
        &self,
        id: ExecutionId,
        completion: ExecutionCompletion,
    ) -> Result<SyncExecution> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("sync execution {}", id)))?;
        execution.apply_completion(completion)?;
        Ok(execution.clone())
    }

    async fn find_by_id(&self, id: ExecutionId) -> Result<Option<SyncExecution>> {
        Ok(self.executions.read().get(&id).cloned())
    }

    async fn find_running_for_task(&self, task_id: TaskId) -> Result<Option<SyncExecution>> {
        Ok(self
            .executions
            .read()
            .values()
            .find(|e| e.sync_task_id == task_id && e.status == ExecutionStatus::Running)
            .cloned())
    }

    async fn find_running(&self) -> Result<Vec<SyncExecution>> {
        Ok(self
            .executions
            .read()
            .values()
            .filter(|e| e.status == ExecutionStatus::Running)
            .cloned()
            .collect())
    }
}

/// In-memory conflict repository.
#[derive(Debug, Clone)]
pub struct MemoryConflictRepository {
    conflicts: Table<ConflictId, SyncConflict>,
}

impl MemoryConflictRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self {
            conflicts: Table::new(),
        }
    }

    /// All conflicts recorded for an execution.
    pub fn for_execution(&self, execution_id: ExecutionId) -> Vec<SyncConflict> {
        let mut conflicts: Vec<SyncConflict> = self
            .conflicts
            .read()
            .values()
            .filter(|c| c.execution_id == execution_id)
            .cloned()
            .collect();
        conflicts.sort_by_key(|c| c.created_at);
        conflicts
    }

    pub fn len(&self) -> usize {
        self.conflicts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryConflictRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConflictRepository for MemoryConflictRepository {
    async fn create(&self, conflict: &SyncConflict) -> Result<()> {
        let mut conflicts = self.conflicts.write();
        if conflicts.contains_key(&conflict.id) {
            return Err(Error::InvalidInput(format!(
                "conflict {} already exists",
                conflict.id
            )));
        }
        conflicts.insert(conflict.id, conflict.clone());
        Ok(())
    }

    async fn list_pending(
        &self,
        tenant_id: TenantId,
        execution_id: Option<ExecutionId>,
    ) -> Result<Vec<SyncConflict>> {
        let mut pending: Vec<SyncConflict> = self
            .conflicts
            .read()
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.status == ConflictStatus::Pending)
            .filter(|c| execution_id.map_or(true, |id| c.execution_id == id))
            .cloned()
            .collect();
        pending.sort_by_key(|c| c.created_at);
        Ok(pending)
    }

    async fn find_by_id(&self, id: ConflictId) -> Result<Option<SyncConflict>> {
        Ok(self.conflicts.read().get(&id).cloned())
    }

    async fn resolve(
        &self,
        id: ConflictId,
        resolution: Value,
        resolved_by: Option<UserId>,
    ) -> Result<SyncConflict> {
        let mut conflicts = self.conflicts.write();
        let conflict = conflicts
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("sync conflict {}", id)))?;
        conflict.resolve(resolution, resolved_by)?;
        Ok(conflict.clone())
    }
}
