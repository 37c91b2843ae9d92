//! In-process engine state: the running-task registry and statistics.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use intsync_common::{
    ConflictId, Error, ExecutionId, ExecutionProgress, ExecutionStatus, Result, TaskId,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracks which task currently has an execution in this process.
///
/// Check-and-insert happens under one lock, so two concurrent triggers for
/// the same task can never both acquire it.
#[derive(Debug, Default)]
pub struct RunningRegistry {
    running: Mutex<HashMap<TaskId, ExecutionId>>,
}

impl RunningRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `task_id` for `execution_id`.
    ///
    /// The claim is released when the returned guard is dropped.
    ///
    /// # Errors
    /// - `AlreadyRunning` if the task is already claimed
    pub fn try_acquire(
        self: &Arc<Self>,
        task_id: TaskId,
        execution_id: ExecutionId,
    ) -> Result<RunningGuard> {
        let mut running = lock(&self.running);
        if let Some(existing) = running.get(&task_id) {
            return Err(Error::AlreadyRunning(format!(
                "task {} is already running as execution {}",
                task_id, existing
            )));
        }
        running.insert(task_id, execution_id);

        Ok(RunningGuard {
            registry: self.clone(),
            task_id,
            execution_id,
        })
    }

    /// The execution currently holding `task_id`, if any.
    pub fn get(&self, task_id: TaskId) -> Option<ExecutionId> {
        lock(&self.running).get(&task_id).copied()
    }

    /// Whether `execution_id` is running in this process.
    pub fn contains_execution(&self, execution_id: ExecutionId) -> bool {
        lock(&self.running).values().any(|id| *id == execution_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.running).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, task_id: TaskId, execution_id: ExecutionId) {
        let mut running = lock(&self.running);
        if running.get(&task_id) == Some(&execution_id) {
            running.remove(&task_id);
        }
    }
}

/// Claim on a task; releases the registry entry on drop.
#[derive(Debug)]
pub struct RunningGuard {
    registry: Arc<RunningRegistry>,
    task_id: TaskId,
    execution_id: ExecutionId,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.registry.release(self.task_id, self.execution_id);
    }
}

/// Conflicts whose manual resolution is in progress in this process.
#[derive(Debug, Default)]
pub struct ConflictClaims {
    claimed: Mutex<HashSet<ConflictId>>,
}

impl ConflictClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `conflict_id` until the returned guard is dropped.
    ///
    /// # Errors
    /// - `InvalidState` if another resolution holds the claim
    pub fn try_claim(self: &Arc<Self>, conflict_id: ConflictId) -> Result<ConflictClaim> {
        if !lock(&self.claimed).insert(conflict_id) {
            return Err(Error::InvalidState(format!(
                "Sync conflict {} is already being resolved",
                conflict_id
            )));
        }
        Ok(ConflictClaim {
            claims: self.clone(),
            conflict_id,
        })
    }
}

/// Claim on a conflict; released on drop.
#[derive(Debug)]
pub struct ConflictClaim {
    claims: Arc<ConflictClaims>,
    conflict_id: ConflictId,
}

impl Drop for ConflictClaim {
    fn drop(&mut self) {
        lock(&self.claims.claimed).remove(&self.conflict_id);
    }
}

/// Aggregate counters for dashboards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatistics {
    pub executions_started: u64,
    pub executions_running: u64,
    pub executions_succeeded: u64,
    pub executions_partial: u64,
    pub executions_failed: u64,
    pub records_fetched: u64,
    pub records_succeeded: u64,
    pub records_failed: u64,
    pub records_skipped: u64,
    pub conflicts_detected: u64,
    pub conflicts_auto_resolved: u64,
    pub conflicts_pending: u64,
}

impl EngineStatistics {
    /// Completed executions keyed by terminal status.
    pub fn by_status(&self) -> HashMap<ExecutionStatus, u64> {
        HashMap::from([
            (ExecutionStatus::Running, self.executions_running),
            (ExecutionStatus::Success, self.executions_succeeded),
            (ExecutionStatus::Partial, self.executions_partial),
            (ExecutionStatus::Failed, self.executions_failed),
        ])
    }

    /// Executions that reached a terminal status.
    pub fn executions_completed(&self) -> u64 {
        self.executions_succeeded + self.executions_partial + self.executions_failed
    }
}

/// Thread-safe statistics updated at the same points the repositories are
/// written.
#[derive(Debug, Default)]
pub struct StatisticsTracker {
    stats: Mutex<EngineStatistics>,
}

impl StatisticsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution_started(&self) {
        let mut stats = lock(&self.stats);
        stats.executions_started += 1;
        stats.executions_running += 1;
    }

    pub fn records_fetched(&self, count: usize) {
        lock(&self.stats).records_fetched += count as u64;
    }

    /// Record a terminal status.
    ///
    /// `was_running` is false for executions completed on behalf of another
    /// process (crash recovery), which were never counted as running here.
    pub fn execution_completed(
        &self,
        status: ExecutionStatus,
        progress: &ExecutionProgress,
        was_running: bool,
    ) {
        let mut stats = lock(&self.stats);
        if was_running {
            stats.executions_running = stats.executions_running.saturating_sub(1);
        }
        match status {
            ExecutionStatus::Success => stats.executions_succeeded += 1,
            ExecutionStatus::Partial => stats.executions_partial += 1,
            ExecutionStatus::Failed => stats.executions_failed += 1,
            ExecutionStatus::Running => {}
        }
        stats.records_succeeded += progress.succeeded as u64;
        stats.records_failed += progress.failed as u64;
        stats.records_skipped += progress.skipped as u64;
    }

    pub fn conflict_detected(&self, auto_resolved: bool) {
        let mut stats = lock(&self.stats);
        stats.conflicts_detected += 1;
        if auto_resolved {
            stats.conflicts_auto_resolved += 1;
        } else {
            stats.conflicts_pending += 1;
        }
    }

    pub fn conflict_resolved_manually(&self) {
        let mut stats = lock(&self.stats);
        stats.conflicts_pending = stats.conflicts_pending.saturating_sub(1);
    }

    /// Consistent snapshot of all counters.
    pub fn snapshot(&self) -> EngineStatistics {
        lock(&self.stats).clone()
    }
}
