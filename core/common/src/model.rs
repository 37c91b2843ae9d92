//! Persisted entities: sync tasks, executions, conflicts and the conversion
//! schema the engine reads.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    ConflictId, ExecutionId, IntegrationId, SchemaId, ShardId, TaskId, TenantId, UserId,
};
use crate::{Error, Result};

/// Maximum number of per-record failures kept on an execution.
pub const MAX_FAILURE_SAMPLES: usize = 50;

/// A raw or transformed record.
pub type Record = Value;

// ---------------------------------------------------------------------------
// Sync task
// ---------------------------------------------------------------------------

/// Whether a task may be triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Disabled,
}

/// Schedule metadata consulted by due-task queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSchedule {
    /// Whether the scheduler should pick this task up at all.
    #[serde(default)]
    pub enabled: bool,
    /// Cadence in seconds; `None` means one-shot.
    #[serde(default)]
    pub interval_secs: Option<u64>,
    /// Earliest time the task is due again.
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
}

impl TaskSchedule {
    /// A schedule that fires every `interval_secs` seconds, due immediately.
    pub fn every(interval_secs: u64) -> Self {
        Self {
            enabled: true,
            interval_secs: Some(interval_secs),
            next_run_at: None,
        }
    }

    /// Check whether the schedule is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.map_or(true, |next| next <= now)
    }
}

/// A tenant-scoped binding of an integration connection to a conversion
/// schema and a run cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTask {
    pub id: TaskId,
    pub tenant_id: TenantId,
    pub tenant_integration_id: IntegrationId,
    pub conversion_schema_id: SchemaId,
    pub status: TaskStatus,
    /// Adapter-specific query parameters (e.g. the remote entity name).
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub schedule: TaskSchedule,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_execution_id: Option<ExecutionId>,
    #[serde(default)]
    pub last_run_status: Option<ExecutionStatus>,
}

impl SyncTask {
    /// Create an active, unscheduled task.
    pub fn new(
        tenant_id: TenantId,
        tenant_integration_id: IntegrationId,
        conversion_schema_id: SchemaId,
        config: Value,
    ) -> Self {
        Self {
            id: TaskId::new(),
            tenant_id,
            tenant_integration_id,
            conversion_schema_id,
            status: TaskStatus::Active,
            config,
            schedule: TaskSchedule::default(),
            last_run_at: None,
            last_execution_id: None,
            last_run_status: None,
        }
    }

    /// Set the schedule.
    pub fn with_schedule(mut self, schedule: TaskSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Set the status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active
    }

    /// Record the outcome of a finished execution and advance the schedule.
    pub fn record_run(
        &mut self,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        finished_at: DateTime<Utc>,
    ) {
        self.last_run_at = Some(finished_at);
        self.last_execution_id = Some(execution_id);
        self.last_run_status = Some(status);
        if let Some(secs) = self.schedule.interval_secs {
            self.schedule.next_run_at = i64::try_from(secs)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|interval| finished_at.checked_add_signed(interval));
        }
    }
}

// ---------------------------------------------------------------------------
// Sync execution
// ---------------------------------------------------------------------------

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    /// Only failed or partially failed runs can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionStatus::Failed | ExecutionStatus::Partial)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Partial => "partial",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Schedule,
    Retry,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Schedule => "schedule",
            TriggerSource::Retry => "retry",
        }
    }
}

/// Pipeline phase reported in progress updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Pending,
    Fetching,
    Transforming,
    Saving,
}

/// Progress counters of a running execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub phase: SyncPhase,
    pub total_records: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub current_batch: usize,
    pub total_batches: usize,
}

impl Default for ExecutionProgress {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Pending,
            total_records: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            conflicts: 0,
            current_batch: 0,
            total_batches: 0,
        }
    }
}

/// Category of an execution-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    SchemaNotFound,
    Adapter,
    AllRecordsFailed,
    Interrupted,
    Internal,
}

/// Human-readable reason stored on a failed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A terminal failure of a single record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFailure {
    /// Position of the record in fetch order.
    pub index: usize,
    pub message: String,
}

/// One attempt to run a sync task to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncExecution {
    pub id: ExecutionId,
    pub sync_task_id: TaskId,
    pub tenant_id: TenantId,
    pub tenant_integration_id: IntegrationId,
    pub status: ExecutionStatus,
    pub triggered_by: TriggerSource,
    pub triggered_by_user_id: Option<UserId>,
    pub retry_of: Option<ExecutionId>,
    pub progress: ExecutionProgress,
    pub records_processed: usize,
    pub record_failures: Vec<RecordFailure>,
    pub error: Option<ExecutionError>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl SyncExecution {
    /// Create a running execution for `task`.
    ///
    /// `retry_of` is only kept when the trigger source is [`TriggerSource::Retry`].
    pub fn start(
        task: &SyncTask,
        triggered_by: TriggerSource,
        triggered_by_user_id: Option<UserId>,
        retry_of: Option<ExecutionId>,
    ) -> Self {
        let retry_of = match triggered_by {
            TriggerSource::Retry => retry_of,
            _ => None,
        };
        Self {
            id: ExecutionId::new(),
            sync_task_id: task.id,
            tenant_id: task.tenant_id,
            tenant_integration_id: task.tenant_integration_id,
            status: ExecutionStatus::Running,
            triggered_by,
            triggered_by_user_id,
            retry_of,
            progress: ExecutionProgress::default(),
            records_processed: 0,
            record_failures: Vec::new(),
            error: None,
            created_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        }
    }

    /// Apply an incremental update.
    ///
    /// # Errors
    /// - `InvalidState` if the execution has already completed
    pub fn apply_update(&mut self, update: ExecutionUpdate) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "execution {} is already {}",
                self.id, self.status
            )));
        }
        self.progress = update.progress;
        self.records_processed = update.records_processed;
        self.record_failures.extend(update.new_failures);
        self.record_failures.truncate(MAX_FAILURE_SAMPLES);
        Ok(())
    }

    /// Finalize the execution.
    ///
    /// # Errors
    /// - `InvalidState` if already completed or `completion.status` is `running`
    pub fn apply_completion(&mut self, completion: ExecutionCompletion) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "execution {} was already completed as {}",
                self.id, self.status
            )));
        }
        if !completion.status.is_terminal() {
            return Err(Error::InvalidInput(
                "cannot complete an execution as running".to_string(),
            ));
        }
        self.status = completion.status;
        self.records_processed = completion.records_processed;
        self.duration_ms = Some(completion.duration_ms);
        self.error = completion.error;
        if let Some(progress) = completion.progress {
            self.progress = progress;
        }
        self.completed_at = Some(Utc::now());
        Ok(())
    }
}

/// Incremental progress write for a running execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionUpdate {
    pub progress: ExecutionProgress,
    pub records_processed: usize,
    /// Failures observed since the previous update.
    pub new_failures: Vec<RecordFailure>,
}

impl ExecutionUpdate {
    /// A phase change with no new failures.
    pub fn progress(progress: ExecutionProgress) -> Self {
        Self {
            records_processed: progress.processed,
            progress,
            new_failures: Vec::new(),
        }
    }
}

/// The single terminal write of an execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionCompletion {
    pub status: ExecutionStatus,
    pub records_processed: usize,
    pub duration_ms: u64,
    pub error: Option<ExecutionError>,
    pub progress: Option<ExecutionProgress>,
}

impl ExecutionCompletion {
    /// A failed completion with no processed records.
    pub fn fatal(error: ExecutionError, duration_ms: u64) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            records_processed: 0,
            duration_ms,
            error: Some(error),
            progress: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Sync conflict
// ---------------------------------------------------------------------------

/// Resolution state of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

/// How a bidirectional conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Let the conflict engine combine both sides.
    Merge,
    /// Keep the stored value.
    PreferLocal,
    /// Take the incoming value.
    PreferRemote,
    /// Leave pending for a person to decide.
    Manual,
}

impl ConflictStrategy {
    pub fn is_automatic(&self) -> bool {
        !matches!(self, ConflictStrategy::Manual)
    }
}

/// A conflict between stored and incoming data for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: ConflictId,
    pub execution_id: ExecutionId,
    pub sync_task_id: TaskId,
    pub tenant_id: TenantId,
    pub entity_id: ShardId,
    /// e.g. `field_level`.
    pub conflict_type: String,
    pub fields: Vec<String>,
    pub local_data: Value,
    pub remote_data: Value,
    pub status: ConflictStatus,
    pub strategy: ConflictStrategy,
    pub resolution: Option<Value>,
    pub resolved_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl SyncConflict {
    /// Mark as resolved.
    ///
    /// # Errors
    /// - `InvalidState` if already resolved
    pub fn resolve(&mut self, resolution: Value, resolved_by: Option<UserId>) -> Result<()> {
        if self.status == ConflictStatus::Resolved {
            return Err(Error::InvalidState(format!(
                "conflict {} is already resolved",
                self.id
            )));
        }
        self.status = ConflictStatus::Resolved;
        self.resolution = Some(resolution);
        self.resolved_by = resolved_by;
        self.resolved_at = Some(Utc::now());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Conversion schema
// ---------------------------------------------------------------------------

/// Source → target field mapping, interpreted by the schema service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub required: bool,
}

/// Deduplication settings handed to the dedup service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default)]
    pub external_id_field: Option<String>,
    /// Opaque matching rules.
    #[serde(default)]
    pub rules: Vec<Value>,
}

/// Bidirectional sync settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidirectionalConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_strategy")]
    pub conflict_resolution: ConflictStrategy,
}

fn default_strategy() -> ConflictStrategy {
    ConflictStrategy::Merge
}

impl Default for BidirectionalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            conflict_resolution: default_strategy(),
        }
    }
}

/// Whether the save step may create and/or update entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "yes")]
    pub create_if_missing: bool,
    #[serde(default = "yes")]
    pub update_if_exists: bool,
}

fn yes() -> bool {
    true
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            update_if_exists: true,
        }
    }
}

/// Tenant-defined mapping, dedup and conflict configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionSchema {
    pub id: SchemaId,
    pub tenant_id: TenantId,
    pub name: String,
    /// Shard type records are converted into.
    pub target_type: String,
    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,
    #[serde(default)]
    pub deduplication: DedupConfig,
    #[serde(default)]
    pub bidirectional_sync: BidirectionalConfig,
    #[serde(default)]
    pub target: TargetConfig,
}

impl ConversionSchema {
    /// Create a schema with no mappings, dedup or bidirectional sync.
    pub fn new(tenant_id: TenantId, name: impl Into<String>, target_type: impl Into<String>) -> Self {
        Self {
            id: SchemaId::new(),
            tenant_id,
            name: name.into(),
            target_type: target_type.into(),
            field_mappings: Vec::new(),
            deduplication: DedupConfig::default(),
            bidirectional_sync: BidirectionalConfig::default(),
            target: TargetConfig::default(),
        }
    }

    /// Add a field mapping.
    pub fn map(mut self, source: impl Into<String>, target: impl Into<String>, required: bool) -> Self {
        self.field_mappings.push(FieldMapping {
            source: source.into(),
            target: target.into(),
            required,
        });
        self
    }

    /// Set the external id field used for deduplication.
    pub fn with_external_id(mut self, field: impl Into<String>) -> Self {
        self.deduplication.external_id_field = Some(field.into());
        self
    }

    /// Enable bidirectional sync with the given strategy.
    pub fn with_bidirectional(mut self, strategy: ConflictStrategy) -> Self {
        self.bidirectional_sync = BidirectionalConfig {
            enabled: true,
            conflict_resolution: strategy,
        };
        self
    }

    /// Set the target config.
    pub fn with_target(mut self, target: TargetConfig) -> Self {
        self.target = target;
        self
    }
}
