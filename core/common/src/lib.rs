//! Common types shared across the integration sync engine crates.
//!
//! This module provides the error taxonomy, strongly typed identifiers and
//! the persisted entities (tasks, executions, conflicts, schemas) that the
//! storage, connector and sync crates exchange.

pub mod error;
pub mod model;
pub mod types;

pub use error::{Error, Result};
pub use model::{
    BidirectionalConfig, ConflictStatus, ConflictStrategy, ConversionSchema, DedupConfig,
    ExecutionCompletion, ExecutionError, ExecutionErrorKind, ExecutionProgress, ExecutionStatus,
    ExecutionUpdate, FieldMapping, Record, RecordFailure, SyncConflict, SyncExecution, SyncPhase,
    SyncTask, TargetConfig, TaskSchedule, TaskStatus, TriggerSource, MAX_FAILURE_SAMPLES,
};
pub use types::{
    ConflictId, ExecutionId, IntegrationId, SchemaId, ShardId, TaskId, TenantId, UserId,
};
