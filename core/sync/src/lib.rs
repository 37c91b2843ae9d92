//! Integration sync execution engine
//!
//! This module runs sync tasks: it pulls records from an integration
//! adapter, transforms them against the task's conversion schema,
//! deduplicates and reconciles them against stored entities, and saves the
//! result. It provides:
//! - Trigger gating with one running execution per task
//! - Bounded, sequential batches with throttling between them
//! - Per-record retry with exponential backoff
//! - Bidirectional conflict handling
//! - Execution progress, completion and statistics bookkeeping
//! - A periodic due-task scheduler

pub mod batch;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod monitor;
mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use batch::BatchConfig;
pub use config::{EngineConfig, DEFAULT_DUE_TASK_LIMIT};
pub use conflict::{ConflictHandler, ConflictOutcome};
pub use engine::{DueTaskReport, SyncEngine, SyncServices};
pub use monitor::{
    MemoryMonitor, Metric, MetricKind, SyncEvent, SyncMonitor, TracingMonitor,
    EXECUTION_COMPLETED, EXECUTION_DURATION_MS, RECORDS_FETCHED,
};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{DueTaskScheduler, DueTaskSchedulerHandle, SchedulerRequest};
pub use state::{
    ConflictClaim, ConflictClaims, EngineStatistics, RunningGuard, RunningRegistry,
    StatisticsTracker,
};
